use std::path::PathBuf;
use bitcoin::Txid;
use bitcoin::consensus::encode::Error as BitcoinEncodeError;
use bitcoin::key::FromWifError as BitcoinKeyError; // WIFデコードエラー用
use thiserror::Error;

use crate::broadcaster::BroadcastErrorKind;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/Oエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSONパースエラー ファイル: {file_path:?}, 詳細: {source}")]
    JsonParse {
        file_path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// PSBTバイナリの構造が不正 (切り詰め、長さ不正、入出力数の不一致など)
    #[error("PSBTバイナリが不正です: {0}")]
    MalformedEncoding(String),

    /// base64 テキスト層のエラー。PSBTのパースより前に検出される
    #[error("base64テキストが不正です: {0}")]
    InvalidText(#[from] base64::DecodeError),

    #[error("異なるトランザクションのPSBTはマージできません: base={base}, incoming={incoming}")]
    IncompatibleTransactions { base: Txid, incoming: Txid },

    #[error("同じ公開鍵に異なる署名があります (入力インデックス {input_index}, 鍵 {key})")]
    InconsistentSignature { input_index: usize, key: String },

    #[error("マージ時にデータが衝突しました ({location}: {field})")]
    ConflictingData { location: String, field: &'static str },

    #[error("署名者が利用できません: {0}")]
    SignerUnavailable(String),

    #[error("署名エラー (入力インデックス {input_index}): {detail}")]
    SignerFailure { input_index: usize, detail: String },

    #[error("ブロードキャストに失敗しました ({kind:?}): {detail}")]
    BroadcastRejected { kind: BroadcastErrorKind, detail: String },

    #[error("入力 {input_index} は確定済みのため変更できません")]
    InputFinalized { input_index: usize },

    #[error("入力インデックス {input_index} は範囲外です (入力数 {input_count})")]
    InputIndexOutOfRange { input_index: usize, input_count: usize },

    #[error("入力 {input_index} がまだ確定されていません")]
    NotFinalized { input_index: usize },

    #[error("ワークフローの状態エラー: {0}")]
    WorkflowState(String),

    #[error("Bitcoinコンセンサスエンコードエラー: {0}")]
    BitcoinConsensus(#[from] BitcoinEncodeError),

    #[error("Bitcoin秘密鍵(WIF)処理エラー: {0}")]
    BitcoinKey(#[from] BitcoinKeyError),

    #[error("ネットワーク不整合: CLI指定 ({cli_network}) vs WIF/アドレス ({inferred_network})")]
    NetworkMismatch {
        cli_network: String,
        inferred_network: String,
    },

    #[error("入力検証エラー: {0}")]
    InputValidation(String),

    #[error("資金不足: 利用可能な総額 {available} sats, 要求額 {required} sats (手数料 {fee} sats を含む)")]
    InsufficientFunds {
        available: u64,
        required: u64,
        fee: u64,
    },

    #[error("おつりアドレスの導出に失敗しました: {0}")]
    ChangeAddressDerivation(String),

    #[error("不明なスクリプトタイプ: {script_hex}")]
    UnknownScriptType { script_hex: String },

    #[error("内部エラー: {0}")]
    Internal(String),
}

impl AppError {
    /// 再試行や別の署名者・ノードで回復できる可能性があるエラーかどうか
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::SignerUnavailable(_) | AppError::SignerFailure { .. } => true,
            AppError::BroadcastRejected { kind, .. } => *kind == BroadcastErrorKind::Transport,
            _ => false,
        }
    }
}

impl From<bitcoin::psbt::Error> for AppError {
    fn from(e: bitcoin::psbt::Error) -> Self {
        AppError::MalformedEncoding(e.to_string())
    }
}
