use bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, Sequence, SignedAmount, Transaction, TxOut, script::Script};
use serde::Serialize;

use crate::error::AppError;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ScriptType {
    P2PKH,
    P2WPKH,
    P2SH,
    P2WSH,
    P2TR,
}

impl ScriptType {
    pub fn from_script_buf(script: &Script) -> Result<Self, AppError> {
        if script.is_p2pkh() {
            Ok(ScriptType::P2PKH)
        } else if script.is_p2wpkh() {
            Ok(ScriptType::P2WPKH)
        } else if script.is_p2sh() {
            Ok(ScriptType::P2SH)
        } else if script.is_p2wsh() {
            Ok(ScriptType::P2WSH)
        } else if script.is_p2tr() {
            Ok(ScriptType::P2TR)
        } else {
            Err(AppError::UnknownScriptType { script_hex: script.to_hex_string() })
        }
    }
}

/// 作成時に検証済みのUTXO
#[derive(Debug)]
pub struct ProcessedUtxo {
    pub out_point: OutPoint,
    pub tx_out: TxOut, // 元の value と script_pubkey を含む
    pub script_type: ScriptType,
    pub sequence: Sequence,
    pub previous_tx: Option<Transaction>,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
}

/// PSBT のワークフロー上の役割 (Creator → Updater → Signer → Finalizer → Extractor)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Updater,
    Signer,
    Finalizer,
    Extractor,
}

/// 入力を確定できない理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum Missing {
    Utxo,
    RedeemScript,
    WitnessScript,
    Signatures {
        /// まだ署名していない公開鍵 (分かる範囲で)
        keys: Vec<PublicKey>,
        /// 確定に必要な残り署名数
        needed: usize,
    },
    UnsupportedScript { script: ScriptBuf },
    /// 指定したインデックスの入力が存在しない
    NoSuchInput { input_count: usize },
}

impl Missing {
    /// この不足を解消すべき役割
    pub fn responsible_role(&self) -> Role {
        match self {
            Missing::Signatures { .. } => Role::Signer,
            _ => Role::Updater,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputStatus {
    pub index: usize,
    pub has_utxo: bool,
    pub is_final: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing: Option<Missing>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputSummary {
    pub index: usize,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub amount: Amount,
    pub script_pubkey: ScriptBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Analysis {
    pub inputs: Vec<InputStatus>,
    pub all_final: bool,
    pub all_signed: bool,
    pub next_role: Role,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub fee: Option<SignedAmount>,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub input_total: Option<Amount>,
    #[serde(with = "bitcoin::amount::serde::as_sat::opt")]
    pub output_total: Option<Amount>,
    pub outputs: Vec<OutputSummary>,
    pub estimated_vsize: Option<usize>,
    pub estimated_fee_rate: Option<f64>,
}
