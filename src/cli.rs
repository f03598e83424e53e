use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bitcoin::consensus::encode;
use bitcoin::{Amount, Network as BitcoinNetwork, ScriptBuf, TxOut};
use clap::{Parser, Subcommand};

use crate::analyzer::analyze;
use crate::broadcaster::{EsploraBroadcaster, finalize_and_broadcast};
use crate::codec::{self, Format};
use crate::config::{CreateConfig, KeyStoreConfig, load_json};
use crate::error::AppError;
use crate::finalizer::{extract_transaction, finalize};
use crate::merge::merge_all;
use crate::model;
use crate::signer::{KeyStoreSigner, SignOptions, SignScope, sign};
use crate::transaction::create_unsigned_psbt;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct CliArgs {
    /// 使用するネットワーク ("bitcoin", "testnet", "signet", "regtest")
    #[clap(short, long, value_parser, global = true, default_value = "testnet")]
    pub network: String,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// UTXOと出力を記述したJSONから未署名PSBTを作成する
    Create {
        #[clap(short, long, value_parser)]
        input_file: PathBuf,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum, default_value = "base64")]
        format: Format,
    },
    /// PSBTを分析し、次に必要な役割をJSONで表示する
    Analyze {
        psbt: PathBuf,
    },
    /// 入力に witness UTXO を付与する
    Update {
        psbt: PathBuf,
        #[clap(long)]
        index: usize,
        #[clap(long)]
        value_sats: u64,
        #[clap(long)]
        script_pubkey_hex: String,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum, default_value = "base64")]
        format: Format,
    },
    /// 同じトランザクションに対する複数のPSBTをマージする
    Merge {
        #[clap(required = true, num_args = 1..)]
        psbts: Vec<PathBuf>,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum, default_value = "base64")]
        format: Format,
    },
    /// 鍵ストアJSONの秘密鍵で署名する (オフライン機で実行する)
    Sign {
        psbt: PathBuf,
        #[clap(short, long, value_parser)]
        keys_file: PathBuf,
        /// 署名後に確定できる入力を確定する
        #[clap(long)]
        finalize: bool,
        /// 単独で入力を確定できない署名は追加しない
        #[clap(long)]
        no_partial: bool,
        /// 署名する入力インデックス (省略時は全入力)
        #[clap(long, value_delimiter = ',')]
        inputs: Vec<usize>,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum, default_value = "base64")]
        format: Format,
    },
    /// 署名の揃った入力を確定する
    Finalize {
        psbt: PathBuf,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum, default_value = "base64")]
        format: Format,
    },
    /// 確定済みPSBTからraw transaction hexを取り出す
    Extract {
        psbt: PathBuf,
        #[clap(short, long, value_parser)]
        output_file: Option<PathBuf>,
    },
    /// 確定してEsploraに送信する
    Broadcast {
        psbt: PathBuf,
        #[clap(long)]
        esplora_url: Option<String>,
        #[clap(long, default_value_t = 30)]
        timeout_secs: u64,
    },
    /// バイナリとbase64を相互変換する
    Convert {
        psbt: PathBuf,
        #[clap(short, long, value_parser)]
        output_file: PathBuf,
        #[clap(short, long, value_enum)]
        format: Format,
    },
}

pub fn parse_network(network_str: &str) -> Result<BitcoinNetwork, AppError> {
    match network_str.to_lowercase().as_str() {
        "bitcoin" | "mainnet" => Ok(BitcoinNetwork::Bitcoin),
        "testnet" => Ok(BitcoinNetwork::Testnet),
        "signet" => Ok(BitcoinNetwork::Signet),
        "regtest" => Ok(BitcoinNetwork::Regtest),
        s => Err(AppError::InputValidation(format!("無効なネットワークが指定されました: {}", s))),
    }
}

fn load_signer(keys_file: &Path, network: BitcoinNetwork) -> Result<KeyStoreSigner, AppError> {
    let key_store: KeyStoreConfig = load_json(keys_file)?;
    log::debug!("鍵ストアのパース成功: {:?}", key_store);
    let store_network = parse_network(&key_store.network)?;
    if store_network != network {
        return Err(AppError::NetworkMismatch {
            cli_network: format!("{:?}", network),
            inferred_network: format!("{:?}", store_network),
        });
    }
    KeyStoreSigner::from_wif(&key_store.private_keys_wif, network)
}

/// サブコマンドを実行する
pub fn run(command: Command, network: BitcoinNetwork) -> Result<(), AppError> {
    match command {
        Command::Create { input_file, output_file, format } => {
            let config: CreateConfig = load_json(&input_file)?;
            log::debug!("入力設定ファイルのパース成功: {:?}", config);
            let psbt = create_unsigned_psbt(config, network)?;
            codec::save_psbt(&psbt, &output_file, format)?;
            println!("{}", codec::to_text(&codec::encode(&psbt)));
        }
        Command::Analyze { psbt } => {
            let psbt = codec::load_psbt(&psbt)?;
            let analysis = analyze(&psbt, network);
            let json = serde_json::to_string_pretty(&analysis)
                .map_err(|e| AppError::Internal(format!("分析結果のJSON化に失敗しました: {}", e)))?;
            println!("{}", json);
        }
        Command::Update { psbt: path, index, value_sats, script_pubkey_hex, output_file, format } => {
            let mut psbt = codec::load_psbt(&path)?;
            let script_pubkey = hex::decode(&script_pubkey_hex)
                .map(ScriptBuf::from_bytes)
                .map_err(|e| AppError::InputValidation(format!("scriptPubKeyHexのデコード失敗: {}", e)))?;
            model::set_witness_utxo(&mut psbt, index, TxOut { value: Amount::from_sat(value_sats), script_pubkey })?;
            codec::save_psbt(&psbt, &output_file, format)?;
        }
        Command::Merge { psbts, output_file, format } => {
            let loaded = psbts.iter().map(codec::load_psbt).collect::<Result<Vec<_>, _>>()?;
            let merged = merge_all(loaded)?;
            codec::save_psbt(&merged, &output_file, format)?;
        }
        Command::Sign { psbt: path, keys_file, finalize, no_partial, inputs, output_file, format } => {
            let signer = load_signer(&keys_file, network)?;
            let mut psbt = codec::load_psbt(&path)?;
            let options = SignOptions {
                finalize,
                allow_partial: !no_partial,
                scope: if inputs.is_empty() {
                    SignScope::All
                } else {
                    SignScope::Inputs(inputs.into_iter().collect::<BTreeSet<_>>())
                },
                ..SignOptions::default()
            };
            let complete = sign(&mut psbt, &signer, &options)?;
            codec::save_psbt(&psbt, &output_file, format)?;
            println!("complete: {}", complete);
        }
        Command::Finalize { psbt: path, output_file, format } => {
            let mut psbt = codec::load_psbt(&path)?;
            let complete = finalize(&mut psbt);
            codec::save_psbt(&psbt, &output_file, format)?;
            println!("complete: {}", complete);
        }
        Command::Extract { psbt, output_file } => {
            let psbt = codec::load_psbt(&psbt)?;
            let tx = extract_transaction(&psbt)?;
            let serialized_tx = encode::serialize_hex(&tx);
            log::info!("Raw transaction hex: {}", serialized_tx);
            println!("{}", serialized_tx);
            if let Some(output_file) = output_file {
                fs::write(&output_file, serialized_tx.as_bytes()).map_err(|e| {
                    log::error!("出力ファイルへの書き込みに失敗しました: {:?}", output_file);
                    AppError::Io(e)
                })?;
                log::info!("Raw transactionを {:?} に保存しました。", output_file);
            }
        }
        Command::Broadcast { psbt, esplora_url, timeout_secs } => {
            let psbt = codec::load_psbt(&psbt)?;
            let url = esplora_url.unwrap_or_else(|| EsploraBroadcaster::default_url(network).to_string());
            let broadcaster = EsploraBroadcaster::new(&url, Duration::from_secs(timeout_secs))?;
            let txid = finalize_and_broadcast(&psbt, &broadcaster)?;
            println!("{}", txid);
        }
        Command::Convert { psbt, output_file, format } => {
            let psbt = codec::load_psbt(&psbt)?;
            codec::save_psbt(&psbt, &output_file, format)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_network() {
        assert_eq!(parse_network("Signet").unwrap(), BitcoinNetwork::Signet);
        assert_eq!(parse_network("mainnet").unwrap(), BitcoinNetwork::Bitcoin);
        assert!(matches!(parse_network("litecoin"), Err(AppError::InputValidation(_))));
    }

    #[test]
    fn test_cli_parses_sign_subcommand() {
        let args = CliArgs::try_parse_from([
            "psbt-cosigner", "-n", "regtest", "sign", "in.psbt", "-k", "keys.json", "--inputs", "0,2",
            "--finalize", "-o", "out.psbt", "-f", "binary",
        ])
        .unwrap();
        assert_eq!(args.network, "regtest");
        match args.command {
            Command::Sign { inputs, finalize, no_partial, format, .. } => {
                assert_eq!(inputs, vec![0, 2]);
                assert!(finalize);
                assert!(!no_partial);
                assert_eq!(format, Format::Binary);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_sign_finalize_extract_through_files() {
        let dir = TempDir::new().unwrap();
        let key = test_key(1);
        let (psbt, _) = p2wpkh_psbt(&key, 50_000, 40_000);
        let unsigned = dir.path().join("unsigned.psbt");
        let signed = dir.path().join("signed.psbt");
        let finalized = dir.path().join("final.psbt");
        let tx_hex = dir.path().join("tx.hex");
        let keys = dir.path().join("keys.json");
        codec::save_psbt(&psbt, &unsigned, Format::Base64).unwrap();
        fs::write(&keys, format!(r#"{{"network":"testnet","privateKeysWif":["{}"]}}"#, key.to_wif())).unwrap();

        let sign_cmd = Command::Sign {
            psbt: unsigned,
            keys_file: keys.clone(),
            finalize: false,
            no_partial: false,
            inputs: Vec::new(),
            output_file: signed.clone(),
            format: Format::Binary,
        };
        run(sign_cmd, BitcoinNetwork::Testnet).unwrap();
        run(
            Command::Finalize { psbt: signed, output_file: finalized.clone(), format: Format::Base64 },
            BitcoinNetwork::Testnet,
        )
        .unwrap();
        run(Command::Extract { psbt: finalized, output_file: Some(tx_hex.clone()) }, BitcoinNetwork::Testnet).unwrap();

        let hex_str = fs::read_to_string(&tx_hex).unwrap();
        let tx: bitcoin::Transaction = encode::deserialize(&hex::decode(hex_str.trim()).unwrap()).unwrap();
        assert_eq!(tx.compute_txid(), psbt.unsigned_tx.compute_txid());
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_key_store_network_must_match() {
        let dir = TempDir::new().unwrap();
        let keys = dir.path().join("keys.json");
        fs::write(&keys, r#"{"network":"regtest","privateKeysWif":[]}"#).unwrap();
        assert!(matches!(
            load_signer(&keys, BitcoinNetwork::Testnet),
            Err(AppError::NetworkMismatch { .. })
        ));
    }
}
