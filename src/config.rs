use std::fs;
use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;

use crate::error::AppError;

/// `create` サブコマンドの入力
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct CreateConfig {
    pub network: String, // "bitcoin", "testnet", "signet", "regtest"
    pub utxos: Vec<UtxoInput>,
    pub outputs: Vec<TransactionOutputDef>,
    pub fee_rate_sats_per_vb: u64,
    pub change_address: String,
    #[serde(default)]
    pub default_sequence: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct UtxoInput {
    pub txid: String,
    pub vout: u32,
    #[serde(rename = "scriptPubKeyHex")]
    pub script_pubkey_hex: String,
    pub value_sats: u64,
    /// 前トランザクション全体 (レガシー入力の署名者が金額を検証できるように)
    #[serde(default)]
    pub previous_tx_hex: Option<String>,
    #[serde(default)]
    pub redeem_script_hex: Option<String>,
    #[serde(default)]
    pub witness_script_hex: Option<String>,
    #[serde(default)]
    pub sequence: Option<u32>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutputDef {
    pub address: String,
    pub value_sats: u64,
}

/// オフライン署名機の鍵ストア
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStoreConfig {
    pub network: String,
    pub private_keys_wif: Vec<String>,
}

impl std::fmt::Debug for KeyStoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStoreConfig")
            .field("network", &self.network)
            .field("private_keys_wif", &format_args!("<{} 件>", self.private_keys_wif.len()))
            .finish()
    }
}

pub fn load_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T, AppError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| {
        log::error!("入力ファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    serde_json::from_str(&content).map_err(|e| {
        log::error!("入力JSONのパースに失敗しました: {:?}", path);
        AppError::JsonParse { file_path: path.to_path_buf(), source: e }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_create_config() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "network": "testnet",
                "utxos": [{{ "txid": "00", "vout": 1, "scriptPubKeyHex": "0014", "valueSats": 1000,
                             "witnessScriptHex": "51" }}],
                "outputs": [{{ "address": "tb1q", "valueSats": 500 }}],
                "feeRateSatsPerVb": 2,
                "changeAddress": "tb1q"
            }}"#
        )
        .unwrap();
        let config: CreateConfig = load_json(file.path()).unwrap();
        assert_eq!(config.utxos[0].vout, 1);
        assert_eq!(config.utxos[0].script_pubkey_hex, "0014");
        assert_eq!(config.utxos[0].witness_script_hex.as_deref(), Some("51"));
        assert!(config.utxos[0].previous_tx_hex.is_none());
        assert_eq!(config.default_sequence, None);
    }

    #[test]
    fn test_load_errors_are_typed() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ \"network\": ").unwrap();
        assert!(matches!(load_json::<KeyStoreConfig, _>(file.path()), Err(AppError::JsonParse { .. })));
        assert!(matches!(
            load_json::<KeyStoreConfig, _>("/nonexistent/keys.json"),
            Err(AppError::Io(_))
        ));
    }

    #[test]
    fn test_key_store_debug_hides_keys() {
        let config = KeyStoreConfig {
            network: "testnet".to_string(),
            private_keys_wif: vec!["cVt4o7BGAig1UXywgGSmARhxMdzP5qvQsxKkSsc1XEkw3tDTQFpy".to_string()],
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("cVt4"));
        assert!(rendered.contains("testnet"));
    }
}
