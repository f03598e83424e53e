//! Broadcaster Adapter

use std::str::FromStr;
use std::time::Duration;

use bitcoin::consensus::encode::serialize_hex;
use bitcoin::psbt::Psbt;
use bitcoin::{Network, Transaction, Txid};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;

use crate::error::AppError;
use crate::finalizer::{extract_transaction, finalize};

/// ブロードキャスト失敗の分類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastErrorKind {
    /// 接続失敗・タイムアウトなど。再試行できる
    Transport,
    /// ノードがトランザクションを拒否した
    Rejected,
    /// 応答が解釈できない
    InvalidResponse,
}

pub trait Broadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError>;
}

fn rejected(kind: BroadcastErrorKind, detail: impl Into<String>) -> AppError {
    AppError::BroadcastRejected { kind, detail: detail.into() }
}

/// Esplora REST API (`POST {base_url}/tx`) への送信
pub struct EsploraBroadcaster {
    base_url: String,
    client: Client,
}

impl EsploraBroadcaster {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| rejected(BroadcastErrorKind::Transport, e.to_string()))?;
        Ok(EsploraBroadcaster { base_url: base_url.trim_end_matches('/').to_string(), client })
    }

    /// ネットワークごとの公開 Esplora エンドポイント
    pub fn default_url(network: Network) -> &'static str {
        match network {
            Network::Bitcoin => "https://blockstream.info/api",
            Network::Testnet => "https://blockstream.info/testnet/api",
            Network::Signet => "https://mempool.space/signet/api",
            _ => "http://127.0.0.1:3002",
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Broadcaster for EsploraBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError> {
        let url = format!("{}/tx", self.base_url);
        log::info!("トランザクションを送信します: {}", url);
        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, "text/plain")
            .body(serialize_hex(tx))
            .send()
            .map_err(|e| {
                log::error!("ノードへの接続に失敗しました: {}", e);
                rejected(BroadcastErrorKind::Transport, e.to_string())
            })?;

        let status = response.status();
        let body = response
            .text()
            .map_err(|e| rejected(BroadcastErrorKind::Transport, e.to_string()))?;
        let txid = parse_response(status, &body)?;
        if txid != tx.compute_txid() {
            log::warn!("ノードが返したTXID {} が送信したトランザクションと一致しません。", txid);
        }
        Ok(txid)
    }
}

/// Esplora の応答を分類する。2xx 以外は拒否 (本文に理由)、2xx なら本文は TXID。
fn parse_response(status: StatusCode, body: &str) -> Result<Txid, AppError> {
    let body = body.trim();
    if !status.is_success() {
        log::warn!("トランザクションが拒否されました ({}): {}", status, body);
        return Err(rejected(BroadcastErrorKind::Rejected, format!("HTTP {}: {}", status, body)));
    }
    Txid::from_str(body).map_err(|e| {
        rejected(BroadcastErrorKind::InvalidResponse, format!("TXIDではない応答 ({}): {}", body, e))
    })
}

/// コピーを確定・抽出して送信する。元の PSBT は変更しない。
pub fn finalize_and_broadcast<B: Broadcaster + ?Sized>(psbt: &Psbt, broadcaster: &B) -> Result<Txid, AppError> {
    let mut working = psbt.clone();
    finalize(&mut working);
    let tx = extract_transaction(&working)?;
    let txid = broadcaster.broadcast(&tx)?;
    log::info!("ブロードキャスト完了: txid={}", txid);
    Ok(txid)
}
