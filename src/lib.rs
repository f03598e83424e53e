//! PSBT (BIP-174) による複数当事者の共同署名ワークフロー
//!
//! 作成・分析・マージ・署名・確定・抽出・ブロードキャストを、
//! オンライン機とオフライン署名機の間でファイルをやり取りする前提で提供する。

pub mod analyzer;
pub mod broadcaster;
pub mod cli;
pub mod codec;
pub mod config;
pub mod error;
pub mod finalizer;
pub mod merge;
pub mod model;
pub mod signer;
pub mod spend;
pub mod transaction;
pub mod types;
pub mod workflow;

#[cfg(test)]
mod test_utils;

pub use analyzer::analyze;
pub use broadcaster::{BroadcastErrorKind, Broadcaster, EsploraBroadcaster, finalize_and_broadcast};
pub use codec::Format;
pub use error::AppError;
pub use finalizer::{Finalizer, extract_transaction, finalize};
pub use merge::{merge, merge_all};
pub use signer::{KeyStoreSigner, SignOptions, SignScope, SigningCapability, sign};
pub use workflow::{Stage, Workflow};
