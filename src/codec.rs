//! PSBT のバイナリ/base64 変換とファイル入出力

use std::fs;
use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bitcoin::Psbt;

use crate::error::AppError;

/// 保存形式
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Format {
    Binary,
    Base64,
}

/// BIP-174 バイナリから PSBT を復元する。
///
/// 未知のレコードは `unknown` / `proprietary` に保持されるため、確定を行わない中間者を
/// 経由しても失われない。
pub fn decode(bytes: &[u8]) -> Result<Psbt, AppError> {
    if bytes.is_empty() {
        return Err(AppError::MalformedEncoding("空のデータです".to_string()));
    }
    let psbt = Psbt::deserialize(bytes)?;
    check_structure(&psbt)?;
    log::debug!(
        "PSBTデコード成功: 入力 {} 件, 出力 {} 件",
        psbt.inputs.len(),
        psbt.outputs.len()
    );
    Ok(psbt)
}

/// 正規形のバイナリを生成する (フィールド順は常に同じ)
pub fn encode(psbt: &Psbt) -> Vec<u8> {
    psbt.serialize()
}

pub fn to_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// base64 テキストをバイト列に戻す。クリップボードやファイル由来の改行・空白は無視する。
pub fn from_text(text: &str) -> Result<Vec<u8>, AppError> {
    let compact: String = text.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    Ok(STANDARD.decode(compact.as_bytes())?)
}

pub fn decode_text(text: &str) -> Result<Psbt, AppError> {
    let bytes = from_text(text)?;
    decode(&bytes)
}

/// 生バイナリか base64 テキストかを自動判別してデコードする。
/// base64 としての解釈を先に試み、失敗した場合は生バイナリとして扱う。
pub fn decode_any(data: &[u8]) -> Result<Psbt, AppError> {
    if let Ok(text) = std::str::from_utf8(data) {
        match from_text(text) {
            Ok(bytes) => return decode(&bytes),
            Err(e) => log::debug!("base64として解釈できないため生バイナリとして扱います: {}", e),
        }
    }
    decode(data)
}

pub fn export(psbt: &Psbt, format: Format) -> Vec<u8> {
    let bytes = encode(psbt);
    match format {
        Format::Binary => bytes,
        Format::Base64 => {
            let mut text = to_text(&bytes);
            text.push('\n');
            text.into_bytes()
        }
    }
}

pub fn load_psbt<P: AsRef<Path>>(path: P) -> Result<Psbt, AppError> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| {
        log::error!("PSBTファイルの読み込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    decode_any(&data)
}

pub fn save_psbt<P: AsRef<Path>>(psbt: &Psbt, path: P, format: Format) -> Result<(), AppError> {
    let path = path.as_ref();
    fs::write(path, export(psbt, format)).map_err(|e| {
        log::error!("PSBTファイルの書き込みに失敗しました: {:?}", path);
        AppError::Io(e)
    })?;
    log::info!("PSBTを {:?} に保存しました ({:?})。", path, format);
    Ok(())
}

pub(crate) fn check_structure(psbt: &Psbt) -> Result<(), AppError> {
    let tx_ins = psbt.unsigned_tx.input.len();
    let tx_outs = psbt.unsigned_tx.output.len();
    if psbt.inputs.len() != tx_ins {
        return Err(AppError::MalformedEncoding(format!(
            "入力マップ数 {} がトランザクションの入力数 {} と一致しません",
            psbt.inputs.len(),
            tx_ins
        )));
    }
    if psbt.outputs.len() != tx_outs {
        return Err(AppError::MalformedEncoding(format!(
            "出力マップ数 {} がトランザクションの出力数 {} と一致しません",
            psbt.outputs.len(),
            tx_outs
        )));
    }
    Ok(())
}
