//! 入力の使用条件の解決と署名ハッシュ計算 (Signer と Finalizer で共有)

use bitcoin::hashes::{Hash, hash160};
use bitcoin::opcodes::all::{OP_CHECKMULTISIG, OP_CHECKSIG, OP_PUSHNUM_1, OP_PUSHNUM_16};
use bitcoin::psbt::Psbt;
use bitcoin::script::{Instruction, Script};
use bitcoin::secp256k1::{Message, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use bitcoin::{PublicKey, ScriptBuf, TxOut};

use crate::model::spent_utxo;
use crate::types::Missing;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SigVersion {
    Base,
    WitnessV0,
    Taproot,
}

/// 入力をどう使うかの解決結果
#[derive(Debug, Clone)]
pub struct SpendPath {
    pub utxo: TxOut,
    pub version: SigVersion,
    /// 署名対象のスクリプト。P2PKH/P2WPKH/P2TR は scriptPubKey、P2SH は redeem script、
    /// P2WSH は witness script。
    pub script: ScriptBuf,
    /// P2SH の場合 scriptSig の最後に積む
    pub redeem_script: Option<ScriptBuf>,
    /// P2WSH の場合 witness の最後に積む
    pub witness_script: Option<ScriptBuf>,
}

/// 署名すべきスクリプトの形
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    /// P2PKH / P2WPKH: 公開鍵ハッシュ (20バイト)
    PubkeyHash([u8; 20]),
    /// `<pk> OP_CHECKSIG`
    Pubkey(PublicKey),
    /// `m <pk1> .. <pkn> n OP_CHECKMULTISIG`
    Multisig { threshold: usize, keys: Vec<PublicKey> },
    /// P2TR キーパス (出力鍵)
    TaprootKey(XOnlyPublicKey),
}

pub fn resolve(psbt: &Psbt, index: usize) -> Result<SpendPath, Missing> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or(Missing::NoSuchInput { input_count: psbt.inputs.len() })?;
    let utxo = spent_utxo(psbt, index).ok_or(Missing::Utxo)?;
    let spk = utxo.script_pubkey.clone();

    let (inner, redeem_script) = if spk.is_p2sh() {
        let redeem = input.redeem_script.clone().ok_or(Missing::RedeemScript)?;
        if ScriptBuf::new_p2sh(&redeem.script_hash()) != spk {
            log::debug!("入力 {} の redeem script が scriptPubKey と一致しません。", index);
            return Err(Missing::RedeemScript);
        }
        (redeem.clone(), Some(redeem))
    } else {
        (spk.clone(), None)
    };

    let path = if inner.is_p2wpkh() {
        SpendPath { utxo, version: SigVersion::WitnessV0, script: inner, redeem_script, witness_script: None }
    } else if inner.is_p2wsh() {
        let ws = input.witness_script.clone().ok_or(Missing::WitnessScript)?;
        if ScriptBuf::new_p2wsh(&ws.wscript_hash()) != inner {
            log::debug!("入力 {} の witness script が一致しません。", index);
            return Err(Missing::WitnessScript);
        }
        SpendPath {
            utxo,
            version: SigVersion::WitnessV0,
            script: ws.clone(),
            redeem_script,
            witness_script: Some(ws),
        }
    } else if inner.is_p2tr() {
        if redeem_script.is_some() {
            return Err(Missing::UnsupportedScript { script: spk });
        }
        SpendPath { utxo, version: SigVersion::Taproot, script: inner, redeem_script, witness_script: None }
    } else {
        SpendPath { utxo, version: SigVersion::Base, script: inner, redeem_script, witness_script: None }
    };
    Ok(path)
}

impl SpendPath {
    pub fn template(&self) -> Option<Template> {
        match self.version {
            SigVersion::Taproot => XOnlyPublicKey::from_slice(&self.script.as_bytes()[2..34])
                .ok()
                .map(Template::TaprootKey),
            _ => script_template(&self.script),
        }
    }

    /// このスクリプトで使える鍵かどうか (セグウィットでは圧縮鍵のみ)
    pub fn accepts_key(&self, key: &PublicKey) -> bool {
        self.version != SigVersion::WitnessV0 || key.compressed
    }
}

/// 鍵ハッシュ・単一鍵・マルチシグのいずれかの形なら、その内容を返す
pub(crate) fn script_template(script: &Script) -> Option<Template> {
    if script.is_p2pkh() {
        program_hash(&script.as_bytes()[3..23]).map(Template::PubkeyHash)
    } else if script.is_p2wpkh() {
        program_hash(&script.as_bytes()[2..22]).map(Template::PubkeyHash)
    } else {
        parse_pubkey(script).or_else(|| parse_multisig(script))
    }
}

fn program_hash(bytes: &[u8]) -> Option<[u8; 20]> {
    bytes.try_into().ok()
}

pub fn key_hash_matches(hash: &[u8; 20], key: &PublicKey) -> bool {
    hash160::Hash::hash(&key.to_bytes()).to_byte_array() == *hash
}

fn parse_pubkey(script: &Script) -> Option<Template> {
    let instructions = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    match instructions.as_slice() {
        [Instruction::PushBytes(key), Instruction::Op(op)] if *op == OP_CHECKSIG => {
            PublicKey::from_slice(key.as_bytes()).ok().map(Template::Pubkey)
        }
        _ => None,
    }
}

fn parse_multisig(script: &Script) -> Option<Template> {
    let mut instructions = script.instructions().collect::<Result<Vec<_>, _>>().ok()?;
    match instructions.pop()? {
        Instruction::Op(op) if op == OP_CHECKMULTISIG => {}
        _ => return None,
    }
    let total = small_int(&instructions.pop()?)?;
    let threshold = small_int(instructions.first()?)?;
    let mut keys = Vec::with_capacity(total);
    for instruction in &instructions[1..] {
        match instruction {
            Instruction::PushBytes(bytes) => keys.push(PublicKey::from_slice(bytes.as_bytes()).ok()?),
            Instruction::Op(_) => return None,
        }
    }
    if keys.len() != total || threshold > total {
        return None;
    }
    Some(Template::Multisig { threshold, keys })
}

fn small_int(instruction: &Instruction) -> Option<usize> {
    match instruction {
        Instruction::Op(op) => {
            let v = op.to_u8();
            if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&v) {
                Some((v - OP_PUSHNUM_1.to_u8() + 1) as usize)
            } else {
                None
            }
        }
        Instruction::PushBytes(_) => None,
    }
}

/// ECDSA 署名対象のメッセージを計算する
pub fn ecdsa_message(
    psbt: &Psbt,
    index: usize,
    spend: &SpendPath,
    sighash_type: EcdsaSighashType,
) -> Result<Message, String> {
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let digest = match spend.version {
        SigVersion::Base => cache
            .legacy_signature_hash(index, &spend.script, sighash_type.to_u32())
            .map_err(|e| e.to_string())?
            .to_byte_array(),
        SigVersion::WitnessV0 if spend.script.is_p2wpkh() => cache
            .p2wpkh_signature_hash(index, &spend.script, spend.utxo.value, sighash_type)
            .map_err(|e| e.to_string())?
            .to_byte_array(),
        SigVersion::WitnessV0 => cache
            .p2wsh_signature_hash(index, &spend.script, spend.utxo.value, sighash_type)
            .map_err(|e| e.to_string())?
            .to_byte_array(),
        SigVersion::Taproot => return Err("taproot入力にECDSA署名は使えません".to_string()),
    };
    Ok(Message::from_digest(digest))
}

/// P2TR キーパスの署名対象メッセージ。全入力の UTXO が必要。
pub fn taproot_key_message(psbt: &Psbt, index: usize, sighash_type: TapSighashType) -> Result<Message, String> {
    let prevouts = (0..psbt.inputs.len())
        .map(|i| spent_utxo(psbt, i).ok_or_else(|| format!("入力 {} のUTXOがありません", i)))
        .collect::<Result<Vec<_>, _>>()?;
    let mut cache = SighashCache::new(&psbt.unsigned_tx);
    let sighash = cache
        .taproot_key_spend_signature_hash(index, &Prevouts::All(prevouts.as_slice()), sighash_type)
        .map_err(|e| e.to_string())?;
    Ok(Message::from_digest(sighash.to_byte_array()))
}
