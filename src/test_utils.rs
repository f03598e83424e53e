//! テスト用の鍵・トランザクション・PSBT の生成

use std::cell::RefCell;

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Keypair, Secp256k1, SecretKey};
use bitcoin::sighash::EcdsaSighashType;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, Network, OutPoint, PrivateKey, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
    ecdsa,
};

use crate::broadcaster::{BroadcastErrorKind, Broadcaster};
use crate::error::AppError;
use crate::spend;

pub fn test_key(seed: u8) -> PrivateKey {
    PrivateKey::new(SecretKey::from_slice(&[seed; 32]).unwrap(), Network::Testnet)
}

pub fn public_key(key: &PrivateKey) -> PublicKey {
    key.public_key(&Secp256k1::new())
}

pub fn p2wpkh_spk(key: &PrivateKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&public_key(key).wpubkey_hash().unwrap())
}

pub fn p2pkh_spk(key: &PrivateKey) -> ScriptBuf {
    ScriptBuf::new_p2pkh(&public_key(key).pubkey_hash())
}

pub fn recipient_spk() -> ScriptBuf {
    p2wpkh_spk(&test_key(200))
}

pub fn multisig_script(threshold: i64, keys: &[PrivateKey]) -> ScriptBuf {
    let mut builder = Builder::new().push_int(threshold);
    for key in keys {
        builder = builder.push_key(&public_key(key));
    }
    builder
        .push_int(keys.len() as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script()
}

pub fn dummy_prev_tx(script_pubkey: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::null(),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(value), script_pubkey }],
    }
}

/// 各前トランザクションの出力 0 を使い、受取人に `out_value` を送る未署名トランザクション
pub fn unsigned_tx(prevs: &[Transaction], out_value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: prevs
            .iter()
            .map(|prev| TxIn {
                previous_output: OutPoint::new(prev.compute_txid(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut { value: Amount::from_sat(out_value), script_pubkey: recipient_spk() }],
    }
}

pub fn p2wpkh_psbt(key: &PrivateKey, in_value: u64, out_value: u64) -> (Psbt, Transaction) {
    let prev = dummy_prev_tx(p2wpkh_spk(key), in_value);
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(std::slice::from_ref(&prev), out_value)).unwrap();
    psbt.inputs[0].witness_utxo = Some(prev.output[0].clone());
    (psbt, prev)
}

pub fn p2pkh_psbt(key: &PrivateKey, in_value: u64, out_value: u64) -> Psbt {
    let prev = dummy_prev_tx(p2pkh_spk(key), in_value);
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(std::slice::from_ref(&prev), out_value)).unwrap();
    psbt.inputs[0].non_witness_utxo = Some(prev);
    psbt
}

pub fn p2wsh_psbt(keys: &[PrivateKey], threshold: i64, in_value: u64, out_value: u64) -> (Psbt, ScriptBuf) {
    let witness_script = multisig_script(threshold, keys);
    let prev = dummy_prev_tx(ScriptBuf::new_p2wsh(&witness_script.wscript_hash()), in_value);
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(std::slice::from_ref(&prev), out_value)).unwrap();
    psbt.inputs[0].witness_utxo = Some(prev.output[0].clone());
    psbt.inputs[0].witness_script = Some(witness_script.clone());
    (psbt, witness_script)
}

pub fn p2tr_psbt(key: &PrivateKey, in_value: u64, out_value: u64) -> Psbt {
    let secp = Secp256k1::new();
    let (internal_key, _) = Keypair::from_secret_key(&secp, &key.inner).x_only_public_key();
    let prev = dummy_prev_tx(ScriptBuf::new_p2tr(&secp, internal_key, None), in_value);
    let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(std::slice::from_ref(&prev), out_value)).unwrap();
    psbt.inputs[0].witness_utxo = Some(prev.output[0].clone());
    psbt.inputs[0].tap_internal_key = Some(internal_key);
    psbt
}

/// 署名者を通さずに入力の正しい ECDSA 署名を作る
pub fn ecdsa_sign(psbt: &Psbt, index: usize, key: &PrivateKey) -> ecdsa::Signature {
    let spend = spend::resolve(psbt, index).unwrap();
    let msg = spend::ecdsa_message(psbt, index, &spend, EcdsaSighashType::All).unwrap();
    let signature = Secp256k1::new().sign_ecdsa(&msg, &key.inner);
    ecdsa::Signature { signature, sighash_type: EcdsaSighashType::All }
}

pub fn add_partial_sig(psbt: &mut Psbt, index: usize, key: &PrivateKey) {
    let sig = ecdsa_sign(psbt, index, key);
    psbt.inputs[index].partial_sigs.insert(public_key(key), sig);
}

/// 送信されたトランザクションを記録するだけのブロードキャスター
#[derive(Default)]
pub struct RecordingBroadcaster {
    sent: RefCell<Vec<Transaction>>,
    fail_with: Option<BroadcastErrorKind>,
}

impl RecordingBroadcaster {
    pub fn failing(kind: BroadcastErrorKind) -> Self {
        RecordingBroadcaster { sent: RefCell::new(Vec::new()), fail_with: Some(kind) }
    }

    pub fn sent(&self) -> Vec<Transaction> {
        self.sent.borrow().clone()
    }
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError> {
        if let Some(kind) = self.fail_with {
            return Err(AppError::BroadcastRejected { kind, detail: "テスト用の失敗".to_string() });
        }
        self.sent.borrow_mut().push(tx.clone());
        Ok(tx.compute_txid())
    }
}
