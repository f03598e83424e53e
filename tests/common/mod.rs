//! 統合テスト共通のフィクスチャ

use std::cell::RefCell;

use bitcoin::absolute::LockTime;
use bitcoin::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::psbt::Psbt;
use bitcoin::script::Builder;
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, Network, OutPoint, PrivateKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};

use psbt_cosigner_cli::model;
use psbt_cosigner_cli::{AppError, Broadcaster};

pub fn key(seed: u8) -> PrivateKey {
    PrivateKey::new(SecretKey::from_slice(&[seed; 32]).unwrap(), Network::Testnet)
}

pub fn funding_tx(script_pubkey: ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn::default()],
        output: vec![TxOut { value: Amount::from_sat(value), script_pubkey }],
    }
}

pub fn spending_psbt(prev: &Transaction, send: u64) -> Psbt {
    let secp = Secp256k1::new();
    let recipient = ScriptBuf::new_p2wpkh(&key(100).public_key(&secp).wpubkey_hash().unwrap());
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(prev.compute_txid(), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(send), script_pubkey: recipient }],
    };
    model::create_psbt(tx).unwrap()
}

/// 2-of-2 P2WSH の未署名 PSBT
pub fn two_of_two() -> (Psbt, [PrivateKey; 2]) {
    let secp = Secp256k1::new();
    let keys = [key(11), key(12)];
    let witness_script = Builder::new()
        .push_int(2)
        .push_key(&keys[0].public_key(&secp))
        .push_key(&keys[1].public_key(&secp))
        .push_int(2)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script();
    let prev = funding_tx(ScriptBuf::new_p2wsh(&witness_script.wscript_hash()), 80_000);
    let mut psbt = spending_psbt(&prev, 79_000);
    model::set_witness_utxo(&mut psbt, 0, prev.output[0].clone()).unwrap();
    model::set_witness_script(&mut psbt, 0, witness_script).unwrap();
    (psbt, keys)
}

#[derive(Default)]
pub struct RecordingBroadcaster {
    pub sent: RefCell<Vec<Transaction>>,
}

impl Broadcaster for RecordingBroadcaster {
    fn broadcast(&self, tx: &Transaction) -> Result<Txid, AppError> {
        self.sent.borrow_mut().push(tx.clone());
        Ok(tx.compute_txid())
    }
}
