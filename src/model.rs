//! PSBT データモデルの補助と Creator / Updater 操作
//!
//! データモデル自体は `bitcoin::Psbt` をそのまま使う。ここでは入力ごとの状態判定と、
//! 確定済み入力を壊さないための更新操作だけを提供する。

use bitcoin::bip32::{DerivationPath, Fingerprint};
use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1;
use bitcoin::{ScriptBuf, Transaction, TxOut};

use crate::error::AppError;

/// PSBT 入力の状態判定
pub trait PsbtInputExt {
    /// `final_script_sig` か `final_script_witness` のどちらかが空でなければ確定済み
    fn is_final(&self) -> bool;
}

impl PsbtInputExt for psbt::Input {
    fn is_final(&self) -> bool {
        self.final_script_sig.as_ref().is_some_and(|s| !s.is_empty())
            || self.final_script_witness.as_ref().is_some_and(|w| !w.is_empty())
    }
}

/// 未署名トランザクションから PSBT を作る (Creator)
pub fn create_psbt(unsigned_tx: Transaction) -> Result<Psbt, AppError> {
    Psbt::from_unsigned_tx(unsigned_tx)
        .map_err(|e| AppError::InputValidation(format!("未署名トランザクションではありません: {}", e)))
}

/// 入力が使う前の出力。完全な前トランザクションを優先し、なければ直接の記録を使う。
pub fn spent_utxo(psbt: &Psbt, index: usize) -> Option<TxOut> {
    let input = psbt.inputs.get(index)?;
    let txin = psbt.unsigned_tx.input.get(index)?;
    if let Some(prev_tx) = &input.non_witness_utxo {
        if let Some(out) = prev_tx.output.get(txin.previous_output.vout as usize) {
            return Some(out.clone());
        }
    }
    input.witness_utxo.clone()
}

pub fn has_utxo(psbt: &Psbt, index: usize) -> bool {
    spent_utxo(psbt, index).is_some()
}

pub fn all_final(psbt: &Psbt) -> bool {
    psbt.inputs.iter().all(|i| i.is_final())
}

fn input_for_update(psbt: &mut Psbt, index: usize) -> Result<&mut psbt::Input, AppError> {
    let input_count = psbt.inputs.len();
    let input = psbt
        .inputs
        .get_mut(index)
        .ok_or(AppError::InputIndexOutOfRange { input_index: index, input_count })?;
    if input.is_final() {
        return Err(AppError::InputFinalized { input_index: index });
    }
    Ok(input)
}

pub fn set_witness_utxo(psbt: &mut Psbt, index: usize, utxo: TxOut) -> Result<(), AppError> {
    input_for_update(psbt, index)?.witness_utxo = Some(utxo);
    log::debug!("入力 {} に witness_utxo を設定しました。", index);
    Ok(())
}

/// 完全な前トランザクションを設定する。参照先の txid と出力インデックスを検証する。
pub fn set_non_witness_utxo(psbt: &mut Psbt, index: usize, prev_tx: Transaction) -> Result<(), AppError> {
    let outpoint = psbt
        .unsigned_tx
        .input
        .get(index)
        .map(|txin| txin.previous_output)
        .ok_or(AppError::InputIndexOutOfRange { input_index: index, input_count: psbt.inputs.len() })?;
    let txid = prev_tx.compute_txid();
    if txid != outpoint.txid {
        return Err(AppError::InputValidation(format!(
            "前トランザクションのTXID {} が入力 {} の参照先 {} と一致しません",
            txid, index, outpoint.txid
        )));
    }
    if prev_tx.output.len() <= outpoint.vout as usize {
        return Err(AppError::InputValidation(format!(
            "前トランザクションに出力 {} が存在しません (出力数 {})",
            outpoint.vout,
            prev_tx.output.len()
        )));
    }
    input_for_update(psbt, index)?.non_witness_utxo = Some(prev_tx);
    log::debug!("入力 {} に non_witness_utxo を設定しました。", index);
    Ok(())
}

pub fn set_redeem_script(psbt: &mut Psbt, index: usize, script: ScriptBuf) -> Result<(), AppError> {
    input_for_update(psbt, index)?.redeem_script = Some(script);
    Ok(())
}

pub fn set_witness_script(psbt: &mut Psbt, index: usize, script: ScriptBuf) -> Result<(), AppError> {
    input_for_update(psbt, index)?.witness_script = Some(script);
    Ok(())
}

pub fn add_bip32_derivation(
    psbt: &mut Psbt,
    index: usize,
    key: secp256k1::PublicKey,
    fingerprint: Fingerprint,
    path: DerivationPath,
) -> Result<(), AppError> {
    input_for_update(psbt, index)?
        .bip32_derivation
        .insert(key, (fingerprint, path));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{dummy_prev_tx, p2wpkh_psbt, p2wpkh_spk, test_key, unsigned_tx};
    use bitcoin::{Amount, Witness};

    #[test]
    fn test_final_requires_non_empty_script() {
        let mut input = psbt::Input::default();
        assert!(!input.is_final());
        input.final_script_sig = Some(ScriptBuf::new());
        input.final_script_witness = Some(Witness::new());
        assert!(!input.is_final());
        input.final_script_witness = Some(Witness::from_slice(&[vec![1u8]]));
        assert!(input.is_final());
    }

    #[test]
    fn test_create_rejects_signed_transaction() {
        let mut tx = unsigned_tx(&[dummy_prev_tx(p2wpkh_spk(&test_key(1)), 10_000)], 9_000);
        tx.input[0].witness = Witness::from_slice(&[vec![1u8]]);
        assert!(matches!(create_psbt(tx), Err(AppError::InputValidation(_))));
    }

    #[test]
    fn test_non_witness_utxo_takes_precedence() {
        let key = test_key(1);
        let prev = dummy_prev_tx(p2wpkh_spk(&key), 10_000);
        let mut psbt = create_psbt(unsigned_tx(std::slice::from_ref(&prev), 9_000)).unwrap();
        assert!(!has_utxo(&psbt, 0));

        set_witness_utxo(&mut psbt, 0, TxOut { value: Amount::from_sat(1), script_pubkey: ScriptBuf::new() }).unwrap();
        set_non_witness_utxo(&mut psbt, 0, prev.clone()).unwrap();
        assert_eq!(spent_utxo(&psbt, 0).unwrap().value, Amount::from_sat(10_000));
    }

    #[test]
    fn test_non_witness_utxo_must_match_outpoint() {
        let key = test_key(1);
        let prev = dummy_prev_tx(p2wpkh_spk(&key), 10_000);
        let other = dummy_prev_tx(p2wpkh_spk(&key), 20_000);
        let mut psbt = create_psbt(unsigned_tx(&[prev], 9_000)).unwrap();
        assert!(matches!(set_non_witness_utxo(&mut psbt, 0, other), Err(AppError::InputValidation(_))));
        assert!(psbt.inputs[0].non_witness_utxo.is_none());
    }

    #[test]
    fn test_updates_refused_on_final_input() {
        let (mut psbt, _) = p2wpkh_psbt(&test_key(1), 50_000, 40_000);
        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[vec![1u8], vec![2u8]]));
        let before = psbt.clone();
        let result = set_witness_script(&mut psbt, 0, ScriptBuf::new());
        assert!(matches!(result, Err(AppError::InputFinalized { input_index: 0 })));
        assert_eq!(psbt, before);
        assert!(matches!(
            set_redeem_script(&mut psbt, 3, ScriptBuf::new()),
            Err(AppError::InputIndexOutOfRange { input_index: 3, input_count: 1 })
        ));
    }
}
