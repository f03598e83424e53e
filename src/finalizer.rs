//! Finalizer / Extractor
//!
//! 集まった部分署名から各入力の最終 scriptSig / witness を組み立てる。
//! 使う署名はすべて sighash に対して検証する。確定は入力ごとの一方向の遷移で、
//! 確定済みの入力には二度と触れない。

use bitcoin::psbt::{self, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::secp256k1::{Secp256k1, VerifyOnly, XOnlyPublicKey};
use bitcoin::{PublicKey, ScriptBuf, Transaction, Witness, ecdsa, taproot};

use crate::error::AppError;
use crate::model::{PsbtInputExt, all_final};
use crate::spend::{self, SigVersion, SpendPath, Template, key_hash_matches};
use crate::types::Missing;

/// 一つの入力の確定結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalScripts {
    pub script_sig: ScriptBuf,
    pub witness: Witness,
}

pub struct Finalizer {
    secp: Secp256k1<VerifyOnly>,
}

impl Default for Finalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Finalizer {
    pub fn new() -> Self {
        Finalizer { secp: Secp256k1::verification_only() }
    }

    /// 入力を確定できるか試す。PSBT は変更しない (Analyzer のドライランでも使う)。
    pub fn finalize_input(&self, psbt: &Psbt, index: usize) -> Result<FinalScripts, Missing> {
        let spend = spend::resolve(psbt, index)?;
        let template = spend
            .template()
            .ok_or_else(|| Missing::UnsupportedScript { script: spend.script.clone() })?;
        let input = &psbt.inputs[index];

        let items: Vec<Vec<u8>> = match template {
            Template::TaprootKey(output_key) => {
                let sig = input
                    .tap_key_sig
                    .filter(|sig| self.verify_taproot(psbt, index, &output_key, sig))
                    .ok_or(Missing::Signatures { keys: Vec::new(), needed: 1 })?;
                return Ok(FinalScripts {
                    script_sig: ScriptBuf::new(),
                    witness: Witness::from_slice(&[sig.to_vec()]),
                });
            }
            Template::PubkeyHash(hash) => {
                let found = input.partial_sigs.iter().find(|(key, sig)| {
                    key_hash_matches(&hash, key)
                        && spend.accepts_key(key)
                        && self.verify_ecdsa(psbt, index, &spend, key, sig)
                });
                match found {
                    Some((key, sig)) => vec![sig.to_vec(), key.to_bytes()],
                    None => {
                        let keys = input
                            .bip32_derivation
                            .keys()
                            .map(|k| PublicKey::new(*k))
                            .filter(|k| key_hash_matches(&hash, k))
                            .collect();
                        return Err(Missing::Signatures { keys, needed: 1 });
                    }
                }
            }
            Template::Pubkey(key) => match input.partial_sigs.get(&key) {
                Some(sig) if self.verify_ecdsa(psbt, index, &spend, &key, sig) => vec![sig.to_vec()],
                _ => return Err(Missing::Signatures { keys: vec![key], needed: 1 }),
            },
            Template::Multisig { threshold, keys } => {
                let mut stack = vec![Vec::new()]; // CHECKMULTISIG の余分な pop 用
                let mut unsigned = Vec::new();
                for key in &keys {
                    match input.partial_sigs.get(key) {
                        Some(sig) if self.verify_ecdsa(psbt, index, &spend, key, sig) => {
                            if stack.len() <= threshold {
                                stack.push(sig.to_vec());
                            }
                        }
                        _ => unsigned.push(*key),
                    }
                }
                let have = stack.len() - 1;
                if have < threshold {
                    return Err(Missing::Signatures { keys: unsigned, needed: threshold - have });
                }
                stack
            }
        };

        build_final(&spend, items).ok_or(Missing::UnsupportedScript { script: spend.script })
    }

    /// 確定できる入力をすべて確定し、全入力が確定済みになったかを返す。何度呼んでも結果は同じ。
    pub fn finalize(&self, psbt: &mut Psbt) -> bool {
        for index in 0..psbt.inputs.len() {
            if psbt.inputs[index].is_final() {
                continue;
            }
            match self.finalize_input(psbt, index) {
                Ok(scripts) => {
                    apply_final(&mut psbt.inputs[index], scripts);
                    log::debug!("入力 {} を確定しました。", index);
                }
                Err(missing) => log::debug!("入力 {} はまだ確定できません: {:?}", index, missing),
            }
        }
        let complete = all_final(psbt);
        log::info!("確定処理完了: complete={}", complete);
        complete
    }

    /// 全入力が確定済みか、確定可能か
    pub fn is_complete(&self, psbt: &Psbt) -> bool {
        (0..psbt.inputs.len()).all(|i| psbt.inputs[i].is_final() || self.finalize_input(psbt, i).is_ok())
    }

    fn verify_ecdsa(
        &self,
        psbt: &Psbt,
        index: usize,
        spend: &SpendPath,
        key: &PublicKey,
        sig: &ecdsa::Signature,
    ) -> bool {
        match spend::ecdsa_message(psbt, index, spend, sig.sighash_type) {
            Ok(msg) => self.secp.verify_ecdsa(&msg, &sig.signature, &key.inner).is_ok(),
            Err(e) => {
                log::debug!("入力 {} の署名ハッシュを計算できません: {}", index, e);
                false
            }
        }
    }

    fn verify_taproot(&self, psbt: &Psbt, index: usize, output_key: &XOnlyPublicKey, sig: &taproot::Signature) -> bool {
        match spend::taproot_key_message(psbt, index, sig.sighash_type) {
            Ok(msg) => self.secp.verify_schnorr(&sig.signature, &msg, output_key).is_ok(),
            Err(e) => {
                log::debug!("入力 {} の taproot 署名ハッシュを計算できません: {}", index, e);
                false
            }
        }
    }
}

/// 確定を試みる。`complete` は全入力が確定済みかどうか。
pub fn finalize(psbt: &mut Psbt) -> bool {
    Finalizer::new().finalize(psbt)
}

fn build_final(spend: &SpendPath, mut items: Vec<Vec<u8>>) -> Option<FinalScripts> {
    match spend.version {
        SigVersion::Base => {
            if let Some(redeem) = &spend.redeem_script {
                items.push(redeem.to_bytes());
            }
            Some(FinalScripts { script_sig: push_all(&items)?, witness: Witness::new() })
        }
        SigVersion::WitnessV0 | SigVersion::Taproot => {
            if let Some(ws) = &spend.witness_script {
                items.push(ws.to_bytes());
            }
            let script_sig = match &spend.redeem_script {
                Some(redeem) => push_all(&[redeem.to_bytes()])?,
                None => ScriptBuf::new(),
            };
            Some(FinalScripts { script_sig, witness: Witness::from_slice(&items) })
        }
    }
}

fn push_all(items: &[Vec<u8>]) -> Option<ScriptBuf> {
    let mut builder = Builder::new();
    for item in items {
        builder = builder.push_slice(PushBytesBuf::try_from(item.clone()).ok()?);
    }
    Some(builder.into_script())
}

/// 最終スクリプトを設定し、署名用のデータを取り除く (UTXO と未知フィールドは残す)
pub(crate) fn apply_final(input: &mut psbt::Input, scripts: FinalScripts) {
    input.final_script_sig = (!scripts.script_sig.is_empty()).then_some(scripts.script_sig);
    input.final_script_witness = (!scripts.witness.is_empty()).then_some(scripts.witness);
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.bip32_derivation.clear();
    input.ripemd160_preimages.clear();
    input.sha256_preimages.clear();
    input.hash160_preimages.clear();
    input.hash256_preimages.clear();
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_key_origins.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
}

/// 確定済みの scriptSig / witness を未署名トランザクションに貼り付ける (Extractor)
pub fn extract_transaction(psbt: &Psbt) -> Result<Transaction, AppError> {
    let mut tx = psbt.unsigned_tx.clone();
    for (index, (txin, input)) in tx.input.iter_mut().zip(&psbt.inputs).enumerate() {
        if !input.is_final() {
            return Err(AppError::NotFinalized { input_index: index });
        }
        txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
        txin.witness = input.final_script_witness.clone().unwrap_or_default();
    }
    log::info!("トランザクションを抽出しました: txid={}", tx.compute_txid());
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::*;
    use bitcoin::key::TapTweak;
    use bitcoin::secp256k1::{Keypair, Message};
    use bitcoin::sighash::TapSighashType;

    #[test]
    fn test_p2wpkh_finalize_and_extract() {
        let key = test_key(1);
        let (mut psbt, _) = p2wpkh_psbt(&key, 50_000, 40_000);
        assert!(matches!(extract_transaction(&psbt), Err(AppError::NotFinalized { input_index: 0 })));
        assert!(!finalize(&mut psbt));

        add_partial_sig(&mut psbt, 0, &key);
        assert!(finalize(&mut psbt));

        let input = &psbt.inputs[0];
        assert!(input.partial_sigs.is_empty());
        assert!(input.witness_utxo.is_some());
        let witness = input.final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 2);
        assert_eq!(witness.nth(1).unwrap(), public_key(&key).to_bytes().as_slice());

        let tx = extract_transaction(&psbt).unwrap();
        assert_eq!(tx.compute_txid(), psbt.unsigned_tx.compute_txid());
        assert_eq!(tx.input[0].witness.len(), 2);
    }

    #[test]
    fn test_out_of_range_input_is_reported() {
        let (psbt, _) = p2wpkh_psbt(&test_key(1), 50_000, 40_000);
        assert_eq!(
            Finalizer::new().finalize_input(&psbt, 1).unwrap_err(),
            Missing::NoSuchInput { input_count: 1 }
        );
    }

    #[test]
    fn test_finalize_is_idempotent() {
        let key = test_key(1);
        let (mut psbt, _) = p2wpkh_psbt(&key, 50_000, 40_000);
        add_partial_sig(&mut psbt, 0, &key);
        assert!(finalize(&mut psbt));
        let once = psbt.clone();
        assert!(finalize(&mut psbt));
        assert_eq!(psbt, once);
    }

    #[test]
    fn test_multisig_needs_threshold_and_orders_by_script() {
        let keys = [test_key(1), test_key(2), test_key(3)];
        let (mut psbt, witness_script) = p2wsh_psbt(&keys, 2, 50_000, 40_000);
        add_partial_sig(&mut psbt, 0, &keys[2]);

        let finalizer = Finalizer::new();
        assert_eq!(
            finalizer.finalize_input(&psbt, 0).unwrap_err(),
            Missing::Signatures { keys: vec![public_key(&keys[0]), public_key(&keys[1])], needed: 1 }
        );
        assert!(!finalizer.finalize(&mut psbt));
        assert!(!psbt.inputs[0].is_final());

        let first = ecdsa_sign(&psbt, 0, &keys[0]);
        psbt.inputs[0].partial_sigs.insert(public_key(&keys[0]), first);
        assert!(finalizer.finalize(&mut psbt));
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
        assert!(witness.nth(0).unwrap().is_empty());
        assert_eq!(witness.nth(1).unwrap(), first.to_vec().as_slice());
        assert_eq!(witness.nth(3).unwrap(), witness_script.as_bytes());
        assert!(psbt.inputs[0].witness_script.is_none());
    }

    #[test]
    fn test_signature_for_other_transaction_is_ignored() {
        let key = test_key(1);
        let (mut psbt, _) = p2wpkh_psbt(&key, 50_000, 40_000);
        let (other, _) = p2wpkh_psbt(&key, 50_000, 30_000);
        let foreign = ecdsa_sign(&other, 0, &key);
        psbt.inputs[0].partial_sigs.insert(public_key(&key), foreign);

        assert!(Finalizer::new().finalize_input(&psbt, 0).is_err());
        assert!(!finalize(&mut psbt));
    }

    #[test]
    fn test_p2pkh_builds_script_sig() {
        let key = test_key(4);
        let mut psbt = p2pkh_psbt(&key, 50_000, 40_000);
        add_partial_sig(&mut psbt, 0, &key);
        assert!(finalize(&mut psbt));
        let input = &psbt.inputs[0];
        assert!(input.final_script_witness.is_none());
        assert!(!input.final_script_sig.as_ref().unwrap().is_empty());
        assert!(input.non_witness_utxo.is_some());
    }

    #[test]
    fn test_p2sh_p2wpkh_pushes_redeem_script() {
        let key = test_key(5);
        let redeem = p2wpkh_spk(&key);
        let prev = dummy_prev_tx(ScriptBuf::new_p2sh(&redeem.script_hash()), 50_000);
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx(std::slice::from_ref(&prev), 40_000)).unwrap();
        psbt.inputs[0].witness_utxo = Some(prev.output[0].clone());

        assert_eq!(Finalizer::new().finalize_input(&psbt, 0).unwrap_err(), Missing::RedeemScript);
        psbt.inputs[0].redeem_script = Some(redeem.clone());
        add_partial_sig(&mut psbt, 0, &key);
        assert!(finalize(&mut psbt));

        let expected_sig = Builder::new()
            .push_slice(PushBytesBuf::try_from(redeem.to_bytes()).unwrap())
            .into_script();
        assert_eq!(psbt.inputs[0].final_script_sig.as_ref(), Some(&expected_sig));
        assert_eq!(psbt.inputs[0].final_script_witness.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn test_taproot_key_path() {
        let key = test_key(6);
        let mut psbt = p2tr_psbt(&key, 50_000, 40_000);
        assert!(!finalize(&mut psbt));

        let secp = Secp256k1::new();
        let msg: Message = spend::taproot_key_message(&psbt, 0, TapSighashType::Default).unwrap();
        let tweaked = Keypair::from_secret_key(&secp, &key.inner).tap_tweak(&secp, None).to_keypair();
        let signature = secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
        psbt.inputs[0].tap_key_sig = Some(taproot::Signature { signature, sighash_type: TapSighashType::Default });

        assert!(finalize(&mut psbt));
        assert_eq!(psbt.inputs[0].final_script_witness.as_ref().unwrap().len(), 1);
        assert!(psbt.inputs[0].tap_internal_key.is_none());
    }
}
