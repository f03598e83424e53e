//! Signer Adapter
//!
//! 鍵ストアとのやり取りは `SigningCapability` に閉じ込める。`sign` は作業用コピーに対して
//! 署名させ、成功した場合だけ入力ごとに結果を取り込む。

use std::collections::BTreeSet;
use std::collections::btree_map::Entry;

use bitcoin::key::TapTweak;
use bitcoin::psbt::{self, Psbt};
use bitcoin::secp256k1::{All, Keypair, Secp256k1, XOnlyPublicKey};
use bitcoin::sighash::{EcdsaSighashType, TapSighashType};
use bitcoin::{Network, NetworkKind, PrivateKey, PublicKey, ecdsa, taproot};

use crate::error::AppError;
use crate::finalizer::{FinalScripts, Finalizer, apply_final};
use crate::merge::{conflict, union_map};
use crate::model::PsbtInputExt;
use crate::spend::{self, SpendPath, Template, key_hash_matches};

/// 署名対象の入力
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SignScope {
    #[default]
    All,
    Inputs(BTreeSet<usize>),
}

impl SignScope {
    pub fn contains(&self, index: usize) -> bool {
        match self {
            SignScope::All => true,
            SignScope::Inputs(set) => set.contains(&index),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SignOptions {
    /// 入力に sighash_type が指定されていない場合に使う
    pub sighash_type: EcdsaSighashType,
    /// 署名後に確定できる入力を確定する
    pub finalize: bool,
    /// false なら、それだけで入力を確定可能にする署名しか残さない
    pub allow_partial: bool,
    pub scope: SignScope,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            sighash_type: EcdsaSighashType::All,
            finalize: false,
            allow_partial: true,
            scope: SignScope::All,
        }
    }
}

/// 鍵ストアへの狭いインターフェース。PSBT に署名を書き足すだけで、取り消しはしない。
pub trait SigningCapability {
    fn fill_signatures(&self, psbt: &mut Psbt, options: &SignOptions) -> Result<(), AppError>;
}

/// 署名を依頼し、全入力が確定済みか確定可能になったかを返す。
///
/// エラー時は `psbt` を変更しない。既存の部分署名を上書き・削除せず、確定済みの入力にも触れない。
pub fn sign<S: SigningCapability + ?Sized>(
    psbt: &mut Psbt,
    capability: &S,
    options: &SignOptions,
) -> Result<bool, AppError> {
    if let SignScope::Inputs(set) = &options.scope {
        if let Some(&index) = set.iter().find(|&&i| i >= psbt.inputs.len()) {
            return Err(AppError::InputIndexOutOfRange { input_index: index, input_count: psbt.inputs.len() });
        }
    }

    let mut working = psbt.clone();
    capability.fill_signatures(&mut working, options)?;
    if working.unsigned_tx != psbt.unsigned_tx || working.inputs.len() != psbt.inputs.len() {
        return Err(AppError::Internal("署名者が未署名トランザクションを変更しました".to_string()));
    }

    let finalizer = Finalizer::new();
    let mut staged = psbt.clone();
    let mut signed_inputs = 0;
    for (index, mut filled) in working.inputs.into_iter().enumerate() {
        if staged.inputs[index].is_final() || !options.scope.contains(index) {
            continue;
        }
        commit_derivations(index, &mut staged.inputs[index], &mut filled)?;
        let before = staged.inputs[index].clone();
        let added = commit_signatures(&mut staged.inputs[index], filled);
        if added == 0 {
            continue;
        }
        if !options.allow_partial
            && !staged.inputs[index].is_final()
            && finalizer.finalize_input(&staged, index).is_err()
        {
            log::debug!("入力 {} の署名だけでは確定できないため取り込みません。", index);
            staged.inputs[index] = before;
            continue;
        }
        log::debug!("入力 {} に {} 個の署名を追加しました。", index, added);
        signed_inputs += 1;
    }

    if options.finalize {
        finalizer.finalize(&mut staged);
    }
    let complete = finalizer.is_complete(&staged);
    *psbt = staged;
    log::info!("{} 個の入力に署名しました (complete={})。", signed_inputs, complete);
    Ok(complete)
}

/// 署名者が付けた鍵の導出情報をマージと同じ規則で取り込む
fn commit_derivations(index: usize, target: &mut psbt::Input, filled: &mut psbt::Input) -> Result<(), AppError> {
    let location = format!("入力 {}", index);
    union_map(&mut target.bip32_derivation, std::mem::take(&mut filled.bip32_derivation), |_| {
        conflict(location.clone(), "bip32_derivation")
    })?;
    union_map(&mut target.tap_key_origins, std::mem::take(&mut filled.tap_key_origins), |_| {
        conflict(location.clone(), "tap_key_origins")
    })
}

/// 空いている所にだけ署名を書き込み、追加した数を返す。
/// 署名者が入力を確定済みにした場合は、その最終スクリプトをそのまま採用する。
fn commit_signatures(target: &mut psbt::Input, filled: psbt::Input) -> usize {
    if filled.is_final() {
        let scripts = FinalScripts {
            script_sig: filled.final_script_sig.unwrap_or_default(),
            witness: filled.final_script_witness.unwrap_or_default(),
        };
        apply_final(target, scripts);
        return 1;
    }
    let mut added = 0;
    for (key, sig) in filled.partial_sigs {
        if let Entry::Vacant(slot) = target.partial_sigs.entry(key) {
            slot.insert(sig);
            added += 1;
        }
    }
    if target.tap_key_sig.is_none() && filled.tap_key_sig.is_some() {
        target.tap_key_sig = filled.tap_key_sig;
        added += 1;
    }
    for (key, sig) in filled.tap_script_sigs {
        if let Entry::Vacant(slot) = target.tap_script_sigs.entry(key) {
            slot.insert(sig);
            added += 1;
        }
    }
    added
}

/// WIF 秘密鍵をメモリに持つ署名者
pub struct KeyStoreSigner {
    keys: Vec<PrivateKey>,
    secp: Secp256k1<All>,
}

impl KeyStoreSigner {
    pub fn new(keys: Vec<PrivateKey>) -> Self {
        KeyStoreSigner { keys, secp: Secp256k1::new() }
    }

    /// WIF をデコードし、指定ネットワーク用の鍵であることを確認する
    pub fn from_wif<S: AsRef<str>>(wifs: &[S], network: Network) -> Result<Self, AppError> {
        let mut keys = Vec::with_capacity(wifs.len());
        for wif in wifs {
            let key = PrivateKey::from_wif(wif.as_ref()).map_err(AppError::BitcoinKey)?;
            if key.network != NetworkKind::from(network) {
                return Err(AppError::NetworkMismatch {
                    cli_network: format!("{:?}", network),
                    inferred_network: format!("{:?}", key.network),
                });
            }
            keys.push(key);
        }
        log::debug!("{} 個の秘密鍵を読み込みました。", keys.len());
        Ok(Self::new(keys))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn key_for(&self, public_key: &PublicKey) -> Option<&PrivateKey> {
        self.keys
            .iter()
            .find(|k| k.public_key(&self.secp) == *public_key)
    }

    /// テンプレートに現れる公開鍵のうち、手元に秘密鍵があるもの
    fn signing_keys(&self, template: &Template) -> Vec<(PublicKey, &PrivateKey)> {
        match template {
            Template::PubkeyHash(hash) => self
                .keys
                .iter()
                .map(|k| (k.public_key(&self.secp), k))
                .filter(|(pk, _)| key_hash_matches(hash, pk))
                .collect(),
            Template::Pubkey(pk) => self.key_for(pk).map(|k| (*pk, k)).into_iter().collect(),
            Template::Multisig { keys, .. } => keys
                .iter()
                .filter_map(|pk| self.key_for(pk).map(|k| (*pk, k)))
                .collect(),
            Template::TaprootKey(_) => Vec::new(),
        }
    }

    fn sign_ecdsa(
        &self,
        psbt: &mut Psbt,
        index: usize,
        spend: &SpendPath,
        template: &Template,
        options: &SignOptions,
    ) -> Result<(), AppError> {
        let sighash_type = match psbt.inputs[index].sighash_type {
            Some(t) => t.ecdsa_hash_ty().map_err(|e| AppError::SignerFailure {
                input_index: index,
                detail: e.to_string(),
            })?,
            None => options.sighash_type,
        };
        for (public_key, private_key) in self.signing_keys(template) {
            if !spend.accepts_key(&public_key) || psbt.inputs[index].partial_sigs.contains_key(&public_key) {
                continue;
            }
            let msg = spend::ecdsa_message(psbt, index, spend, sighash_type)
                .map_err(|detail| AppError::SignerFailure { input_index: index, detail })?;
            let signature = self.secp.sign_ecdsa(&msg, &private_key.inner);
            psbt.inputs[index]
                .partial_sigs
                .insert(public_key, ecdsa::Signature { signature, sighash_type });
            log::debug!("入力 {} に鍵 {} で署名しました。", index, public_key);
        }
        Ok(())
    }

    fn sign_taproot_key(&self, psbt: &mut Psbt, index: usize, output_key: &XOnlyPublicKey) -> Result<(), AppError> {
        let input = &psbt.inputs[index];
        if input.tap_key_sig.is_some() {
            return Ok(());
        }
        let Some(internal_key) = input.tap_internal_key else {
            log::debug!("入力 {} に tap_internal_key がありません。", index);
            return Ok(());
        };
        let merkle_root = input.tap_merkle_root;
        let Some(keypair) = self
            .keys
            .iter()
            .map(|k| Keypair::from_secret_key(&self.secp, &k.inner))
            .find(|kp| kp.x_only_public_key().0 == internal_key)
        else {
            return Ok(());
        };
        let tweaked = keypair.tap_tweak(&self.secp, merkle_root).to_keypair();
        if tweaked.x_only_public_key().0 != *output_key {
            log::warn!("入力 {} の出力鍵が内部鍵と merkle root から導出できません。", index);
            return Ok(());
        }
        let msg = spend::taproot_key_message(psbt, index, TapSighashType::Default)
            .map_err(|detail| AppError::SignerFailure { input_index: index, detail })?;
        let signature = self.secp.sign_schnorr_no_aux_rand(&msg, &tweaked);
        psbt.inputs[index].tap_key_sig = Some(taproot::Signature { signature, sighash_type: TapSighashType::Default });
        log::debug!("入力 {} に taproot キーパス署名を追加しました。", index);
        Ok(())
    }
}

impl SigningCapability for KeyStoreSigner {
    fn fill_signatures(&self, psbt: &mut Psbt, options: &SignOptions) -> Result<(), AppError> {
        if self.keys.is_empty() {
            return Err(AppError::SignerUnavailable("鍵ストアに秘密鍵がありません".to_string()));
        }
        for index in 0..psbt.inputs.len() {
            if !options.scope.contains(index) || psbt.inputs[index].is_final() {
                continue;
            }
            let spend = match spend::resolve(psbt, index) {
                Ok(spend) => spend,
                Err(missing) => {
                    log::debug!("入力 {} は署名できません: {:?}", index, missing);
                    continue;
                }
            };
            match spend.template() {
                Some(Template::TaprootKey(output_key)) => self.sign_taproot_key(psbt, index, &output_key)?,
                Some(template) => self.sign_ecdsa(psbt, index, &spend, &template, options)?,
                None => log::debug!("入力 {} のスクリプトには対応していません。", index),
            }
        }
        Ok(())
    }
}
