//! Merge Engine
//!
//! 同じ未署名トランザクションに対する複数の PSBT を一つにまとめる。
//! 食い違いは黙って捨てずにエラーとして返す。失敗しても引数の PSBT は変わらない。

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;

use bitcoin::psbt::{self, Psbt};

use crate::error::AppError;
use crate::model::PsbtInputExt;

/// `base` と `incoming` をマージした新しい PSBT を返す。
pub fn merge(base: &Psbt, incoming: &Psbt) -> Result<Psbt, AppError> {
    if base.unsigned_tx != incoming.unsigned_tx {
        let err = AppError::IncompatibleTransactions {
            base: base.unsigned_tx.compute_txid(),
            incoming: incoming.unsigned_tx.compute_txid(),
        };
        log::warn!("{}", err);
        return Err(err);
    }
    let mut merged = base.clone();
    let incoming = incoming.clone();

    if merged.version != incoming.version {
        return Err(conflict("グローバル".to_string(), "version"));
    }
    union_map(&mut merged.xpub, incoming.xpub, |_| conflict("グローバル".to_string(), "xpub"))?;
    union_map(&mut merged.proprietary, incoming.proprietary, |_| {
        conflict("グローバル".to_string(), "proprietary")
    })?;
    union_map(&mut merged.unknown, incoming.unknown, |_| conflict("グローバル".to_string(), "unknown"))?;

    for (index, (target, other)) in merged.inputs.iter_mut().zip(incoming.inputs).enumerate() {
        merge_input(index, target, other)?;
    }
    for (index, (target, other)) in merged.outputs.iter_mut().zip(incoming.outputs).enumerate() {
        merge_output(index, target, other)?;
    }
    log::info!("PSBTをマージしました: txid={}", merged.unsigned_tx.compute_txid());
    Ok(merged)
}

/// 複数の PSBT を順にマージする。空の場合はエラー。
pub fn merge_all<I>(psbts: I) -> Result<Psbt, AppError>
where
    I: IntoIterator<Item = Psbt>,
{
    let mut iter = psbts.into_iter();
    let first = iter
        .next()
        .ok_or_else(|| AppError::InputValidation("マージするPSBTがありません".to_string()))?;
    iter.try_fold(first, |acc, next| merge(&acc, &next))
}

pub(crate) fn conflict(location: String, field: &'static str) -> AppError {
    AppError::ConflictingData { location, field }
}

pub(crate) fn union_map<K: Ord, V: PartialEq>(
    base: &mut BTreeMap<K, V>,
    incoming: BTreeMap<K, V>,
    on_conflict: impl Fn(&K) -> AppError,
) -> Result<(), AppError> {
    for (key, value) in incoming {
        match base.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(value);
            }
            Entry::Occupied(slot) => {
                if *slot.get() != value {
                    return Err(on_conflict(slot.key()));
                }
            }
        }
    }
    Ok(())
}

fn union_option<T: PartialEq>(
    base: &mut Option<T>,
    incoming: Option<T>,
    location: &str,
    field: &'static str,
) -> Result<(), AppError> {
    let Some(value) = incoming else {
        return Ok(());
    };
    match base {
        None => *base = Some(value),
        Some(existing) if *existing == value => {}
        Some(_) => return Err(conflict(location.to_string(), field)),
    }
    Ok(())
}

/// 確定の有無に関係なく両側から集める情報
fn union_retained(location: &str, base: &mut psbt::Input, incoming: &mut psbt::Input) -> Result<(), AppError> {
    union_option(&mut base.non_witness_utxo, incoming.non_witness_utxo.take(), location, "non_witness_utxo")?;
    union_option(&mut base.witness_utxo, incoming.witness_utxo.take(), location, "witness_utxo")?;
    union_map(&mut base.proprietary, std::mem::take(&mut incoming.proprietary), |_| {
        conflict(location.to_string(), "proprietary")
    })?;
    union_map(&mut base.unknown, std::mem::take(&mut incoming.unknown), |_| {
        conflict(location.to_string(), "unknown")
    })
}

fn merge_input(index: usize, base: &mut psbt::Input, mut incoming: psbt::Input) -> Result<(), AppError> {
    let location = format!("入力 {}", index);
    match (base.is_final(), incoming.is_final()) {
        (true, true) => {
            if base.final_script_sig != incoming.final_script_sig
                || base.final_script_witness != incoming.final_script_witness
            {
                return Err(conflict(location, "final_script"));
            }
            union_retained(&location, base, &mut incoming)
        }
        (true, false) => union_retained(&location, base, &mut incoming),
        (false, true) => {
            union_retained(&location, &mut incoming, base)?;
            *base = incoming;
            Ok(())
        }
        (false, false) => merge_open_input(index, &location, base, incoming),
    }
}

fn merge_open_input(
    index: usize,
    location: &str,
    base: &mut psbt::Input,
    mut incoming: psbt::Input,
) -> Result<(), AppError> {
    union_retained(location, base, &mut incoming)?;

    union_map(&mut base.partial_sigs, incoming.partial_sigs, |key| AppError::InconsistentSignature {
        input_index: index,
        key: key.to_string(),
    })?;
    if let (Some(a), Some(b)) = (&base.tap_key_sig, &incoming.tap_key_sig) {
        if a != b {
            let key = base
                .tap_internal_key
                .or(incoming.tap_internal_key)
                .map(|k| k.to_string())
                .unwrap_or_else(|| "taproot key path".to_string());
            return Err(AppError::InconsistentSignature { input_index: index, key });
        }
    }
    union_option(&mut base.tap_key_sig, incoming.tap_key_sig, location, "tap_key_sig")?;
    union_map(&mut base.tap_script_sigs, incoming.tap_script_sigs, |(key, leaf)| {
        AppError::InconsistentSignature { input_index: index, key: format!("{} (leaf {})", key, leaf) }
    })?;

    union_option(&mut base.sighash_type, incoming.sighash_type, location, "sighash_type")?;
    union_option(&mut base.redeem_script, incoming.redeem_script, location, "redeem_script")?;
    union_option(&mut base.witness_script, incoming.witness_script, location, "witness_script")?;
    union_map(&mut base.bip32_derivation, incoming.bip32_derivation, |_| {
        conflict(location.to_string(), "bip32_derivation")
    })?;
    union_map(&mut base.ripemd160_preimages, incoming.ripemd160_preimages, |_| {
        conflict(location.to_string(), "ripemd160_preimages")
    })?;
    union_map(&mut base.sha256_preimages, incoming.sha256_preimages, |_| {
        conflict(location.to_string(), "sha256_preimages")
    })?;
    union_map(&mut base.hash160_preimages, incoming.hash160_preimages, |_| {
        conflict(location.to_string(), "hash160_preimages")
    })?;
    union_map(&mut base.hash256_preimages, incoming.hash256_preimages, |_| {
        conflict(location.to_string(), "hash256_preimages")
    })?;
    union_map(&mut base.tap_scripts, incoming.tap_scripts, |_| conflict(location.to_string(), "tap_scripts"))?;
    union_map(&mut base.tap_key_origins, incoming.tap_key_origins, |_| {
        conflict(location.to_string(), "tap_key_origins")
    })?;
    union_option(&mut base.tap_internal_key, incoming.tap_internal_key, location, "tap_internal_key")?;
    union_option(&mut base.tap_merkle_root, incoming.tap_merkle_root, location, "tap_merkle_root")
}

fn merge_output(index: usize, base: &mut psbt::Output, incoming: psbt::Output) -> Result<(), AppError> {
    let location = format!("出力 {}", index);
    let location = location.as_str();
    union_option(&mut base.redeem_script, incoming.redeem_script, location, "redeem_script")?;
    union_option(&mut base.witness_script, incoming.witness_script, location, "witness_script")?;
    union_map(&mut base.bip32_derivation, incoming.bip32_derivation, |_| {
        conflict(location.to_string(), "bip32_derivation")
    })?;
    union_option(&mut base.tap_internal_key, incoming.tap_internal_key, location, "tap_internal_key")?;
    union_option(&mut base.tap_tree, incoming.tap_tree, location, "tap_tree")?;
    union_map(&mut base.tap_key_origins, incoming.tap_key_origins, |_| {
        conflict(location.to_string(), "tap_key_origins")
    })?;
    union_map(&mut base.proprietary, incoming.proprietary, |_| conflict(location.to_string(), "proprietary"))?;
    union_map(&mut base.unknown, incoming.unknown, |_| conflict(location.to_string(), "unknown"))
}
