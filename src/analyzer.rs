//! PSBT の状態分析 (次に誰が何をすべきか)

use bitcoin::psbt::Psbt;
use bitcoin::{Address, Amount, Network, SignedAmount};

use crate::finalizer::{Finalizer, apply_final, extract_transaction};
use crate::model::{PsbtInputExt, has_utxo, spent_utxo};
use crate::types::{Analysis, InputStatus, OutputSummary, Role};

/// `inputs - outputs`。どちらかが i64 に収まらない場合は `None`
fn signed_difference(inputs: Amount, outputs: Amount) -> Option<SignedAmount> {
    let inputs = i64::try_from(inputs.to_sat()).ok()?;
    let outputs = i64::try_from(outputs.to_sat()).ok()?;
    inputs.checked_sub(outputs).map(SignedAmount::from_sat)
}

/// PSBT を分析する。PSBT は変更しない。
pub fn analyze(psbt: &Psbt, network: Network) -> Analysis {
    let finalizer = Finalizer::new();
    let mut dry_run = psbt.clone();
    let mut inputs = Vec::with_capacity(psbt.inputs.len());

    for (index, input) in psbt.inputs.iter().enumerate() {
        let mut status = InputStatus {
            index,
            has_utxo: has_utxo(psbt, index),
            is_final: input.is_final(),
            next: None,
            missing: None,
        };
        if !status.is_final {
            match finalizer.finalize_input(psbt, index) {
                Ok(scripts) => {
                    apply_final(&mut dry_run.inputs[index], scripts);
                    status.next = Some(Role::Finalizer);
                }
                Err(missing) => {
                    status.next = Some(missing.responsible_role());
                    status.missing = Some(missing);
                }
            }
        }
        log::debug!("入力 {}: {:?}", index, status);
        inputs.push(status);
    }

    let all_final = inputs.iter().all(|i| i.is_final);
    let all_signed = inputs.iter().all(|i| i.is_final || i.next == Some(Role::Finalizer));
    let next_role = if inputs.iter().any(|i| !i.has_utxo) {
        Role::Updater
    } else if all_final {
        Role::Extractor
    } else if all_signed {
        Role::Finalizer
    } else {
        Role::Signer
    };

    let input_total = (0..psbt.inputs.len())
        .map(|i| spent_utxo(psbt, i).map(|utxo| utxo.value.to_sat()))
        .try_fold(0u64, |acc, value| acc.checked_add(value?))
        .map(Amount::from_sat);
    let output_total = psbt
        .unsigned_tx
        .output
        .iter()
        .try_fold(0u64, |acc, o| acc.checked_add(o.value.to_sat()))
        .map(Amount::from_sat);
    let fee = match (input_total, output_total) {
        (Some(inputs), Some(outputs)) => signed_difference(inputs, outputs),
        _ => None,
    };
    if fee.is_none() {
        log::warn!("入力金額が不明または範囲外のため手数料を計算できません。");
    }

    let outputs = psbt
        .unsigned_tx
        .output
        .iter()
        .enumerate()
        .map(|(index, out)| OutputSummary {
            index,
            amount: out.value,
            script_pubkey: out.script_pubkey.clone(),
            address: Address::from_script(&out.script_pubkey, network).ok().map(|a| a.to_string()),
        })
        .collect();

    // 署名が揃っている場合だけ、確定後の大きさから手数料率を見積もる
    let estimated_vsize = match fee {
        Some(_) if all_signed => extract_transaction(&dry_run).ok().map(|tx| tx.vsize()),
        _ => None,
    };
    let estimated_fee_rate = match (fee, estimated_vsize) {
        (Some(fee), Some(vsize)) if vsize > 0 => Some(fee.to_sat() as f64 / vsize as f64),
        _ => None,
    };

    log::info!(
        "分析結果: next={:?}, all_final={}, all_signed={}, fee={:?}",
        next_role,
        all_final,
        all_signed,
        fee
    );
    Analysis {
        inputs,
        all_final,
        all_signed,
        next_role,
        fee,
        input_total,
        output_total,
        outputs,
        estimated_vsize,
        estimated_fee_rate,
    }
}
