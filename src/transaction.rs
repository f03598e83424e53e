//! Creator: JSON の記述から未署名 PSBT を組み立てる

use bitcoin::{
    absolute::LockTime, consensus::encode, network::Network as BitcoinNetwork, script::PushBytesBuf,
    Address, Amount, OutPoint, Psbt, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::str::FromStr;

use crate::{
    cli::parse_network,
    config::{CreateConfig, UtxoInput},
    error::AppError,
    model,
    spend::{script_template, Template},
    types::{ProcessedUtxo, ScriptType},
};

// Bitcoin Coreのデフォルトダスト閾値 (P2PKH/P2WPKH出力に対して)
const DUST_THRESHOLD_SATS: u64 = 546;

// トランザクションサイズの推定に使用するダミーデータ
const DUMMY_SIGNATURE_LEN: usize = 72;
const DUMMY_PUBKEY_LEN: usize = 33;
const DUMMY_SCHNORR_SIGNATURE_LEN: usize = 64;

pub fn create_unsigned_psbt(config: CreateConfig, cli_network: BitcoinNetwork) -> Result<Psbt, AppError> {
    log::info!("未署名PSBTの作成を開始します。");

    let config_network = parse_network(&config.network)?;
    if config_network != cli_network {
        return Err(AppError::NetworkMismatch {
            cli_network: format!("{:?}", cli_network),
            inferred_network: format!("{:?}", config_network),
        });
    }

    // 1. 入力データの検証
    let mut processed_utxos: Vec<ProcessedUtxo> = Vec::new();
    let mut total_input_value_sats: u64 = 0;
    for utxo_input in config.utxos.iter() {
        let processed = process_utxo(utxo_input, config.default_sequence)?;
        total_input_value_sats = total_input_value_sats
            .checked_add(utxo_input.value_sats)
            .ok_or_else(|| AppError::InputValidation("入力金額の合計が大きすぎます".to_string()))?;
        log::debug!(
            "処理済みUTXO追加: txid={}, vout={}, value={}, type={:?}",
            utxo_input.txid, utxo_input.vout, utxo_input.value_sats, processed.script_type
        );
        processed_utxos.push(processed);
    }
    if processed_utxos.is_empty() {
        return Err(AppError::InputValidation("UTXOが一つも指定されていません".to_string()));
    }

    // 2. 受信者出力の作成
    let mut outputs: Vec<TxOut> = Vec::new();
    let mut total_recipient_output_value_sats: u64 = 0;
    for output_def in config.outputs.iter() {
        let address = Address::from_str(&output_def.address)
            .and_then(|addr| addr.require_network(cli_network))
            .map_err(|e| {
                AppError::InputValidation(format!(
                    "受信者アドレス形式エラーまたはネットワーク不整合 ({}): {}",
                    output_def.address, e
                ))
            })?;
        outputs.push(TxOut { value: Amount::from_sat(output_def.value_sats), script_pubkey: address.script_pubkey() });
        total_recipient_output_value_sats = total_recipient_output_value_sats
            .checked_add(output_def.value_sats)
            .ok_or_else(|| AppError::InputValidation("出力金額の合計が大きすぎます".to_string()))?;
        log::debug!("受信者出力追加: address={}, value={}", output_def.address, output_def.value_sats);
    }

    // 3. ダミー署名で vsize を見積もり、手数料とおつりを決める
    let change_address = Address::from_str(&config.change_address)
        .and_then(|addr| addr.require_network(cli_network))
        .map_err(|e| {
            AppError::ChangeAddressDerivation(format!(
                "おつりアドレス形式エラーまたはネットワーク不整合 ({}): {}",
                config.change_address, e
            ))
        })?;

    let mut sizing_inputs = Vec::with_capacity(processed_utxos.len());
    for pu in &processed_utxos {
        let (script_sig, witness) = dummy_satisfaction(pu)?;
        sizing_inputs.push(TxIn { previous_output: pu.out_point, script_sig, sequence: pu.sequence, witness });
    }
    let mut sizing_outputs = outputs.clone();
    sizing_outputs.push(TxOut { value: Amount::ZERO, script_pubkey: change_address.script_pubkey() });
    let sizing_tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: sizing_inputs,
        output: sizing_outputs,
    };

    let estimated_vsize = sizing_tx.vsize();
    let total_fee_sats = (estimated_vsize as u64)
        .checked_mul(config.fee_rate_sats_per_vb)
        .ok_or_else(|| AppError::InputValidation("手数料率が大きすぎます".to_string()))?;
    log::debug!(
        "推定vsize: {} vB, 手数料率: {} sats/vB, 計算された手数料: {} sats",
        estimated_vsize, config.fee_rate_sats_per_vb, total_fee_sats
    );

    let required = total_recipient_output_value_sats
        .checked_add(total_fee_sats)
        .ok_or_else(|| AppError::InputValidation("出力金額と手数料の合計が大きすぎます".to_string()))?;
    if total_input_value_sats < required {
        return Err(AppError::InsufficientFunds {
            available: total_input_value_sats,
            required,
            fee: total_fee_sats,
        });
    }

    let change_value_sats = total_input_value_sats - required;
    let mut final_outputs = outputs;
    if change_value_sats >= DUST_THRESHOLD_SATS {
        log::debug!("おつり発生: {} sats, おつりアドレス: {}", change_value_sats, change_address);
        final_outputs.push(TxOut {
            value: Amount::from_sat(change_value_sats),
            script_pubkey: change_address.script_pubkey(),
        });
    } else if change_value_sats > 0 {
        log::warn!(
            "おつり {} sats はダスト閾値 {} sats 未満のため手数料に含めます。",
            change_value_sats, DUST_THRESHOLD_SATS
        );
    }

    // 4. 未署名トランザクションから PSBT を作り、Updater として前出力の情報を付ける
    let unsigned_tx = Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: processed_utxos
            .iter()
            .map(|pu| TxIn {
                previous_output: pu.out_point,
                script_sig: ScriptBuf::new(),
                sequence: pu.sequence,
                witness: Witness::new(),
            })
            .collect(),
        output: final_outputs,
    };
    let mut psbt = model::create_psbt(unsigned_tx)?;

    for (index, pu) in processed_utxos.into_iter().enumerate() {
        let is_segwit = match pu.script_type {
            ScriptType::P2PKH => false,
            ScriptType::P2SH => pu.redeem_script.as_ref().is_some_and(|r| r.is_witness_program()),
            _ => true,
        };
        match pu.previous_tx {
            Some(prev_tx) => {
                model::set_non_witness_utxo(&mut psbt, index, prev_tx)?;
                if is_segwit {
                    model::set_witness_utxo(&mut psbt, index, pu.tx_out)?;
                }
            }
            None => model::set_witness_utxo(&mut psbt, index, pu.tx_out)?,
        }
        if let Some(redeem) = pu.redeem_script {
            model::set_redeem_script(&mut psbt, index, redeem)?;
        }
        if let Some(ws) = pu.witness_script {
            model::set_witness_script(&mut psbt, index, ws)?;
        }
    }

    log::info!(
        "未署名PSBTを作成しました: txid={}, 入力 {} 件, 出力 {} 件",
        psbt.unsigned_tx.compute_txid(),
        psbt.inputs.len(),
        psbt.outputs.len()
    );
    Ok(psbt)
}

fn decode_script(hex_str: &str, field: &str) -> Result<ScriptBuf, AppError> {
    hex::decode(hex_str)
        .map(ScriptBuf::from_bytes)
        .map_err(|e| AppError::InputValidation(format!("{}のデコード失敗: {}", field, e)))
}

fn process_utxo(utxo_input: &UtxoInput, default_sequence: Option<u32>) -> Result<ProcessedUtxo, AppError> {
    let txid = Txid::from_str(&utxo_input.txid)
        .map_err(|e| AppError::InputValidation(format!("無効なTXID形式 ({}): {}", utxo_input.txid, e)))?;
    let out_point = OutPoint::new(txid, utxo_input.vout);

    let script_pubkey = decode_script(&utxo_input.script_pubkey_hex, "scriptPubKeyHex")?;
    let script_type = ScriptType::from_script_buf(&script_pubkey)?;
    let tx_out = TxOut { value: Amount::from_sat(utxo_input.value_sats), script_pubkey };

    let redeem_script = utxo_input
        .redeem_script_hex
        .as_deref()
        .map(|h| decode_script(h, "redeemScriptHex"))
        .transpose()?;
    let witness_script = utxo_input
        .witness_script_hex
        .as_deref()
        .map(|h| decode_script(h, "witnessScriptHex"))
        .transpose()?;

    // P2SH なら redeem script、P2WSH (ネスト含む) なら witness script が scriptPubKey と一致すること
    let witness_program = match (&script_type, &redeem_script) {
        (ScriptType::P2SH, Some(redeem)) => {
            if ScriptBuf::new_p2sh(&redeem.script_hash()) != tx_out.script_pubkey {
                return Err(AppError::InputValidation(format!("{} の redeemScript が scriptPubKey と一致しません", out_point)));
            }
            Some(redeem.clone())
        }
        (ScriptType::P2SH, None) => {
            return Err(AppError::InputValidation(format!("P2SH入力 {} には redeemScriptHex が必要です", out_point)));
        }
        (ScriptType::P2WSH, _) => Some(tx_out.script_pubkey.clone()),
        _ => None,
    };
    if let Some(program) = witness_program.filter(|p| p.is_p2wsh()) {
        let ws = witness_script.as_ref().ok_or_else(|| {
            AppError::InputValidation(format!("P2WSH入力 {} には witnessScriptHex が必要です", out_point))
        })?;
        if ScriptBuf::new_p2wsh(&ws.wscript_hash()) != program {
            return Err(AppError::InputValidation(format!("{} の witnessScript が一致しません", out_point)));
        }
    }

    let previous_tx = match &utxo_input.previous_tx_hex {
        Some(hex_str) => {
            let bytes = hex::decode(hex_str)
                .map_err(|e| AppError::InputValidation(format!("previousTxHexのデコード失敗: {}", e)))?;
            let prev_tx: Transaction = encode::deserialize(&bytes)?;
            if prev_tx.compute_txid() != txid {
                return Err(AppError::InputValidation(format!(
                    "previousTxHex のTXID {} が {} と一致しません",
                    prev_tx.compute_txid(),
                    txid
                )));
            }
            if prev_tx.output.get(utxo_input.vout as usize) != Some(&tx_out) {
                return Err(AppError::InputValidation(format!(
                    "previousTxHex の出力 {} が scriptPubKey / 金額と一致しません",
                    utxo_input.vout
                )));
            }
            Some(prev_tx)
        }
        None => None,
    };

    let sequence = Sequence(utxo_input.sequence.or(default_sequence).unwrap_or(Sequence::MAX.0));

    Ok(ProcessedUtxo { out_point, tx_out, script_type, sequence, previous_tx, redeem_script, witness_script })
}

/// スクリプトを満たすのに必要なダミーのスタック要素
fn dummy_stack(script: &ScriptBuf) -> Vec<Vec<u8>> {
    match script_template(script) {
        Some(Template::Pubkey(_)) => vec![vec![0u8; DUMMY_SIGNATURE_LEN]],
        Some(Template::Multisig { threshold, .. }) => {
            let mut stack = vec![Vec::new()];
            stack.extend((0..threshold).map(|_| vec![0u8; DUMMY_SIGNATURE_LEN]));
            stack
        }
        Some(_) => vec![vec![0u8; DUMMY_SIGNATURE_LEN], vec![0u8; DUMMY_PUBKEY_LEN]],
        None => {
            log::warn!("スクリプトの形が不明なため、署名1つ分としてサイズを見積もります: {}", script.to_hex_string());
            vec![vec![0u8; DUMMY_SIGNATURE_LEN]]
        }
    }
}

fn push_items(items: Vec<Vec<u8>>) -> Result<ScriptBuf, AppError> {
    let mut builder = bitcoin::script::Builder::new();
    for item in items {
        let push = PushBytesBuf::try_from(item)
            .map_err(|_| AppError::Internal("ダミーscriptSigのPushBytes変換失敗".to_string()))?;
        builder = builder.push_slice(push);
    }
    Ok(builder.into_script())
}

fn with_script(mut stack: Vec<Vec<u8>>, script: &ScriptBuf) -> Vec<Vec<u8>> {
    stack.push(script.to_bytes());
    stack
}

fn required_witness_script(pu: &ProcessedUtxo) -> Result<&ScriptBuf, AppError> {
    pu.witness_script
        .as_ref()
        .ok_or_else(|| AppError::Internal(format!("入力 {} の witnessScript がありません", pu.out_point)))
}

/// 手数料計算のためのダミーの scriptSig / witness
fn dummy_satisfaction(pu: &ProcessedUtxo) -> Result<(ScriptBuf, Witness), AppError> {
    let satisfaction = match pu.script_type {
        ScriptType::P2PKH => (push_items(dummy_stack(&pu.tx_out.script_pubkey))?, Witness::new()),
        ScriptType::P2WPKH => (ScriptBuf::new(), Witness::from_slice(&dummy_stack(&pu.tx_out.script_pubkey))),
        ScriptType::P2TR => (ScriptBuf::new(), Witness::from_slice(&[vec![0u8; DUMMY_SCHNORR_SIGNATURE_LEN]])),
        ScriptType::P2WSH => {
            let ws = required_witness_script(pu)?;
            (ScriptBuf::new(), Witness::from_slice(&with_script(dummy_stack(ws), ws)))
        }
        ScriptType::P2SH => {
            let redeem = pu.redeem_script.as_ref().ok_or_else(|| {
                AppError::Internal(format!("P2SH入力 {} の redeemScript がありません", pu.out_point))
            })?;
            if redeem.is_p2wpkh() {
                (push_items(vec![redeem.to_bytes()])?, Witness::from_slice(&dummy_stack(redeem)))
            } else if redeem.is_p2wsh() {
                let ws = required_witness_script(pu)?;
                (push_items(vec![redeem.to_bytes()])?, Witness::from_slice(&with_script(dummy_stack(ws), ws)))
            } else {
                (push_items(with_script(dummy_stack(redeem), redeem))?, Witness::new())
            }
        }
    };
    Ok(satisfaction)
}
