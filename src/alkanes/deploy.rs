//! Commit and reveal transaction builders for contract deployment
//!
//! The commit transaction funds a taproot output whose single script leaf
//! inscribes the payload. Its value covers the reveal fee and the
//! payload-proportional reserve on top of a dust output. The reveal spends
//! it through the script path and carries the protostone.

use bitcoin::psbt::{self, Psbt};
use bitcoin::taproot::LeafVersion;
use bitcoin::{Amount, OutPoint, ScriptBuf, TxOut, Txid, XOnlyPublicKey};
use log::{debug, info};
use std::collections::BTreeMap;

use super::envelope::{AlkanesPayload, TaprootScriptInfo};
use crate::account::{parse_address, Account};
use crate::rpc::Provider;
use crate::transaction::{
    add_input_for_utxo, format_inputs_to_sign, implied_fee, PsbtBuilder, TxOptions,
};
use crate::utils::{find_utxos_with_amount, FeeCalculationParams, UnspentOutput};
use crate::{AlkanesError, Result};

/// Output index of the inscription output in the commit transaction
pub const COMMIT_OUTPUT_INDEX: u32 = 0;

/// Inputs to the commit builder
#[derive(Debug, Clone)]
pub struct DeployCommitParams {
    /// Payload to inscribe
    pub payload: AlkanesPayload,
    /// Spendable UTXOs, in selection order
    pub utxos: Vec<UnspentOutput>,
    /// Tweaked taproot key the reveal script checks against
    pub tweaked_public_key: XOnlyPublicKey,
    /// Fee options
    pub options: TxOptions,
}

/// Unsigned commit transaction
#[derive(Debug, Clone)]
pub struct CommitPsbt {
    pub psbt: Psbt,
    /// Script leaf committed to by output 0, needed to build the reveal
    pub reveal_script: ScriptBuf,
    /// Fee budgeted per transaction of the pair
    pub fee: u64,
}

/// Inputs to the reveal builder
#[derive(Debug, Clone)]
pub struct DeployRevealParams {
    /// Commit transaction whose output 0 is spent
    pub commit_txid: Txid,
    /// Script leaf returned by the commit builder
    pub reveal_script: ScriptBuf,
    /// Internal key of the commit output
    pub tweaked_public_key: XOnlyPublicKey,
    /// Encoded protostone output script
    pub protostone: ScriptBuf,
    /// Address receiving the dust output and any change
    pub receiver_address: String,
    /// Fee options
    pub options: TxOptions,
}

/// Unsigned reveal transaction
#[derive(Debug, Clone)]
pub struct RevealPsbt {
    pub psbt: Psbt,
    /// Fee paid, including any change folded in below dust
    pub fee: u64,
}

/// Build the commit transaction
pub async fn create_deploy_commit_psbt(
    params: &DeployCommitParams,
    account: &Account,
    provider: &Provider,
) -> Result<CommitPsbt> {
    let fee_model = &provider.fee_model;
    let fee_rate = fee_model.fee_rate(params.options.fee_rate)?;
    let dust = fee_model.dust();
    let forced_fee = params.options.forced_fee();

    let calculated_fee = fee_model.calculate_minimum_fee(
        FeeCalculationParams {
            taproot_input_count: 2,
            non_taproot_input_count: 0,
            output_count: 2,
        },
        fee_rate,
    );
    let mut fee = forced_fee.unwrap_or(calculated_fee);

    let script_info = TaprootScriptInfo::for_payload(
        params.tweaked_public_key,
        &params.payload,
        provider.network,
    )?;
    let payload_reserve = fee_model.payload_reserve(params.payload.len(), fee_rate);
    let required = |fee: u64| 2 * fee + dust + payload_reserve;

    let mut gathered = find_utxos_with_amount(&params.utxos, required(fee));
    if forced_fee.is_none() && gathered.utxos.len() > 1 {
        let shape = FeeCalculationParams::for_utxos(&gathered.utxos, 2);
        fee = fee_model.calculate_minimum_fee(shape, fee_rate);
        // one retry only; a shortfall after it is reported below
        if gathered.total_amount < required(fee) {
            gathered = find_utxos_with_amount(&params.utxos, required(fee));
        }
    }
    debug!(
        "Commit selected {} UTXOs totalling {} sats for fee {} and payload reserve {}",
        gathered.utxos.len(),
        gathered.total_amount,
        fee,
        payload_reserve
    );

    if gathered.total_amount < required(fee) {
        return Err(AlkanesError::InsufficientBalance {
            required: required(fee),
            available: gathered.total_amount,
        });
    }

    let mut builder = PsbtBuilder::new();
    for utxo in &gathered.utxos {
        add_input_for_utxo(&mut builder, utxo, account, provider.outputs.as_ref()).await?;
    }

    builder.add_output(script_info.script_pubkey(), fee + payload_reserve + dust);
    let change = gathered.total_amount - required(fee);
    if change >= dust {
        builder.add_output(account.change_address()?.script_pubkey(), change);
    } else {
        debug!("Folding {} sats of commit change into the fee", change);
    }

    let mut psbt = builder.build()?;
    format_inputs_to_sign(&mut psbt, account)?;

    Ok(CommitPsbt {
        psbt,
        reveal_script: script_info.reveal_script,
        fee,
    })
}

/// Build the reveal transaction spending the commit output
pub async fn create_deploy_reveal_psbt(
    params: &DeployRevealParams,
    provider: &Provider,
) -> Result<RevealPsbt> {
    let dust = provider.fee_model.dust();
    let forced_fee = params.options.forced_fee();

    let commit_value = provider
        .outputs
        .get_output_value(&params.commit_txid, COMMIT_OUTPUT_INDEX)
        .await?
        .ok_or_else(|| AlkanesError::MissingCommitOutput {
            txid: params.commit_txid.to_string(),
            vout: COMMIT_OUTPUT_INDEX,
        })?;

    let required = dust + forced_fee.unwrap_or(0);
    if commit_value < required {
        return Err(AlkanesError::InsufficientBalance {
            required,
            available: commit_value,
        });
    }

    let script_info = TaprootScriptInfo::new(
        params.tweaked_public_key,
        params.reveal_script.clone(),
        provider.network,
    )?;
    let receiver = parse_address(&params.receiver_address, provider.network)?;

    let input = psbt::Input {
        witness_utxo: Some(TxOut {
            value: Amount::from_sat(commit_value),
            script_pubkey: script_info.script_pubkey(),
        }),
        tap_internal_key: Some(script_info.internal_key),
        tap_merkle_root: script_info.spend_info.merkle_root(),
        tap_scripts: BTreeMap::from([(
            script_info.control_block.clone(),
            (script_info.reveal_script.clone(), LeafVersion::TapScript),
        )]),
        ..Default::default()
    };

    let mut builder = PsbtBuilder::new();
    builder.add_input(OutPoint::new(params.commit_txid, COMMIT_OUTPUT_INDEX), input);
    builder.add_output(receiver.script_pubkey(), dust);
    builder.add_output(params.protostone.clone(), 0);

    // first pass without a fee keeps the whole remainder as fee
    let change = forced_fee.map_or(0, |fee| commit_value - dust - fee);
    if change > dust {
        builder.add_output(receiver.script_pubkey(), change);
    } else if change > 0 {
        debug!("Folding {} sats of reveal change into the fee", change);
    }

    let psbt = builder.build()?;
    let fee = implied_fee(&psbt)?;
    info!(
        "Built reveal spending {}:{} with fee {} sats",
        params.commit_txid, COMMIT_OUTPUT_INDEX, fee
    );
    Ok(RevealPsbt { psbt, fee })
}
