//! Execute transaction builder
//!
//! Builds a single protostone-carrying transaction that calls a contract
//! directly, without a commit/reveal pair. Alkanes-bearing UTXOs are always
//! spent so their balances reach the protostone; ordinary UTXOs are selected
//! to cover the outputs and the miner fee.

use bitcoin::{OutPoint, Psbt, ScriptBuf};
use log::{debug, info};
use std::collections::HashSet;

use crate::account::{parse_address, Account};
use crate::rpc::Provider;
use crate::transaction::{
    add_input_for_utxo, format_inputs_to_sign, implied_fee, PsbtBuilder, TxOptions,
};
use crate::utils::{find_utxos_with_amount, FeeCalculationParams, UnspentOutput};
use crate::{AlkanesError, Result};

/// Inputs to the execute builder
#[derive(Debug, Clone)]
pub struct ExecuteParams {
    /// UTXOs holding alkanes, always spent
    pub alkanes_utxos: Vec<UnspentOutput>,
    /// Spendable UTXOs, in selection order
    pub utxos: Vec<UnspentOutput>,
    /// Encoded protostone output script
    pub protostone: ScriptBuf,
    /// Fee options, including the optional frontend fee
    pub options: TxOptions,
}

/// Unsigned execute transaction
#[derive(Debug, Clone)]
pub struct ExecutePsbt {
    pub psbt: Psbt,
    /// Fee paid, including any change folded in below dust
    pub fee: u64,
}

/// Build the execute transaction
pub async fn create_execute_psbt(
    params: &ExecuteParams,
    account: &Account,
    provider: &Provider,
) -> Result<ExecutePsbt> {
    let options = &params.options;
    if options.frontend_fee > 0 && options.fee_address.is_none() {
        return Err(AlkanesError::Configuration(
            "frontend fee requires a fee address".to_string(),
        ));
    }

    let fee_model = &provider.fee_model;
    let fee_rate = fee_model.fee_rate(options.fee_rate)?;
    let dust = fee_model.dust();
    let forced_fee = options.forced_fee();

    let frontend_fee = if options.frontend_fee >= provider.constants().min_relay {
        options.frontend_fee
    } else {
        0
    };
    let fee_address = match (&options.fee_address, frontend_fee) {
        (Some(address), fee) if fee > 0 => Some(parse_address(address, provider.network)?),
        _ => None,
    };

    let output_count = 2 + usize::from(fee_address.is_some());
    let spend_targets = dust + frontend_fee;
    let minimum_fee = fee_model.calculate_minimum_fee(
        FeeCalculationParams {
            taproot_input_count: 2,
            non_taproot_input_count: 0,
            output_count,
        },
        fee_rate,
    );
    let mut miner_fee = forced_fee.unwrap_or(minimum_fee);

    let alkanes_outpoints = params
        .alkanes_utxos
        .iter()
        .map(UnspentOutput::outpoint)
        .collect::<Result<HashSet<OutPoint>>>()?;
    let mut spendable = Vec::with_capacity(params.utxos.len());
    for utxo in &params.utxos {
        if !alkanes_outpoints.contains(&utxo.outpoint()?) {
            spendable.push(utxo.clone());
        }
    }

    let gathered = find_utxos_with_amount(&spendable, spend_targets + miner_fee);
    if forced_fee.is_none() && gathered.utxos.len() > 1 {
        let inputs = params.alkanes_utxos.iter().chain(gathered.utxos.iter());
        let shape = FeeCalculationParams::for_utxos(inputs, output_count);
        miner_fee = fee_model.calculate_minimum_fee(shape, fee_rate);
        if gathered.total_amount < miner_fee {
            return Err(AlkanesError::InsufficientBalance {
                required: miner_fee,
                available: gathered.total_amount,
            });
        }
    }

    let mut builder = PsbtBuilder::new();
    for utxo in params.alkanes_utxos.iter().chain(gathered.utxos.iter()) {
        add_input_for_utxo(&mut builder, utxo, account, provider.outputs.as_ref()).await?;
    }

    builder.add_output(account.taproot_address()?.script_pubkey(), dust);
    builder.add_output(params.protostone.clone(), 0);
    if let Some(address) = &fee_address {
        builder.add_output(address.script_pubkey(), frontend_fee);
    }

    let alkanes_total: u64 = params.alkanes_utxos.iter().map(|u| u.amount).sum();
    let inputs_total = gathered.total_amount + alkanes_total;
    let outputs_total = builder.output_total();
    let required = outputs_total + miner_fee;
    if inputs_total < required {
        return Err(AlkanesError::InsufficientBalance {
            required,
            available: inputs_total,
        });
    }

    let change = inputs_total - required;
    if change >= dust {
        builder.add_output(account.change_address()?.script_pubkey(), change);
    } else {
        debug!("Folding {} sats of execute change into the fee", change);
    }

    let mut psbt = builder.build()?;
    format_inputs_to_sign(&mut psbt, account)?;
    let fee = implied_fee(&psbt)?;
    info!(
        "Built execute with {} inputs, {} outputs and fee {} sats",
        psbt.unsigned_tx.input.len(),
        psbt.unsigned_tx.output.len(),
        fee
    );
    Ok(ExecutePsbt { psbt, fee })
}
