//! PSBT assembly
//!
//! This module handles:
//! - Builder options (fee rate, forced fee, frontend fee)
//! - Accumulating inputs and outputs into a version 2 PSBT
//! - Per-address-type spend-proof material for inputs
//! - Size estimation of unsigned PSBTs with dummy witnesses

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bitcoin::consensus::encode::deserialize;
use bitcoin::psbt::{self, Psbt};
use bitcoin::script::{Builder, PushBytesBuf};
use bitcoin::{
    absolute::LockTime, transaction::Version, Amount, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxOut, Witness,
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::account::{Account, AddressType};
use crate::rpc::{PreviousOutputLookup, TransactionSizeEstimator};
use crate::utils::{FeeEstimate, FeeModel, FeeRate, UnspentOutput};
use crate::{AlkanesError, Result};

/// Schnorr signature with default sighash
const SCHNORR_SIGNATURE_SIZE: usize = 64;
/// DER ECDSA signature upper bound plus sighash byte
const ECDSA_SIGNATURE_SIZE: usize = 72;
const COMPRESSED_PUBKEY_SIZE: usize = 33;

/// Optional builder parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TxOptions {
    /// Fee rate in sat/vB. Default: looked up from the fee rate source by the
    /// orchestration layer, or `NetworkConstants::default_fee_rate` when a
    /// builder is called directly.
    pub fee_rate: Option<f64>,
    /// Forced fee in satoshis. Default: computed. Zero counts as unset.
    pub fee: Option<u64>,
    /// Frontend fee in satoshis. Default: 0, only paid when at least the
    /// minimum relay value.
    pub frontend_fee: u64,
    /// Recipient of the frontend fee, required whenever `frontend_fee > 0`
    pub fee_address: Option<String>,
}

impl TxOptions {
    pub fn forced_fee(&self) -> Option<u64> {
        self.fee.filter(|fee| *fee > 0)
    }

    pub fn with_fee(&self, fee: u64) -> Self {
        Self {
            fee: Some(fee),
            ..self.clone()
        }
    }

    pub fn with_fee_rate(&self, fee_rate: f64) -> Self {
        Self {
            fee_rate: Some(fee_rate),
            ..self.clone()
        }
    }
}

/// Spend-proof material attached to an input, one constructor per address type
#[derive(Debug, Clone, PartialEq)]
pub enum SpendProof {
    /// Full previous transaction for legacy inputs
    NonWitness(Transaction),
    /// P2SH-wrapped witness program with its redeem script
    NestedWitness { redeem_script: ScriptBuf, witness_utxo: TxOut },
    /// Witness program only (native segwit and taproot)
    Witness(TxOut),
}

impl SpendProof {
    pub async fn for_utxo(
        utxo: &UnspentOutput,
        account: &Account,
        lookup: &dyn PreviousOutputLookup,
    ) -> Result<Self> {
        let value = Amount::from_sat(utxo.amount);
        match utxo.address_type {
            AddressType::Legacy => {
                let txid = utxo.outpoint()?.txid;
                let raw = lookup.get_raw_transaction_hex(&txid).await?;
                let prev_tx: Transaction = deserialize(&hex::decode(raw.trim())?)?;
                Ok(SpendProof::NonWitness(prev_tx))
            }
            AddressType::NestedSegwit => {
                let pubkey = account.nested_segwit_pubkey()?;
                let redeem_script = ScriptBuf::new_p2wpkh(&pubkey.wpubkey_hash());
                let witness_utxo = TxOut {
                    value,
                    script_pubkey: ScriptBuf::new_p2sh(&redeem_script.script_hash()),
                };
                Ok(SpendProof::NestedWitness { redeem_script, witness_utxo })
            }
            AddressType::NativeSegwit | AddressType::Taproot => Ok(SpendProof::Witness(TxOut {
                value,
                script_pubkey: utxo.script()?,
            })),
        }
    }

    pub fn into_input(self) -> psbt::Input {
        let mut input = psbt::Input::default();
        match self {
            SpendProof::NonWitness(prev_tx) => input.non_witness_utxo = Some(prev_tx),
            SpendProof::NestedWitness { redeem_script, witness_utxo } => {
                input.redeem_script = Some(redeem_script);
                input.witness_utxo = Some(witness_utxo);
            }
            SpendProof::Witness(witness_utxo) => input.witness_utxo = Some(witness_utxo),
        }
        input
    }
}

/// Accumulates inputs and outputs before producing an unsigned PSBT
#[derive(Debug, Clone, Default)]
pub struct PsbtBuilder {
    inputs: Vec<(TxIn, psbt::Input)>,
    outputs: Vec<TxOut>,
}

impl PsbtBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, previous_output: OutPoint, input: psbt::Input) {
        let txin = TxIn {
            previous_output,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
            witness: Witness::new(),
        };
        self.inputs.push((txin, input));
    }

    pub fn add_output(&mut self, script_pubkey: ScriptBuf, value: u64) {
        self.outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey,
        });
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_total(&self) -> u64 {
        self.outputs.iter().map(|o| o.value.to_sat()).sum()
    }

    pub fn build(self) -> Result<Psbt> {
        let (txins, inputs): (Vec<TxIn>, Vec<psbt::Input>) = self.inputs.into_iter().unzip();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: txins,
            output: self.outputs,
        };
        let mut psbt = Psbt::from_unsigned_tx(tx)?;
        psbt.inputs = inputs;
        Ok(psbt)
    }
}

/// Add one input per UTXO with the spend proof its address type needs
pub async fn add_input_for_utxo(
    builder: &mut PsbtBuilder,
    utxo: &UnspentOutput,
    account: &Account,
    lookup: &dyn PreviousOutputLookup,
) -> Result<()> {
    let proof = SpendProof::for_utxo(utxo, account, lookup).await?;
    builder.add_input(utxo.outpoint()?, proof.into_input());
    Ok(())
}

/// Set the account's internal key on key-path taproot inputs
pub fn format_inputs_to_sign(psbt: &mut Psbt, account: &Account) -> Result<()> {
    let internal_key = account.taproot_internal_key()?;
    for input in psbt.inputs.iter_mut() {
        let is_p2tr = input
            .witness_utxo
            .as_ref()
            .is_some_and(|utxo| utxo.script_pubkey.is_p2tr());
        if is_p2tr && input.tap_scripts.is_empty() && input.tap_internal_key.is_none() {
            input.tap_internal_key = Some(internal_key);
        }
    }
    Ok(())
}

/// Value of the output spent by input `index`
pub fn input_value(psbt: &Psbt, index: usize) -> Result<u64> {
    let input = psbt
        .inputs
        .get(index)
        .ok_or_else(|| AlkanesError::Transaction(format!("input {index} out of range")))?;
    if let Some(utxo) = &input.witness_utxo {
        return Ok(utxo.value.to_sat());
    }
    let vout = psbt.unsigned_tx.input[index].previous_output.vout as usize;
    input
        .non_witness_utxo
        .as_ref()
        .and_then(|tx| tx.output.get(vout))
        .map(|out| out.value.to_sat())
        .ok_or_else(|| AlkanesError::Transaction(format!("input {index} has no previous output")))
}

pub fn input_total(psbt: &Psbt) -> Result<u64> {
    (0..psbt.inputs.len()).map(|i| input_value(psbt, i)).sum()
}

pub fn output_total(psbt: &Psbt) -> u64 {
    psbt.unsigned_tx.output.iter().map(|o| o.value.to_sat()).sum()
}

/// Fee implied by the PSBT's input and output values
pub fn implied_fee(psbt: &Psbt) -> Result<u64> {
    let inputs = input_total(psbt)?;
    let outputs = output_total(psbt);
    inputs.checked_sub(outputs).ok_or(AlkanesError::InsufficientBalance {
        required: outputs,
        available: inputs,
    })
}

pub fn psbt_to_base64(psbt: &Psbt) -> String {
    STANDARD.encode(psbt.serialize())
}

pub fn psbt_from_base64(encoded: &str) -> Result<Psbt> {
    let bytes = STANDARD.decode(encoded.trim())?;
    Ok(Psbt::deserialize(&bytes)?)
}

fn zero_push(len: usize) -> Result<PushBytesBuf> {
    PushBytesBuf::try_from(vec![0u8; len])
        .map_err(|e| AlkanesError::Transaction(format!("push too large: {e:?}")))
}

/// Unsigned transaction with placeholder signatures of the right size
fn with_dummy_witnesses(psbt: &Psbt) -> Result<Transaction> {
    let mut tx = psbt.unsigned_tx.clone();
    for (txin, input) in tx.input.iter_mut().zip(psbt.inputs.iter()) {
        if input.final_script_witness.is_some() || input.final_script_sig.is_some() {
            txin.witness = input.final_script_witness.clone().unwrap_or_default();
            txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
            continue;
        }

        if let Some((control_block, (script, _))) = input.tap_scripts.iter().next() {
            let mut witness = Witness::new();
            witness.push([0u8; SCHNORR_SIGNATURE_SIZE]);
            witness.push(script.as_bytes());
            witness.push(control_block.serialize());
            txin.witness = witness;
            continue;
        }

        let ecdsa_witness = || {
            Witness::from_slice(&[
                vec![0u8; ECDSA_SIGNATURE_SIZE],
                vec![0u8; COMPRESSED_PUBKEY_SIZE],
            ])
        };
        match (&input.witness_utxo, &input.redeem_script) {
            (Some(_), Some(redeem_script)) => {
                let push = PushBytesBuf::try_from(redeem_script.to_bytes())
                    .map_err(|e| {
                        AlkanesError::Transaction(format!("redeem script too large: {e:?}"))
                    })?;
                txin.script_sig = Builder::new().push_slice(push).into_script();
                txin.witness = ecdsa_witness();
            }
            (Some(utxo), None) if utxo.script_pubkey.is_p2tr() => {
                txin.witness = Witness::from_slice(&[vec![0u8; SCHNORR_SIGNATURE_SIZE]]);
            }
            (Some(_), None) => txin.witness = ecdsa_witness(),
            (None, _) => {
                txin.script_sig = Builder::new()
                    .push_slice(zero_push(ECDSA_SIGNATURE_SIZE)?)
                    .push_slice(zero_push(COMPRESSED_PUBKEY_SIZE)?)
                    .into_script();
            }
        }
    }
    Ok(tx)
}

/// Size estimator that measures the PSBT with dummy signatures in place
#[derive(Debug, Clone, Default)]
pub struct PsbtSizeEstimator {
    fee_model: FeeModel,
}

impl PsbtSizeEstimator {
    pub fn new(fee_model: FeeModel) -> Self {
        Self { fee_model }
    }

    pub fn vsize(&self, psbt: &Psbt) -> Result<u64> {
        Ok(with_dummy_witnesses(psbt)?.vsize() as u64)
    }
}

#[async_trait]
impl TransactionSizeEstimator for PsbtSizeEstimator {
    async fn estimate(&self, psbt: &Psbt, fee_rate: FeeRate) -> Result<FeeEstimate> {
        let vsize = self.vsize(psbt)?;
        let estimate = self.fee_model.estimate(vsize, fee_rate);
        debug!(
            "Estimated vsize {} vB, fee {} sats at {} sat/vB",
            vsize,
            estimate.fee,
            fee_rate.sat_per_vb()
        );
        Ok(estimate)
    }
}
