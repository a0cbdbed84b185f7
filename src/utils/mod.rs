//! Fee/size model and UTXO selection
//!
//! This module provides the numeric core shared by every builder:
//! - Network constants (dust, minimum relay, fee floor)
//! - Closed-form virtual size estimation from input/output counts
//! - Fee computation with an absolute floor
//! - Greedy UTXO selection

use bitcoin::{OutPoint, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::account::AddressType;
use crate::{AlkanesError, Result};

/// Minimum dust output value in satoshis
pub const DUST_OUTPUT_VALUE: u64 = 546;

/// Absolute floor for any computed fee in satoshis
pub const MINIMUM_FEE: u64 = 250;

/// Fixed transaction overhead (version, locktime, counts, segwit marker)
const TX_OVERHEAD_WEIGHT: u64 = 42;
/// Key-path taproot input: 41 base bytes plus a 66-byte witness
const TAPROOT_INPUT_WEIGHT: u64 = 230;
/// P2PKH input with a 72-byte signature plus its empty witness count.
///
/// Heaviest of the ECDSA kinds, so nested (364) and native (272) segwit
/// inputs are over-estimated rather than under-estimated.
const NON_TAPROOT_INPUT_WEIGHT: u64 = 593;
/// P2TR output, the largest standard output script
const OUTPUT_WEIGHT: u64 = 172;

/// Network parameters injected into the fee model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NetworkConstants {
    /// Outputs below this value are never created
    pub dust_threshold: u64,
    /// Minimum value a frontend fee must reach to be paid
    pub min_relay: u64,
    /// Absolute floor fee regardless of rate
    pub fee_floor: u64,
    /// Fee rate used by builders when none is supplied (sat/vB)
    pub default_fee_rate: f64,
    /// Confirmation target used when looking up a fee rate
    pub confirmation_target: u16,
}

impl Default for NetworkConstants {
    fn default() -> Self {
        Self {
            dust_threshold: DUST_OUTPUT_VALUE,
            min_relay: DUST_OUTPUT_VALUE,
            fee_floor: MINIMUM_FEE,
            default_fee_rate: 1.0,
            confirmation_target: 1,
        }
    }
}

/// Fee rate in satoshis per virtual byte
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct FeeRate(f64);

impl TryFrom<f64> for FeeRate {
    type Error = AlkanesError;

    fn try_from(rate: f64) -> Result<Self> {
        if rate.is_sign_negative() || rate.is_nan() || rate.is_infinite() {
            return Err(AlkanesError::Configuration(format!("invalid fee rate: {rate}")));
        }
        Ok(Self(rate))
    }
}

impl FromStr for FeeRate {
    type Err = AlkanesError;

    fn from_str(s: &str) -> Result<Self> {
        let rate = f64::from_str(s)
            .map_err(|e| AlkanesError::Configuration(format!("invalid fee rate {s}: {e}")))?;
        Self::try_from(rate)
    }
}

impl FeeRate {
    pub fn sat_per_vb(&self) -> f64 {
        self.0
    }

    /// Rate times size, rounded up to whole satoshis
    pub fn charge(&self, vsize: u64) -> u64 {
        // round to millisats first so 1.1 * 100 stays 110
        let raw = ((self.0 * vsize as f64) * 1000.0).round() / 1000.0;
        raw.ceil() as u64
    }
}

/// Fee calculation parameters
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeeCalculationParams {
    /// Number of taproot inputs
    pub taproot_input_count: usize,
    /// Number of non-taproot inputs
    pub non_taproot_input_count: usize,
    /// Number of outputs
    pub output_count: usize,
}

impl FeeCalculationParams {
    /// Shape of a transaction spending `utxos` into `output_count` outputs
    pub fn for_utxos<'a>(
        utxos: impl IntoIterator<Item = &'a UnspentOutput>,
        output_count: usize,
    ) -> Self {
        let (taproot, non_taproot): (Vec<_>, Vec<_>) =
            utxos.into_iter().partition(|utxo| utxo.address_type.is_taproot());
        Self {
            taproot_input_count: taproot.len(),
            non_taproot_input_count: non_taproot.len(),
            output_count,
        }
    }
}

/// Fee and virtual size of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeEstimate {
    /// Fee in satoshis
    pub fee: u64,
    /// Virtual size in vbytes
    pub vsize: u64,
}

/// Estimate transaction virtual size in vbytes
///
/// Sums consensus weight units per component and rounds up to whole vbytes.
pub fn estimate_tx_vsize(params: FeeCalculationParams) -> u64 {
    let weight = TX_OVERHEAD_WEIGHT
        + TAPROOT_INPUT_WEIGHT * params.taproot_input_count as u64
        + NON_TAPROOT_INPUT_WEIGHT * params.non_taproot_input_count as u64
        + OUTPUT_WEIGHT * params.output_count as u64;
    weight.div_ceil(4)
}

/// Fee model parameterised by network constants
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FeeModel {
    pub constants: NetworkConstants,
}

impl FeeModel {
    pub fn new(constants: NetworkConstants) -> Self {
        Self { constants }
    }

    pub fn dust(&self) -> u64 {
        self.constants.dust_threshold
    }

    /// Resolve an optional caller rate, falling back to the default rate
    pub fn fee_rate(&self, rate: Option<f64>) -> Result<FeeRate> {
        FeeRate::try_from(rate.unwrap_or(self.constants.default_fee_rate))
    }

    /// `max(vsize * rate, floor)`
    pub fn compute_fee(&self, vsize: u64, fee_rate: FeeRate) -> u64 {
        fee_rate.charge(vsize).max(self.constants.fee_floor)
    }

    /// Calculate minimum fee for a transaction of the given shape
    pub fn calculate_minimum_fee(&self, params: FeeCalculationParams, fee_rate: FeeRate) -> u64 {
        self.compute_fee(estimate_tx_vsize(params), fee_rate)
    }

    /// Value reserved in a commit output to pay for carrying the payload
    pub fn payload_reserve(&self, payload_len: usize, fee_rate: FeeRate) -> u64 {
        fee_rate.charge(payload_len as u64)
    }

    pub fn estimate(&self, vsize: u64, fee_rate: FeeRate) -> FeeEstimate {
        FeeEstimate {
            fee: self.compute_fee(vsize, fee_rate),
            vsize,
        }
    }
}

/// Spendable output owned by the wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnspentOutput {
    /// Transaction ID
    pub txid: String,
    /// Output index
    pub vout: u32,
    /// Address
    pub address: String,
    /// Script pubkey (hex)
    pub script_pubkey: String,
    /// Amount in satoshis
    pub amount: u64,
    /// Address type, selects the spend-proof material for the input
    pub address_type: AddressType,
}

impl UnspentOutput {
    pub fn outpoint(&self) -> Result<OutPoint> {
        let txid = Txid::from_str(&self.txid)
            .map_err(|e| AlkanesError::Transaction(format!("invalid txid {}: {e}", self.txid)))?;
        Ok(OutPoint::new(txid, self.vout))
    }

    pub fn script(&self) -> Result<ScriptBuf> {
        Ok(ScriptBuf::from_bytes(hex::decode(&self.script_pubkey)?))
    }
}

/// Gathered UTXOs for transaction construction
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatheredUtxos {
    /// Selected UTXOs, in presentation order
    pub utxos: Vec<UnspentOutput>,
    /// Total amount in satoshis
    pub total_amount: u64,
}

/// Find UTXOs covering the specified amount
///
/// Accumulates in the order given and stops once the running total reaches
/// `amount`. Never fails: callers compare `total_amount` to what they need.
pub fn find_utxos_with_amount(utxos: &[UnspentOutput], amount: u64) -> GatheredUtxos {
    let mut gathered = GatheredUtxos::default();
    for utxo in utxos {
        if gathered.total_amount >= amount {
            break;
        }
        gathered.total_amount += utxo.amount;
        gathered.utxos.push(utxo.clone());
    }
    gathered
}
