//! Collaborator interfaces for chain access
//!
//! This module handles:
//! - Fee rate lookup
//! - Previous output and raw transaction lookup
//! - Transaction size estimation
//! - Broadcasting signed transactions
//!
//! The builders only talk to the chain through these traits. `Provider`
//! bundles one implementation of each with the network parameters.

pub mod esplora;

use async_trait::async_trait;
use bitcoin::{Network, Psbt, Txid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::transaction::PsbtSizeEstimator;
use crate::utils::{FeeEstimate, FeeModel, FeeRate, NetworkConstants};
use crate::Result;
use esplora::{EsploraClient, EsploraConfig};

/// Source of network fee rates
#[async_trait]
pub trait FeeRateSource: Send + Sync {
    /// Fee rate in sat/vB expected to confirm within `blocks` blocks
    async fn get_fee_estimate_for_confirmation_target(&self, blocks: u16) -> Result<f64>;
}

/// Measures the virtual size of a PSBT once signed
#[async_trait]
pub trait TransactionSizeEstimator: Send + Sync {
    async fn estimate(&self, psbt: &Psbt, fee_rate: FeeRate) -> Result<FeeEstimate>;
}

/// Lookup of previously confirmed or broadcast transactions
#[async_trait]
pub trait PreviousOutputLookup: Send + Sync {
    /// Value of `txid:vout`, or `None` if the output is unknown
    async fn get_output_value(&self, txid: &Txid, vout: u32) -> Result<Option<u64>>;
    async fn get_raw_transaction_hex(&self, txid: &Txid) -> Result<String>;
}

/// Result of pushing a transaction to the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastResult {
    /// Transaction ID
    pub txid: String,
    /// Raw transaction hex
    pub raw_tx: String,
    /// Virtual size in vbytes
    pub vsize: u64,
}

/// Pushes finalized transactions to the network
#[async_trait]
pub trait Broadcaster: Send + Sync {
    /// Extract and broadcast a finalized base64 PSBT
    async fn push_psbt(&self, psbt_base64: &str) -> Result<BroadcastResult>;
}

/// Chain collaborators and network parameters shared by the builders
#[derive(Clone)]
pub struct Provider {
    /// Bitcoin network
    pub network: Network,
    /// Fee model with the network's constants
    pub fee_model: FeeModel,
    /// Fee rate lookup
    pub fee_rates: Arc<dyn FeeRateSource>,
    /// Previous output lookup
    pub outputs: Arc<dyn PreviousOutputLookup>,
    /// Size estimation for the two-pass fee convergence
    pub size_estimator: Arc<dyn TransactionSizeEstimator>,
    /// Broadcast
    pub broadcaster: Arc<dyn Broadcaster>,
}

impl Provider {
    /// Provider backed by an Esplora instance and local size estimation
    pub fn esplora(
        config: EsploraConfig,
        network: Network,
        constants: NetworkConstants,
    ) -> Result<Self> {
        let client = Arc::new(EsploraClient::new(config)?);
        let fee_model = FeeModel::new(constants);
        Ok(Self {
            network,
            fee_model,
            fee_rates: client.clone(),
            outputs: client.clone(),
            size_estimator: Arc::new(PsbtSizeEstimator::new(fee_model)),
            broadcaster: client,
        })
    }

    pub fn constants(&self) -> &NetworkConstants {
        &self.fee_model.constants
    }
}
