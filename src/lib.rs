//! Alkanes transaction builder
//!
//! This library builds the Bitcoin transactions that deploy and call alkanes
//! contracts. Contracts are inscribed with a Taproot commit/reveal pair and
//! invoked through Runestone-wrapped protostones.
//!
//! ## Architecture
//!
//! The library is organized into several key modules:
//! - `alkanes`: payload envelopes, protostone encoding, the commit, reveal and
//!   execute builders and the `AlkanesManager` orchestration layer
//! - `utils`: the fee/size model and greedy UTXO selection
//! - `account`: wallet addresses, address types and spend strategy
//! - `transaction`: PSBT assembly, per-address-type inputs and size estimation
//! - `signer`: the signer seam and a keypair-backed reference signer
//! - `rpc`: collaborator traits and the Esplora client

pub mod account;
pub mod alkanes;
pub mod rpc;
pub mod signer;
pub mod transaction;
pub mod utils;

// Re-export key types for convenience
pub use account::{Account, AddressInfo, AddressType, SpendStrategy};
pub use alkanes::{AlkanesManager, AlkanesPayload, ProtostoneEdict, ProtostoneMessage};
pub use rpc::Provider;
pub use transaction::TxOptions;
pub use utils::{FeeEstimate, FeeModel, NetworkConstants, UnspentOutput};

// Re-export external types for convenience
pub use bitcoin::{Network, Psbt, ScriptBuf, Transaction};

/// Error types for the alkanes transaction builder
#[derive(Debug, thiserror::Error)]
pub enum AlkanesError {
    /// The gathered UTXOs cannot cover the outputs plus fee
    #[error("Insufficient balance: required {required} sats, available {available} sats")]
    InsufficientBalance { required: u64, available: u64 },
    /// Invalid combination of optional parameters
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// The commit output spent by a reveal could not be found
    #[error("Commit output {txid}:{vout} not found")]
    MissingCommitOutput { txid: String, vout: u32 },
    /// The signer lacks a capability the operation needs
    #[error("Signer capability missing: {0}")]
    SignerCapabilityMissing(String),
    #[error("Address error: {0}")]
    Address(String),
    #[error("Key error: {0}")]
    Key(String),
    #[error("Taproot error: {0}")]
    Taproot(String),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Signing error: {0}")]
    Signing(String),
    #[error("Encoding error: {0}")]
    Encoding(String),
    #[error("RPC error: {0}")]
    Rpc(String),
}

/// Result type for the alkanes transaction builder
pub type Result<T> = core::result::Result<T, AlkanesError>;

impl From<bitcoin::address::ParseError> for AlkanesError {
    fn from(err: bitcoin::address::ParseError) -> Self {
        AlkanesError::Address(err.to_string())
    }
}

impl From<secp256k1::Error> for AlkanesError {
    fn from(err: secp256k1::Error) -> Self {
        AlkanesError::Key(err.to_string())
    }
}

impl From<bitcoin::key::ParsePublicKeyError> for AlkanesError {
    fn from(err: bitcoin::key::ParsePublicKeyError) -> Self {
        AlkanesError::Key(err.to_string())
    }
}

impl From<bitcoin::taproot::TaprootBuilderError> for AlkanesError {
    fn from(err: bitcoin::taproot::TaprootBuilderError) -> Self {
        AlkanesError::Taproot(format!("{err:?}"))
    }
}

impl From<bitcoin::psbt::Error> for AlkanesError {
    fn from(err: bitcoin::psbt::Error) -> Self {
        AlkanesError::Transaction(err.to_string())
    }
}

impl From<bitcoin::psbt::ExtractTxError> for AlkanesError {
    fn from(err: bitcoin::psbt::ExtractTxError) -> Self {
        AlkanesError::Transaction(format!("{err:?}"))
    }
}

impl From<bitcoin::sighash::TaprootError> for AlkanesError {
    fn from(err: bitcoin::sighash::TaprootError) -> Self {
        AlkanesError::Signing(err.to_string())
    }
}

impl From<bitcoin::consensus::encode::Error> for AlkanesError {
    fn from(err: bitcoin::consensus::encode::Error) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}

impl From<hex::FromHexError> for AlkanesError {
    fn from(err: hex::FromHexError) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}

impl From<base64::DecodeError> for AlkanesError {
    fn from(err: base64::DecodeError) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}

impl From<std::io::Error> for AlkanesError {
    fn from(err: std::io::Error) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}

impl From<serde_json::Error> for AlkanesError {
    fn from(err: serde_json::Error) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}

impl From<reqwest::Error> for AlkanesError {
    fn from(err: reqwest::Error) -> Self {
        AlkanesError::Rpc(err.to_string())
    }
}

impl From<anyhow::Error> for AlkanesError {
    fn from(err: anyhow::Error) -> Self {
        AlkanesError::Encoding(err.to_string())
    }
}
