//! Wallet account addresses and spend strategy
//!
//! This module provides:
//! - The closed set of spendable address types
//! - Per-type address and public key information
//! - The spend strategy used to pre-sort UTXOs and pick the change address

use bitcoin::key::{CompressedPublicKey, XOnlyPublicKey};
use bitcoin::{Address, AddressType as BitcoinAddressType, Network};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::utils::UnspentOutput;
use crate::{AlkanesError, Result};

/// Address types supported by the account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    /// Legacy P2PKH address (1...)
    Legacy,
    /// Nested SegWit P2SH-P2WPKH address (3...)
    NestedSegwit,
    /// Native SegWit P2WPKH address (bc1q...)
    NativeSegwit,
    /// Taproot P2TR address (bc1p...)
    Taproot,
}

impl AddressType {
    /// Classify an address string for the given network
    pub fn from_address(address: &str, network: Network) -> Result<Self> {
        let address = parse_address(address, network)?;
        match address.address_type() {
            Some(BitcoinAddressType::P2pkh) => Ok(AddressType::Legacy),
            Some(BitcoinAddressType::P2sh) => Ok(AddressType::NestedSegwit),
            Some(BitcoinAddressType::P2wpkh) => Ok(AddressType::NativeSegwit),
            Some(BitcoinAddressType::P2tr) => Ok(AddressType::Taproot),
            other => Err(AlkanesError::Address(format!(
                "unsupported address type {other:?} for {address}"
            ))),
        }
    }

    pub fn is_taproot(&self) -> bool {
        matches!(self, AddressType::Taproot)
    }
}

/// Parse an address and check it against the network
pub fn parse_address(address: &str, network: Network) -> Result<Address> {
    Ok(Address::from_str(address)?.require_network(network)?)
}

/// Spend strategy for UTXO selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpendStrategy {
    /// Order of address types to use for spending
    pub address_order: Vec<AddressType>,
    /// Whether to sort UTXOs from greatest to least
    pub utxo_sort_greatest_to_least: bool,
    /// Address type to use for change
    pub change_address: AddressType,
}

impl Default for SpendStrategy {
    fn default() -> Self {
        Self {
            address_order: vec![
                AddressType::NativeSegwit,
                AddressType::NestedSegwit,
                AddressType::Taproot,
                AddressType::Legacy,
            ],
            utxo_sort_greatest_to_least: true,
            change_address: AddressType::NativeSegwit,
        }
    }
}

impl SpendStrategy {
    /// Pre-sort UTXOs for greedy selection
    ///
    /// Groups by `address_order`, dropping types not listed, and sorts each
    /// group by amount. The sort is stable so equal amounts keep their order.
    pub fn order_utxos(&self, utxos: &[UnspentOutput]) -> Vec<UnspentOutput> {
        let mut ordered = Vec::with_capacity(utxos.len());
        for address_type in &self.address_order {
            let mut group: Vec<UnspentOutput> = utxos
                .iter()
                .filter(|u| u.address_type == *address_type)
                .cloned()
                .collect();
            if self.utxo_sort_greatest_to_least {
                group.sort_by(|a, b| b.amount.cmp(&a.amount));
            } else {
                group.sort_by(|a, b| a.amount.cmp(&b.amount));
            }
            ordered.extend(group);
        }
        ordered
    }
}

/// Account address information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressInfo {
    /// Public key (hex, compressed)
    pub pubkey: String,
    /// Address
    pub address: String,
}

/// Account information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Legacy address information
    pub legacy: AddressInfo,
    /// Nested SegWit address information
    pub nested_segwit: AddressInfo,
    /// Native SegWit address information
    pub native_segwit: AddressInfo,
    /// Taproot address information
    pub taproot: AddressInfo,
    /// Spend strategy
    pub spend_strategy: SpendStrategy,
    /// Network
    pub network: Network,
}

impl Account {
    pub fn address_info(&self, address_type: AddressType) -> &AddressInfo {
        match address_type {
            AddressType::Legacy => &self.legacy,
            AddressType::NestedSegwit => &self.nested_segwit,
            AddressType::NativeSegwit => &self.native_segwit,
            AddressType::Taproot => &self.taproot,
        }
    }

    /// Change address selected by the spend strategy
    pub fn change_address(&self) -> Result<Address> {
        let info = self.address_info(self.spend_strategy.change_address);
        parse_address(&info.address, self.network)
    }

    pub fn taproot_address(&self) -> Result<Address> {
        parse_address(&self.taproot.address, self.network)
    }

    /// Internal key for key-path taproot inputs
    ///
    /// Accepts either a 33-byte compressed key or a 32-byte x-only key.
    pub fn taproot_internal_key(&self) -> Result<XOnlyPublicKey> {
        let bytes = hex::decode(&self.taproot.pubkey)?;
        match bytes.len() {
            32 => Ok(XOnlyPublicKey::from_slice(&bytes)?),
            _ => Ok(CompressedPublicKey::from_slice(&bytes)?.0.x_only_public_key().0),
        }
    }

    /// Public key backing the nested segwit redeem script
    pub fn nested_segwit_pubkey(&self) -> Result<CompressedPublicKey> {
        Ok(CompressedPublicKey::from_slice(&hex::decode(&self.nested_segwit.pubkey)?)?)
    }
}
