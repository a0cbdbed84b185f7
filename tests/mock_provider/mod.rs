//! In-memory chain for integration tests.
//!
//! `MockChain` implements the fee rate, previous output and broadcast
//! collaborators. Broadcast transactions are recorded and their outputs
//! become visible to later lookups, so a reveal can find its commit.
#![allow(dead_code)]

use alkanes_txbuilder::account::{parse_address, Account, AddressInfo, AddressType, SpendStrategy};
use alkanes_txbuilder::rpc::{
    BroadcastResult, Broadcaster, FeeRateSource, PreviousOutputLookup, Provider,
};
use alkanes_txbuilder::transaction::{psbt_from_base64, PsbtSizeEstimator};
use alkanes_txbuilder::utils::{FeeModel, UnspentOutput};
use alkanes_txbuilder::{AlkanesError, Result};
use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::key::{CompressedPublicKey, Keypair};
use bitcoin::secp256k1::{Secp256k1, SecretKey};
use bitcoin::{
    absolute::LockTime, transaction::Version, Address, Amount, Network, OutPoint, Psbt, ScriptBuf,
    Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const NETWORK: Network = Network::Regtest;

pub struct MockChain {
    pub fee_rate: f64,
    pub outputs: Mutex<HashMap<OutPoint, u64>>,
    pub raw_txs: Mutex<HashMap<Txid, String>>,
    pub broadcasted_txs: Mutex<Vec<Transaction>>,
    pub lookups: AtomicUsize,
}

impl MockChain {
    pub fn new(fee_rate: f64) -> Arc<Self> {
        Arc::new(Self {
            fee_rate,
            outputs: Mutex::new(HashMap::new()),
            raw_txs: Mutex::new(HashMap::new()),
            broadcasted_txs: Mutex::new(Vec::new()),
            lookups: AtomicUsize::new(0),
        })
    }

    pub fn add_transaction(&self, tx: &Transaction) {
        let txid = tx.compute_txid();
        let mut outputs = self.outputs.lock().unwrap();
        for (vout, output) in tx.output.iter().enumerate() {
            outputs.insert(OutPoint::new(txid, vout as u32), output.value.to_sat());
        }
        self.raw_txs.lock().unwrap().insert(txid, serialize_hex(tx));
    }

    pub fn lookup_count(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }

    pub fn broadcast_count(&self) -> usize {
        self.broadcasted_txs.lock().unwrap().len()
    }
}

#[async_trait]
impl FeeRateSource for MockChain {
    async fn get_fee_estimate_for_confirmation_target(&self, _blocks: u16) -> Result<f64> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.fee_rate)
    }
}

#[async_trait]
impl PreviousOutputLookup for MockChain {
    async fn get_output_value(&self, txid: &Txid, vout: u32) -> Result<Option<u64>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.outputs.lock().unwrap().get(&OutPoint::new(*txid, vout)).copied())
    }

    async fn get_raw_transaction_hex(&self, txid: &Txid) -> Result<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.raw_txs
            .lock()
            .unwrap()
            .get(txid)
            .cloned()
            .ok_or_else(|| AlkanesError::Rpc(format!("unknown transaction {txid}")))
    }
}

#[async_trait]
impl Broadcaster for MockChain {
    async fn push_psbt(&self, psbt_base64: &str) -> Result<BroadcastResult> {
        let psbt: Psbt = psbt_from_base64(psbt_base64)?;
        let tx = psbt.extract_tx_unchecked_fee_rate();
        self.add_transaction(&tx);
        self.broadcasted_txs.lock().unwrap().push(tx.clone());
        Ok(BroadcastResult {
            txid: tx.compute_txid().to_string(),
            raw_tx: serialize_hex(&tx),
            vsize: tx.vsize() as u64,
        })
    }
}

pub fn provider(chain: &Arc<MockChain>) -> Provider {
    let fee_model = FeeModel::default();
    Provider {
        network: NETWORK,
        fee_model,
        fee_rates: chain.clone(),
        outputs: chain.clone(),
        size_estimator: Arc::new(PsbtSizeEstimator::new(fee_model)),
        broadcaster: chain.clone(),
    }
}

/// Wallet with one key per address type
pub struct TestWallet {
    pub taproot_keypair: Keypair,
    pub account: Account,
}

fn compressed(seed: u8) -> CompressedPublicKey {
    let secp = Secp256k1::new();
    CompressedPublicKey(SecretKey::from_slice(&[seed; 32]).unwrap().public_key(&secp))
}

pub fn test_wallet() -> TestWallet {
    let secp = Secp256k1::new();
    let secret = SecretKey::from_slice(&[11u8; 32]).unwrap();
    let taproot_keypair = Keypair::from_secret_key(&secp, &secret);
    let taproot_pubkey = CompressedPublicKey(taproot_keypair.public_key());

    let legacy = compressed(21);
    let nested = compressed(22);
    let native = compressed(23);
    let info = |pubkey: &CompressedPublicKey, address: Address| AddressInfo {
        pubkey: pubkey.to_string(),
        address: address.to_string(),
    };

    let account = Account {
        legacy: info(&legacy, Address::p2pkh(legacy, NETWORK)),
        nested_segwit: info(&nested, Address::p2shwpkh(&nested, NETWORK)),
        native_segwit: info(&native, Address::p2wpkh(&native, NETWORK)),
        taproot: info(
            &taproot_pubkey,
            Address::p2tr(&secp, taproot_keypair.x_only_public_key().0, None, NETWORK),
        ),
        spend_strategy: SpendStrategy::default(),
        network: NETWORK,
    };
    TestWallet { taproot_keypair, account }
}

/// UTXO of `amount` paying the wallet's address of `address_type`
pub fn utxo(
    wallet: &TestWallet,
    seed: u8,
    amount: u64,
    address_type: AddressType,
) -> UnspentOutput {
    let address = wallet.account.address_info(address_type).address.clone();
    let script = parse_address(&address, NETWORK).unwrap().script_pubkey();
    UnspentOutput {
        txid: Txid::from_byte_array([seed; 32]).to_string(),
        vout: 0,
        address,
        script_pubkey: hex::encode(script.as_bytes()),
        amount,
        address_type,
    }
}

pub fn taproot_utxo(wallet: &TestWallet, seed: u8, amount: u64) -> UnspentOutput {
    utxo(wallet, seed, amount, AddressType::Taproot)
}

/// Legacy UTXO whose full previous transaction is known to the chain
pub fn legacy_utxo(chain: &MockChain, wallet: &TestWallet, seed: u8, amount: u64) -> UnspentOutput {
    let address = wallet.account.legacy.address.clone();
    let script = parse_address(&address, NETWORK).unwrap().script_pubkey();
    let prev_tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut { value: Amount::from_sat(amount), script_pubkey: script.clone() }],
    };
    chain.add_transaction(&prev_tx);
    UnspentOutput {
        txid: prev_tx.compute_txid().to_string(),
        vout: 0,
        address,
        script_pubkey: hex::encode(script.as_bytes()),
        amount,
        address_type: AddressType::Legacy,
    }
}

/// No output other than the protostone may hold less than dust
pub fn assert_no_dust_outputs(psbt: &Psbt) {
    for (index, output) in psbt.unsigned_tx.output.iter().enumerate() {
        let value = output.value.to_sat();
        if output.script_pubkey.is_op_return() {
            assert_eq!(value, 0, "protostone output {index} carries value");
        } else {
            assert!(value >= 546, "output {index} holds {value} sats, below dust");
        }
    }
}
