//! Transaction signing
//!
//! This module provides:
//! - The `Signer` seam the orchestration layer signs through
//! - Taproot key tweaking for the commit/reveal internal key
//! - A keypair-backed signer for key-path taproot inputs
//! - Script-path signing of the reveal input

use async_trait::async_trait;
use bitcoin::key::{Keypair, TapTweak};
use bitcoin::psbt::Psbt;
use bitcoin::secp256k1::{Message, Secp256k1, Signing, Verification};
use bitcoin::sighash::{Prevouts, SighashCache, TapSighashType};
use bitcoin::taproot::{self, TapLeafHash};
use bitcoin::{TxOut, Witness, XOnlyPublicKey};
use log::debug;

use crate::{AlkanesError, Result};

/// Wallet signer consumed by the orchestration layer
#[async_trait]
pub trait Signer: Send + Sync {
    /// Taproot key pair, if the signer holds one
    fn taproot_keypair(&self) -> Option<Keypair>;

    /// Sign every input the signer can, optionally finalizing them
    async fn sign_all_inputs(&self, psbt: Psbt, finalize: bool) -> Result<Psbt>;
}

/// Key pair tweaked with an empty script tree
pub fn tweak_keypair<C: Signing + Verification>(secp: &Secp256k1<C>, keypair: &Keypair) -> Keypair {
    keypair.tap_tweak(secp, None).to_inner()
}

/// X-only public key of the tweaked key pair
pub fn tweaked_public_key<C: Signing + Verification>(
    secp: &Secp256k1<C>,
    keypair: &Keypair,
) -> XOnlyPublicKey {
    tweak_keypair(secp, keypair).x_only_public_key().0
}

/// Previous outputs of every input, as taproot sighashes require
fn prevouts(psbt: &Psbt) -> Result<Vec<TxOut>> {
    psbt.inputs
        .iter()
        .zip(psbt.unsigned_tx.input.iter())
        .enumerate()
        .map(|(index, (input, txin))| {
            input
                .witness_utxo
                .clone()
                .or_else(|| {
                    input
                        .non_witness_utxo
                        .as_ref()
                        .and_then(|tx| tx.output.get(txin.previous_output.vout as usize).cloned())
                })
                .ok_or_else(|| {
                    AlkanesError::Signing(format!("input {index} has no previous output"))
                })
        })
        .collect()
}

/// Sign the script-path reveal input at index 0 and finalize its witness
pub fn sign_reveal_input<C: Signing>(
    secp: &Secp256k1<C>,
    psbt: &mut Psbt,
    tweaked_keypair: &Keypair,
) -> Result<()> {
    let prevouts = prevouts(psbt)?;
    let input = psbt
        .inputs
        .first_mut()
        .ok_or_else(|| AlkanesError::Signing("reveal has no inputs".to_string()))?;
    let (control_block, (script, leaf_version)) = input
        .tap_scripts
        .iter()
        .next()
        .map(|(cb, leaf)| (cb.clone(), leaf.clone()))
        .ok_or_else(|| AlkanesError::Signing("reveal input has no tap script".to_string()))?;

    let leaf_hash = TapLeafHash::from_script(&script, leaf_version);
    let sighash = SighashCache::new(&psbt.unsigned_tx).taproot_script_spend_signature_hash(
        0,
        &Prevouts::All(&prevouts),
        leaf_hash,
        TapSighashType::Default,
    )?;
    let message = Message::from_digest_slice(sighash.as_ref())?;
    let signature = taproot::Signature {
        signature: secp.sign_schnorr_no_aux_rand(&message, tweaked_keypair),
        sighash_type: TapSighashType::Default,
    };

    let mut witness = Witness::new();
    witness.push(signature.to_vec());
    witness.push(script.as_bytes());
    witness.push(control_block.serialize());

    let x_only = tweaked_keypair.x_only_public_key().0;
    input.tap_script_sigs.insert((x_only, leaf_hash), signature);
    input.final_script_witness = Some(witness);
    debug!("Signed reveal script path for {}", x_only);
    Ok(())
}

/// Signer holding a single taproot key pair
pub struct KeypairSigner {
    keypair: Option<Keypair>,
    secp: Secp256k1<bitcoin::secp256k1::All>,
}

impl KeypairSigner {
    pub fn new(keypair: Keypair) -> Self {
        Self {
            keypair: Some(keypair),
            secp: Secp256k1::new(),
        }
    }

    /// Signer without a taproot key, for watch-only use
    pub fn watch_only() -> Self {
        Self {
            keypair: None,
            secp: Secp256k1::new(),
        }
    }
}

#[async_trait]
impl Signer for KeypairSigner {
    fn taproot_keypair(&self) -> Option<Keypair> {
        self.keypair
    }

    async fn sign_all_inputs(&self, mut psbt: Psbt, finalize: bool) -> Result<Psbt> {
        let keypair = self
            .keypair
            .ok_or_else(|| AlkanesError::SignerCapabilityMissing("taproot key pair".to_string()))?;
        let tweaked = tweak_keypair(&self.secp, &keypair);
        let prevouts = prevouts(&psbt)?;

        let mut cache = SighashCache::new(&psbt.unsigned_tx);
        for (index, input) in psbt.inputs.iter_mut().enumerate() {
            if input.final_script_witness.is_some() {
                continue;
            }
            if !prevouts[index].script_pubkey.is_p2tr() || !input.tap_scripts.is_empty() {
                return Err(AlkanesError::Signing(format!(
                    "input {index} is not a key-path taproot input"
                )));
            }
            let sighash = cache.taproot_key_spend_signature_hash(
                index,
                &Prevouts::All(&prevouts),
                TapSighashType::Default,
            )?;
            let message = Message::from_digest_slice(sighash.as_ref())?;
            let signature = taproot::Signature {
                signature: self.secp.sign_schnorr_no_aux_rand(&message, &tweaked),
                sighash_type: TapSighashType::Default,
            };
            input.tap_key_sig = Some(signature);
            if finalize {
                input.final_script_witness = Some(Witness::p2tr_key_spend(&signature));
            }
        }
        Ok(psbt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::psbt;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::{
        absolute::LockTime, transaction::Version, Address, Amount, Network, OutPoint, ScriptBuf,
        Sequence, Transaction, TxIn, Txid,
    };

    fn keypair() -> Keypair {
        let secp = Secp256k1::new();
        Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[5u8; 32]).unwrap())
    }

    fn key_path_psbt(keypair: &Keypair) -> Psbt {
        let secp = Secp256k1::new();
        let address = Address::p2tr(&secp, keypair.x_only_public_key().0, None, Network::Regtest);
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array([1; 32]), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(9_000),
                script_pubkey: address.script_pubkey(),
            }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0] = psbt::Input {
            witness_utxo: Some(TxOut {
                value: Amount::from_sat(10_000),
                script_pubkey: address.script_pubkey(),
            }),
            ..Default::default()
        };
        psbt
    }

    #[test]
    fn test_tweaked_public_key_matches_p2tr_output() {
        let secp = Secp256k1::new();
        let keypair = keypair();
        let address = Address::p2tr(&secp, keypair.x_only_public_key().0, None, Network::Regtest);
        let tweaked = tweaked_public_key(&secp, &keypair);
        assert_eq!(address.script_pubkey().as_bytes()[2..], tweaked.serialize());
    }

    #[tokio::test]
    async fn test_sign_all_inputs_key_path() {
        let keypair = keypair();
        let signer = KeypairSigner::new(keypair);
        let psbt = signer.sign_all_inputs(key_path_psbt(&keypair), true).await.unwrap();

        let signature = psbt.inputs[0].tap_key_sig.unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 1);

        let secp = Secp256k1::new();
        let prevouts = vec![psbt.inputs[0].witness_utxo.clone().unwrap()];
        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .taproot_key_spend_signature_hash(0, &Prevouts::All(&prevouts), TapSighashType::Default)
            .unwrap();
        let message = Message::from_digest_slice(sighash.as_ref()).unwrap();
        let tweaked = tweaked_public_key(&secp, &keypair);
        assert!(secp.verify_schnorr(&signature.signature, &message, &tweaked).is_ok());
    }

    #[tokio::test]
    async fn test_sign_without_finalize_leaves_witness_empty() {
        let keypair = keypair();
        let psbt = KeypairSigner::new(keypair)
            .sign_all_inputs(key_path_psbt(&keypair), false)
            .await
            .unwrap();
        assert!(psbt.inputs[0].tap_key_sig.is_some());
        assert!(psbt.inputs[0].final_script_witness.is_none());
    }

    #[tokio::test]
    async fn test_watch_only_signer_reports_missing_capability() {
        let signer = KeypairSigner::watch_only();
        assert!(signer.taproot_keypair().is_none());
        let result = signer.sign_all_inputs(key_path_psbt(&keypair()), true).await;
        assert!(matches!(result, Err(AlkanesError::SignerCapabilityMissing(_))));
    }
}
