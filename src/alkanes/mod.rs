//! Alkanes protocol support
//!
//! This module provides functionality for:
//! - Inscribing contract payloads with a taproot commit/reveal pair
//! - Encoding protostone messages
//! - Calling contracts with a direct execute transaction
//! - Two-pass fee convergence, signing and broadcast
//!
//! Every builder can run without a forced fee, using a conservative
//! estimate. `AlkanesManager` builds once, measures the provisional
//! transaction, rebuilds with the measured fee and measures again; the
//! final transaction is built with that converged fee.

pub mod deploy;
pub mod envelope;
pub mod execute;
pub mod protostone;

use bitcoin::key::{Keypair, XOnlyPublicKey};
use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{ScriptBuf, Txid};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

use crate::account::Account;
use crate::rpc::{BroadcastResult, Provider};
use crate::signer::{sign_reveal_input, tweak_keypair, Signer};
use crate::transaction::{psbt_to_base64, TxOptions};
use crate::utils::{FeeEstimate, UnspentOutput};
use crate::{AlkanesError, Result};

pub use deploy::{
    create_deploy_commit_psbt, create_deploy_reveal_psbt, CommitPsbt, DeployCommitParams,
    DeployRevealParams, RevealPsbt,
};
pub use envelope::{AlkanesPayload, TaprootScriptInfo};
pub use execute::{create_execute_psbt, ExecuteParams, ExecutePsbt};
pub use protostone::{encode_protostone, ProtostoneEdict, ProtostoneMessage};

/// Result of broadcasting a commit transaction
#[derive(Debug, Clone)]
pub struct DeployCommitResult {
    pub broadcast: BroadcastResult,
    /// Script leaf the reveal must spend
    pub reveal_script: ScriptBuf,
    /// Internal key of the commit output
    pub tweaked_public_key: XOnlyPublicKey,
    pub fee: FeeEstimate,
}

/// Result of broadcasting a reveal transaction
#[derive(Debug, Clone)]
pub struct DeployRevealResult {
    pub broadcast: BroadcastResult,
    /// Fee paid, including change folded in below dust
    pub fee: FeeEstimate,
}

/// Result of a full commit and reveal deployment
#[derive(Debug, Clone)]
pub struct DeployResult {
    pub commit: DeployCommitResult,
    pub reveal: DeployRevealResult,
}

/// Result of broadcasting an execute transaction
#[derive(Debug, Clone)]
pub struct ExecuteResult {
    pub broadcast: BroadcastResult,
    /// Fee paid, including change folded in below dust
    pub fee: FeeEstimate,
}

/// Alkanes manager driving the builders against the chain collaborators
pub struct AlkanesManager {
    provider: Provider,
    signer: Arc<dyn Signer>,
    account: Account,
    /// Wait between broadcasting the commit and building the reveal
    propagation_delay: Duration,
    secp: Secp256k1<All>,
}

impl AlkanesManager {
    /// Create a new alkanes manager
    pub fn new(provider: Provider, signer: Arc<dyn Signer>, account: Account) -> Self {
        Self {
            provider,
            signer,
            account,
            propagation_delay: Duration::from_secs(5),
            secp: Secp256k1::new(),
        }
    }

    pub fn with_propagation_delay(mut self, delay: Duration) -> Self {
        self.propagation_delay = delay;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Fill in the fee rate from the fee rate source when unset
    async fn resolve_options(&self, options: &TxOptions) -> Result<TxOptions> {
        if options.fee_rate.is_some() {
            return Ok(options.clone());
        }
        let target = self.provider.constants().confirmation_target;
        let fee_rate = self
            .provider
            .fee_rates
            .get_fee_estimate_for_confirmation_target(target)
            .await?;
        debug!("Using fee rate {} sat/vB for a {} block target", fee_rate, target);
        Ok(options.with_fee_rate(fee_rate))
    }

    /// Signer's taproot key pair, tweaked for use as the commit internal key
    fn tweaked_keypair(&self) -> Result<Keypair> {
        let keypair = self.signer.taproot_keypair().ok_or_else(|| {
            AlkanesError::SignerCapabilityMissing(
                "signer does not have a taproot key pair".to_string(),
            )
        })?;
        Ok(tweak_keypair(&self.secp, &keypair))
    }

    async fn measure(&self, psbt: &bitcoin::Psbt, options: &TxOptions) -> Result<FeeEstimate> {
        let fee_rate = self.provider.fee_model.fee_rate(options.fee_rate)?;
        self.provider.size_estimator.estimate(psbt, fee_rate).await
    }

    async fn broadcast(&self, psbt: &bitcoin::Psbt) -> Result<BroadcastResult> {
        let result = self.provider.broadcaster.push_psbt(&psbt_to_base64(psbt)).await?;
        info!("Broadcast transaction {} ({} vB)", result.txid, result.vsize);
        Ok(result)
    }

    /// Converged fee and size of the commit transaction
    pub async fn actual_deploy_commit_fee(
        &self,
        params: &DeployCommitParams,
    ) -> Result<FeeEstimate> {
        let options = self.resolve_options(&params.options).await?;
        let params = DeployCommitParams {
            options: TxOptions {
                fee: None,
                ..options.clone()
            },
            ..params.clone()
        };

        let provisional = create_deploy_commit_psbt(&params, &self.account, &self.provider).await?;
        let estimate = self.measure(&provisional.psbt, &options).await?;

        let params = DeployCommitParams {
            options: options.with_fee(estimate.fee),
            ..params
        };
        let rebuilt = create_deploy_commit_psbt(&params, &self.account, &self.provider).await?;
        self.measure(&rebuilt.psbt, &options).await
    }

    /// Build, sign and broadcast the commit transaction
    pub async fn deploy_commit(
        &self,
        payload: AlkanesPayload,
        utxos: Vec<UnspentOutput>,
        options: TxOptions,
    ) -> Result<DeployCommitResult> {
        let tweaked_public_key = self.tweaked_keypair()?.x_only_public_key().0;
        let options = self.resolve_options(&options).await?;
        let params = DeployCommitParams {
            payload,
            utxos,
            tweaked_public_key,
            options,
        };

        let fee = self.actual_deploy_commit_fee(&params).await?;
        let params = DeployCommitParams {
            options: params.options.with_fee(fee.fee),
            ..params
        };
        let commit = create_deploy_commit_psbt(&params, &self.account, &self.provider).await?;

        let signed = self.signer.sign_all_inputs(commit.psbt, true).await?;
        let broadcast = self.broadcast(&signed).await?;
        Ok(DeployCommitResult {
            broadcast,
            reveal_script: commit.reveal_script,
            tweaked_public_key,
            fee,
        })
    }

    /// Converged fee and size of the reveal transaction
    pub async fn actual_deploy_reveal_fee(
        &self,
        params: &DeployRevealParams,
    ) -> Result<FeeEstimate> {
        let options = self.resolve_options(&params.options).await?;
        let params = DeployRevealParams {
            options: TxOptions {
                fee: None,
                ..options.clone()
            },
            ..params.clone()
        };

        let provisional = create_deploy_reveal_psbt(&params, &self.provider).await?;
        let estimate = self.measure(&provisional.psbt, &options).await?;

        let params = DeployRevealParams {
            options: options.with_fee(estimate.fee),
            ..params
        };
        let rebuilt = create_deploy_reveal_psbt(&params, &self.provider).await?;
        self.measure(&rebuilt.psbt, &options).await
    }

    /// Build, sign and broadcast the reveal transaction
    pub async fn deploy_reveal(
        &self,
        commit_txid: Txid,
        reveal_script: ScriptBuf,
        protostone: &ProtostoneMessage,
        options: TxOptions,
    ) -> Result<DeployRevealResult> {
        let tweaked_keypair = self.tweaked_keypair()?;
        let options = self.resolve_options(&options).await?;
        let params = DeployRevealParams {
            commit_txid,
            reveal_script,
            tweaked_public_key: tweaked_keypair.x_only_public_key().0,
            protostone: encode_protostone(protostone)?,
            receiver_address: self.account.taproot.address.clone(),
            options,
        };

        let fee = self.actual_deploy_reveal_fee(&params).await?;
        let params = DeployRevealParams {
            options: params.options.with_fee(fee.fee),
            ..params
        };
        let mut reveal = create_deploy_reveal_psbt(&params, &self.provider).await?;

        sign_reveal_input(&self.secp, &mut reveal.psbt, &tweaked_keypair)?;
        let broadcast = self.broadcast(&reveal.psbt).await?;
        Ok(DeployRevealResult {
            broadcast,
            fee: FeeEstimate {
                fee: reveal.fee,
                vsize: fee.vsize,
            },
        })
    }

    /// Deploy a payload: commit, wait for propagation, then reveal
    pub async fn deploy(
        &self,
        payload: AlkanesPayload,
        protostone: &ProtostoneMessage,
        utxos: Vec<UnspentOutput>,
        options: TxOptions,
    ) -> Result<DeployResult> {
        let commit = self.deploy_commit(payload, utxos, options.clone()).await?;
        let commit_txid: Txid = commit
            .broadcast
            .txid
            .parse()
            .map_err(|e| {
                AlkanesError::Transaction(format!(
                    "invalid commit txid {}: {e}",
                    commit.broadcast.txid
                ))
            })?;

        debug!("Waiting {:?} for commit {} to propagate", self.propagation_delay, commit_txid);
        tokio::time::sleep(self.propagation_delay).await;

        let reveal_options = TxOptions {
            fee: None,
            ..options
        };
        let reveal = self
            .deploy_reveal(commit_txid, commit.reveal_script.clone(), protostone, reveal_options)
            .await?;
        Ok(DeployResult { commit, reveal })
    }

    /// Converged fee and size of the execute transaction
    pub async fn actual_execute_fee(&self, params: &ExecuteParams) -> Result<FeeEstimate> {
        let options = self.resolve_options(&params.options).await?;
        let params = ExecuteParams {
            options: TxOptions {
                fee: None,
                ..options.clone()
            },
            ..params.clone()
        };

        let provisional = create_execute_psbt(&params, &self.account, &self.provider).await?;
        let estimate = self.measure(&provisional.psbt, &options).await?;

        let params = ExecuteParams {
            options: options.with_fee(estimate.fee),
            ..params
        };
        let rebuilt = create_execute_psbt(&params, &self.account, &self.provider).await?;
        self.measure(&rebuilt.psbt, &options).await
    }

    async fn converged_execute(
        &self,
        params: &ExecuteParams,
    ) -> Result<(ExecutePsbt, FeeEstimate)> {
        let options = self.resolve_options(&params.options).await?;
        let params = ExecuteParams {
            options,
            ..params.clone()
        };
        let fee = self.actual_execute_fee(&params).await?;
        let params = ExecuteParams {
            options: params.options.with_fee(fee.fee),
            ..params
        };
        let execute = create_execute_psbt(&params, &self.account, &self.provider).await?;
        Ok((execute, fee))
    }

    /// Build the unsigned execute transaction with the converged fee
    pub async fn execute_psbt(&self, params: &ExecuteParams) -> Result<ExecutePsbt> {
        Ok(self.converged_execute(params).await?.0)
    }

    /// Build, sign and broadcast an execute transaction
    pub async fn execute(
        &self,
        alkanes_utxos: Vec<UnspentOutput>,
        utxos: Vec<UnspentOutput>,
        protostone: &ProtostoneMessage,
        options: TxOptions,
    ) -> Result<ExecuteResult> {
        let params = ExecuteParams {
            alkanes_utxos,
            utxos,
            protostone: encode_protostone(protostone)?,
            options,
        };
        let (execute, estimate) = self.converged_execute(&params).await?;
        let fee = FeeEstimate {
            fee: execute.fee,
            vsize: estimate.vsize,
        };

        let signed = self.signer.sign_all_inputs(execute.psbt, true).await?;
        let broadcast = self.broadcast(&signed).await?;
        Ok(ExecuteResult { broadcast, fee })
    }
}
