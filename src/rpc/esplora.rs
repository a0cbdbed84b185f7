//! Esplora RPC client implementation
//!
//! This module provides the chain collaborators on top of the Esplora REST
//! API: fee estimates, previous outputs, raw transactions and broadcast.
//! It handles rate limiting and retries transient failures.

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::{Psbt, Txid};
use log::{debug, warn};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::sleep;

use super::{BroadcastResult, Broadcaster, FeeRateSource, PreviousOutputLookup};
use crate::transaction::psbt_from_base64;
use crate::{AlkanesError, Result};

/// Esplora RPC configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EsploraConfig {
    /// API URL (e.g., https://blockstream.info/api/)
    pub url: String,
    /// Connection timeout in seconds
    pub timeout: u64,
    /// Maximum number of retries
    pub max_retries: u32,
    /// Retry delay in milliseconds
    pub retry_delay: u64,
    /// Maximum concurrent requests
    pub max_concurrent_requests: usize,
}

impl Default for EsploraConfig {
    fn default() -> Self {
        Self {
            url: "https://blockstream.info/api/".to_string(),
            timeout: 30,
            max_retries: 3,
            retry_delay: 1000,
            max_concurrent_requests: 10,
        }
    }
}

/// Esplora transaction output
#[derive(Debug, Deserialize)]
pub struct EsploraTxOutput {
    /// Output value in satoshis
    pub value: u64,
}

/// Esplora transaction
#[derive(Debug, Deserialize)]
pub struct EsploraTx {
    /// Transaction outputs
    pub vout: Vec<EsploraTxOutput>,
}

/// Esplora RPC client
pub struct EsploraClient {
    /// HTTP client
    client: Client,
    /// RPC configuration
    config: EsploraConfig,
    /// Rate limiter
    rate_limiter: Arc<Semaphore>,
}

/// Outcome of a single request attempt
enum Attempt<T> {
    Done(T),
    NotFound,
    Retry(AlkanesError),
    Fail(AlkanesError),
}

impl EsploraClient {
    /// Create a new Esplora client
    pub fn new(config: EsploraConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout))
            .build()?;
        let rate_limiter = Arc::new(Semaphore::new(config.max_concurrent_requests.max(1)));
        Ok(Self {
            client,
            config,
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.url.trim_end_matches('/'), path)
    }

    /// Run a request with retry logic, `None` on 404
    async fn request(&self, path: &str, body: Option<&str>) -> Result<Option<String>> {
        let _permit = self
            .rate_limiter
            .acquire()
            .await
            .map_err(|e| AlkanesError::Rpc(e.to_string()))?;

        let mut retries = 0;
        loop {
            if retries > 0 {
                debug!(
                    "Retrying Esplora API request to {} (attempt {}/{})",
                    path, retries, self.config.max_retries
                );
                sleep(Duration::from_millis(self.config.retry_delay)).await;
            }
            match self.execute(path, body).await {
                Attempt::Done(text) => return Ok(Some(text)),
                Attempt::NotFound => return Ok(None),
                Attempt::Fail(err) => return Err(err),
                Attempt::Retry(err) => {
                    retries += 1;
                    if retries > self.config.max_retries {
                        return Err(err);
                    }
                    warn!("Esplora API request to {} failed: {}", path, err);
                }
            }
        }
    }

    /// Execute a single request without retry logic
    async fn execute(&self, path: &str, body: Option<&str>) -> Attempt<String> {
        let url = self.url(path);
        let request = match body {
            Some(body) => {
                debug!("Making Esplora API POST request to {}", path);
                self.client
                    .post(&url)
                    .header(header::CONTENT_TYPE, "text/plain")
                    .body(body.to_string())
            }
            None => {
                debug!("Making Esplora API request to {}", path);
                self.client.get(&url)
            }
        };

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) if err.is_timeout() || err.is_connect() => return Attempt::Retry(err.into()),
            Err(err) => return Attempt::Fail(err.into()),
        };

        let status = response.status();
        let text = match response.text().await {
            Ok(text) => text,
            Err(err) => return Attempt::Retry(err.into()),
        };
        if status == StatusCode::NOT_FOUND {
            return Attempt::NotFound;
        }
        if !status.is_success() {
            let err = AlkanesError::Rpc(format!(
                "Esplora API request failed with status {status}: {text}"
            ));
            return if is_retryable_status(status) {
                Attempt::Retry(err)
            } else {
                Attempt::Fail(err)
            };
        }
        Attempt::Done(text)
    }

    async fn get_required(&self, path: &str) -> Result<String> {
        self.request(path, None)
            .await?
            .ok_or_else(|| AlkanesError::Rpc(format!("Esplora resource not found: {path}")))
    }

    /// Get transaction details, `None` if unknown
    pub async fn get_transaction(&self, txid: &Txid) -> Result<Option<EsploraTx>> {
        match self.request(&format!("/tx/{txid}"), None).await? {
            Some(text) => Ok(Some(serde_json::from_str(&text)?)),
            None => Ok(None),
        }
    }

    /// Get fee estimates keyed by confirmation target
    pub async fn get_fee_estimates(&self) -> Result<HashMap<String, f64>> {
        let text = self.get_required("/fee-estimates").await?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Broadcast a raw transaction
    pub async fn broadcast_transaction(&self, tx_hex: &str) -> Result<String> {
        let txid = self
            .request("/tx", Some(tx_hex))
            .await?
            .ok_or_else(|| AlkanesError::Rpc("broadcast endpoint not found".to_string()))?;
        Ok(txid.trim().to_string())
    }
}

/// Rate for the target, falling back to the next slower target available
pub fn fee_rate_for_target(estimates: &HashMap<String, f64>, blocks: u16) -> Option<f64> {
    let mut targets: Vec<(u16, f64)> = estimates
        .iter()
        .filter_map(|(target, rate)| target.parse::<u16>().ok().map(|t| (t, *rate)))
        .collect();
    targets.sort_by_key(|(target, _)| *target);
    targets
        .iter()
        .find(|(target, _)| *target >= blocks)
        .or_else(|| targets.last())
        .map(|(_, rate)| *rate)
}

fn is_retryable_status(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl FeeRateSource for EsploraClient {
    async fn get_fee_estimate_for_confirmation_target(&self, blocks: u16) -> Result<f64> {
        let estimates = self.get_fee_estimates().await?;
        fee_rate_for_target(&estimates, blocks)
            .ok_or_else(|| AlkanesError::Rpc("no fee estimates available".to_string()))
    }
}

#[async_trait]
impl PreviousOutputLookup for EsploraClient {
    async fn get_output_value(&self, txid: &Txid, vout: u32) -> Result<Option<u64>> {
        let tx = self.get_transaction(txid).await?;
        Ok(tx.and_then(|tx| tx.vout.get(vout as usize).map(|out| out.value)))
    }

    async fn get_raw_transaction_hex(&self, txid: &Txid) -> Result<String> {
        self.get_required(&format!("/tx/{txid}/hex")).await
    }
}

#[async_trait]
impl Broadcaster for EsploraClient {
    async fn push_psbt(&self, psbt_base64: &str) -> Result<BroadcastResult> {
        let psbt: Psbt = psbt_from_base64(psbt_base64)?;
        let tx = psbt.extract_tx()?;
        let raw_tx = serialize_hex(&tx);
        let txid = self.broadcast_transaction(&raw_tx).await?;
        debug!("Transaction broadcast with ID: {}", txid);
        Ok(BroadcastResult {
            txid,
            raw_tx,
            vsize: tx.vsize() as u64,
        })
    }
}
