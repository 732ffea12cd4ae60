//! Chain client
//!
//! JSON-RPC access to the network: balance lookups, priority-fee sampling,
//! simulation, submission and confirmation polling. Every verified
//! transaction lands in the bounded history; failures additionally invoke
//! the registered alert callback.

pub mod history;

use async_trait::async_trait;
use base64::Engine as _;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::RpcConfig;
use crate::error::{Error, Result};
use history::{TxHistoryEntry, TxHistoryLog, TxStatus};

/// Fee sampling window and shaping, per the trading-bot guide
const FEE_SAMPLE_WINDOW: usize = 20;
const FEE_BUFFER_FACTOR: f64 = 1.2;
const MIN_PRIORITY_FEE: u64 = 1_000;
const MAX_PRIORITY_FEE: u64 = 1_000_000;

/// Confirmation poll cadence (~2 Hz)
const CONFIRM_POLL_MS: u64 = 500;

/// Commitment levels, ordered by confirmation strength
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Commitment {
    Processed,
    Confirmed,
    Finalized,
}

impl Commitment {
    fn rank_of(status: &str) -> u8 {
        match status {
            "processed" => 1,
            "confirmed" => 2,
            "finalized" => 3,
            _ => 0,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Commitment::Processed => 1,
            Commitment::Confirmed => 2,
            Commitment::Finalized => 3,
        }
    }
}

/// Successful confirmation with the chain position attached
#[derive(Debug, Clone)]
pub struct Confirmation {
    pub status: String,
    pub slot: Option<u64>,
    pub block_time: Option<i64>,
}

/// One token balance row from the wallet
#[derive(Debug, Clone)]
pub struct TokenBalance {
    pub amount: u64,
    pub decimals: u8,
}

impl TokenBalance {
    pub fn ui_amount(&self) -> f64 {
        self.amount as f64 / 10f64.powi(self.decimals as i32)
    }
}

type AlertCallback = Arc<dyn Fn(TxHistoryEntry) + Send + Sync>;

/// Chain operations the executor and engine depend on
#[async_trait]
pub trait ChainApi: Send + Sync {
    async fn sample_priority_fee(&self) -> u64;
    async fn simulate(&self, tx: &[u8]) -> Result<()>;
    async fn send(&self, tx: &[u8]) -> Result<String>;
    async fn confirm(
        &self,
        signature: &str,
        commitment: Commitment,
        timeout: Duration,
    ) -> Result<Confirmation>;
    async fn balance(&self, address: &str) -> Result<u64>;
    async fn token_balances(&self, address: &str) -> Result<HashMap<String, TokenBalance>>;

    /// Append a verified transaction to the history. Implementations with no
    /// history keep this a no-op.
    fn record_transaction(&self, _entry: TxHistoryEntry) {}
}

/// Send a transaction repeatedly, re-building it with a fresh blockhash on
/// retryable failures. Each attempt is sent then confirmed; a send that
/// never confirms counts as a failed attempt.
pub async fn send_with_retry<F, Fut>(
    chain: &dyn ChainApi,
    confirm_timeout: Duration,
    max_attempts: u32,
    rebuild: F,
) -> Result<(String, Confirmation)>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>>>,
{
    let mut last_error = Error::TransactionSend("no attempts made".into());

    for attempt in 1..=max_attempts.max(1) {
        if attempt > 1 {
            // Small jittered pause before re-building with a fresh blockhash
            let jitter = rand::thread_rng().gen_range(0..500);
            tokio::time::sleep(Duration::from_millis(1_000 + jitter)).await;
        }

        let tx = rebuild().await?;
        match chain.send(&tx).await {
            Ok(signature) => {
                match chain
                    .confirm(&signature, Commitment::Confirmed, confirm_timeout)
                    .await
                {
                    Ok(confirmation) => return Ok((signature, confirmation)),
                    Err(e @ Error::TransactionFailed(_)) => return Err(e),
                    Err(e) => {
                        warn!("Tx not confirmed (attempt {}): {}", attempt, e);
                        last_error = e;
                    }
                }
            }
            Err(e) => {
                if !is_retryable_send_error(&e) {
                    return Err(e);
                }
                warn!("Retryable tx error (attempt {}): {}", attempt, e);
                last_error = e;
            }
        }
    }

    Err(last_error)
}

/// JSON-RPC chain client
pub struct ChainClient {
    config: RpcConfig,
    http: reqwest::Client,
    history: TxHistoryLog,
    alert: std::sync::RwLock<Option<AlertCallback>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
}

impl ChainClient {
    pub fn new(config: RpcConfig, history: TxHistoryLog) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("rpc http client: {}", e)))?;
        Ok(Self {
            config,
            http,
            history,
            alert: std::sync::RwLock::new(None),
        })
    }

    /// Register the callback invoked for every failed verified transaction
    pub fn set_alert_callback(&self, callback: AlertCallback) {
        *self.alert.write().unwrap() = Some(callback);
    }

    pub fn history(&self) -> &TxHistoryLog {
        &self.history
    }

    async fn rpc_call(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        let resp = self
            .http
            .post(&self.config.endpoint)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": method,
                "params": params,
            }))
            .send()
            .await?;

        let body: RpcResponse = resp.json().await?;
        if let Some(err) = body.error {
            return Err(Error::Rpc(err.message));
        }
        Ok(body.result)
    }
}

/// RPC send errors that justify a fresh-blockhash retry
fn is_retryable_send_error(error: &Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["blockhash", "expired", "timeout"]
        .iter()
        .any(|needle| text.contains(needle))
        || matches!(error, Error::RpcConnection(_) | Error::RpcTimeout(_))
}

/// Shape a raw per-slot fee sample into a bid: drop zeros, take the 75th
/// percentile, buffer by 20%, clamp into the sane band.
fn competitive_fee(samples: &[u64], default_fee: u64) -> u64 {
    let mut fees: Vec<u64> = samples
        .iter()
        .rev()
        .take(FEE_SAMPLE_WINDOW)
        .copied()
        .filter(|f| *f > 0)
        .collect();

    if fees.is_empty() {
        return default_fee;
    }

    fees.sort_unstable();
    let idx = (fees.len() as f64 * 0.75) as usize;
    let p75 = fees[idx.min(fees.len() - 1)];
    let buffered = (p75 as f64 * FEE_BUFFER_FACTOR) as u64;
    buffered.clamp(MIN_PRIORITY_FEE, MAX_PRIORITY_FEE)
}

#[async_trait]
impl ChainApi for ChainClient {
    async fn sample_priority_fee(&self) -> u64 {
        let result = match self.rpc_call("getRecentPrioritizationFees", json!([])).await {
            Ok(r) => r,
            Err(e) => {
                warn!("Failed to sample priority fees: {}, using default", e);
                return self.config.default_priority_fee;
            }
        };

        let samples: Vec<u64> = result
            .as_array()
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("prioritizationFee").and_then(|f| f.as_u64()))
                    .collect()
            })
            .unwrap_or_default();

        let fee = competitive_fee(&samples, self.config.default_priority_fee);
        debug!("Priority fee bid: {} micro-lamports", fee);
        fee
    }

    async fn simulate(&self, tx: &[u8]) -> Result<()> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(tx);
        let result = self
            .rpc_call(
                "simulateTransaction",
                json!([encoded, {"encoding": "base64", "commitment": "confirmed"}]),
            )
            .await?;

        if let Some(err) = result.get("value").and_then(|v| v.get("err")) {
            if !err.is_null() {
                return Err(Error::TransactionSimulation(err.to_string()));
            }
        }
        Ok(())
    }

    async fn send(&self, tx: &[u8]) -> Result<String> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(tx);
        let result = self
            .rpc_call(
                "sendTransaction",
                json!([encoded, {
                    "encoding": "base64",
                    "preflightCommitment": "confirmed",
                    "maxRetries": 0,
                }]),
            )
            .await
            .map_err(|e| match e {
                Error::Rpc(msg) => Error::TransactionSend(msg),
                other => other,
            })?;

        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::TransactionSend("empty signature in response".into()))
    }

    async fn confirm(
        &self,
        signature: &str,
        commitment: Commitment,
        timeout: Duration,
    ) -> Result<Confirmation> {
        let deadline = Instant::now() + timeout;

        loop {
            if Instant::now() >= deadline {
                return Err(Error::ConfirmationTimeout(timeout.as_secs()));
            }

            match self
                .rpc_call(
                    "getSignatureStatuses",
                    json!([[signature], {"searchTransactionHistory": true}]),
                )
                .await
            {
                Ok(result) => {
                    let status = result
                        .get("value")
                        .and_then(|v| v.as_array())
                        .and_then(|v| v.first())
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);

                    if !status.is_null() {
                        if let Some(err) = status.get("err") {
                            if !err.is_null() {
                                return Err(Error::TransactionFailed(err.to_string()));
                            }
                        }

                        let conf_status = status
                            .get("confirmationStatus")
                            .and_then(|s| s.as_str())
                            .unwrap_or("");
                        if Commitment::rank_of(conf_status) >= commitment.rank() {
                            info!("Transaction confirmed: {}... ({})", &signature[..signature.len().min(12)], conf_status);
                            return Ok(Confirmation {
                                status: conf_status.to_string(),
                                slot: status.get("slot").and_then(|s| s.as_u64()),
                                block_time: status.get("blockTime").and_then(|t| t.as_i64()),
                            });
                        }
                    }
                }
                Err(e) => warn!("Error checking tx status: {}", e),
            }

            tokio::time::sleep(Duration::from_millis(CONFIRM_POLL_MS)).await;
        }
    }

    async fn balance(&self, address: &str) -> Result<u64> {
        let result = self.rpc_call("getBalance", json!([address])).await?;
        result
            .get("value")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| Error::Rpc("malformed getBalance response".into()))
    }

    async fn token_balances(&self, address: &str) -> Result<HashMap<String, TokenBalance>> {
        let result = self
            .rpc_call(
                "getTokenAccountsByOwner",
                json!([
                    address,
                    {"programId": "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA"},
                    {"encoding": "jsonParsed"}
                ]),
            )
            .await?;

        let mut balances = HashMap::new();
        let accounts = result
            .get("value")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        for account in accounts {
            let info = &account["account"]["data"]["parsed"]["info"];
            let mint = match info.get("mint").and_then(|m| m.as_str()) {
                Some(m) => m.to_string(),
                None => continue,
            };
            let token_amount = &info["tokenAmount"];
            let amount = token_amount
                .get("amount")
                .and_then(|a| a.as_str())
                .and_then(|a| a.parse::<u64>().ok())
                .unwrap_or(0);
            let decimals = token_amount
                .get("decimals")
                .and_then(|d| d.as_u64())
                .unwrap_or(0) as u8;

            // Aggregate across token accounts for the same mint
            let entry = balances.entry(mint).or_insert(TokenBalance {
                amount: 0,
                decimals,
            });
            entry.amount += amount;
        }

        Ok(balances)
    }

    /// Record a verified transaction and alert on failure
    fn record_transaction(&self, entry: TxHistoryEntry) {
        let failed = entry.is_failure();
        self.history.append(entry.clone());
        if failed {
            if let Some(cb) = self.alert.read().unwrap().clone() {
                tokio::spawn(async move { cb(entry) });
            }
        }
    }
}
