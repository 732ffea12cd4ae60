//! Jupiter aggregator adapter
//!
//! Validates the provider's JSON once at ingress; transport errors and HTTP
//! {429, 5xx} retry under exponential backoff, any other 4xx or malformed
//! payload maps to `QuoteRejected` and fails fast.

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use base64::Engine as _;
use serde::Deserialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::AggregatorConfig;
use crate::error::{Error, Result};

use super::{Aggregator, Quote, SwapMode};

/// Validated quote payload from the wire
#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(rename = "inAmount")]
    in_amount: String,
    #[serde(rename = "outAmount")]
    out_amount: String,
    #[serde(rename = "priceImpactPct", default)]
    price_impact_pct: Option<String>,
    #[serde(rename = "routePlan", default)]
    route_plan: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SwapResponse {
    #[serde(rename = "swapTransaction")]
    swap_transaction: Option<String>,
}

/// HTTP client for the Jupiter swap API
pub struct JupiterAggregator {
    config: AggregatorConfig,
    http: reqwest::Client,
}

impl JupiterAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.quote_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("aggregator http client: {}", e)))?;
        Ok(Self { config, http })
    }

    fn retry_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_millis(self.config.retry_base_delay_ms),
            max_interval: Duration::from_secs(self.config.retry_max_delay_secs),
            max_elapsed_time: Some(Duration::from_secs(
                self.config.quote_timeout_secs * self.config.retry_attempts as u64,
            )),
            ..ExponentialBackoff::default()
        }
    }

    /// Run an HTTP operation under the retry policy with an attempt cap.
    /// Transport errors and retryable statuses become transient; everything
    /// else is permanent.
    async fn with_retries<T, F, Fut>(&self, what: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, backoff::Error<Error>>>,
    {
        let attempts = AtomicU32::new(0);
        let max_attempts = self.config.retry_attempts.max(1);

        backoff::future::retry(self.retry_policy(), || async {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            match op().await {
                Ok(value) => Ok(value),
                Err(backoff::Error::Transient { err, .. }) if attempt >= max_attempts => {
                    warn!("{} failed after {} attempts: {}", what, attempt, err);
                    Err(backoff::Error::permanent(err))
                }
                Err(e) => {
                    if let backoff::Error::Transient { err, .. } = &e {
                        debug!("{} attempt {} failed, retrying: {}", what, attempt, err);
                    }
                    Err(e)
                }
            }
        })
        .await
    }
}

/// Map an HTTP response status to the retry classification
fn classify_status(status: reqwest::StatusCode, body: String) -> backoff::Error<Error> {
    if status.as_u16() == 429 || status.is_server_error() {
        backoff::Error::transient(Error::Rpc(format!("HTTP {}: {}", status, body)))
    } else {
        backoff::Error::permanent(Error::QuoteRejected(format!("HTTP {}: {}", status, body)))
    }
}

#[async_trait]
impl Aggregator for JupiterAggregator {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote> {
        let url = format!("{}/quote", self.config.quote_api_url);
        let amount_str = amount.to_string();
        let slippage_str = slippage_bps.to_string();

        let raw: serde_json::Value = self
            .with_retries("quote", || async {
                let resp = self
                    .http
                    .get(&url)
                    .query(&[
                        ("inputMint", input_mint),
                        ("outputMint", output_mint),
                        ("amount", amount_str.as_str()),
                        ("slippageBps", slippage_str.as_str()),
                        ("swapMode", SwapMode::ExactIn.as_str()),
                    ])
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(Error::from(e)))?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify_status(status, body));
                }

                resp.json::<serde_json::Value>()
                    .await
                    .map_err(|e| backoff::Error::permanent(Error::QuoteRejected(e.to_string())))
            })
            .await?;

        if let Some(err) = raw.get("error") {
            return Err(Error::QuoteRejected(err.to_string()));
        }

        let parsed: QuoteResponse = serde_json::from_value(raw.clone())
            .map_err(|e| Error::QuoteRejected(format!("malformed quote payload: {}", e)))?;

        let input_amount = parsed
            .in_amount
            .parse::<u64>()
            .map_err(|e| Error::QuoteRejected(format!("bad inAmount: {}", e)))?;
        let output_amount = parsed
            .out_amount
            .parse::<u64>()
            .map_err(|e| Error::QuoteRejected(format!("bad outAmount: {}", e)))?;

        Ok(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            input_amount,
            output_amount,
            price_impact_pct: parsed
                .price_impact_pct
                .as_deref()
                .and_then(|p| p.parse().ok())
                .unwrap_or(0.0),
            slippage_bps,
            route_plan: parsed.route_plan,
            quote_blob: raw,
        })
    }

    async fn build_swap_tx(
        &self,
        quote: &Quote,
        payer: &str,
        priority_fee_micro_lamports: Option<u64>,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/swap", self.config.quote_api_url);

        let mut payload = serde_json::json!({
            "quoteResponse": quote.quote_blob,
            "userPublicKey": payer,
            "wrapAndUnwrapSol": true,
            "dynamicComputeUnitLimit": true,
        });
        if let Some(fee) = priority_fee_micro_lamports {
            payload["computeUnitPriceMicroLamports"] = serde_json::json!(fee);
        }

        let body: SwapResponse = self
            .with_retries("swap-tx build", || async {
                let resp = self
                    .http
                    .post(&url)
                    .timeout(Duration::from_secs(self.config.swap_build_timeout_secs))
                    .json(&payload)
                    .send()
                    .await
                    .map_err(|e| backoff::Error::transient(Error::from(e)))?;

                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    return Err(classify_status(status, body));
                }

                resp.json::<SwapResponse>()
                    .await
                    .map_err(|e| backoff::Error::permanent(Error::SwapBuild(e.to_string())))
            })
            .await?;

        let encoded = body
            .swap_transaction
            .ok_or_else(|| Error::SwapBuild("response missing swapTransaction".into()))?;

        base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| Error::SwapBuild(format!("invalid base64 transaction: {}", e)))
    }
}
