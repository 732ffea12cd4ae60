//! Spot price oracle
//!
//! Maps mint -> USD price through a priority list of sources with a short
//! TTL cache. A zero or unreachable price is a refusal to trade, never
//! "price = 0": callers get `PriceUnavailable` and must stop.
//!
//! Source order: curated stablecoins short-circuit to 1.0 without touching
//! the network, then the aggregator price API, then the most liquid DEX
//! pair, then a neutral provider for the native token.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::OracleConfig;
use crate::constants::{is_stable_mint, SOL_MINT};
use crate::error::{Error, Result};

/// The price lookup seam the engine and monitor depend on
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// USD price for a mint. Positive or an error, never zero.
    async fn usd_price(&self, mint: &str) -> Result<(f64, PriceSource)>;

    /// Deepest-pair USD liquidity, when the source can report it
    async fn liquidity_usd(&self, _mint: &str) -> Option<f64> {
        None
    }
}

/// Where a returned price came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceSource {
    Aggregator,
    DexPair,
    Stable,
    Native,
    Cache,
}

// --- Aggregator price API wire types -----------------------------------------

#[derive(Debug, Deserialize)]
struct PriceApiResponse {
    #[serde(default)]
    data: std::collections::HashMap<String, Option<PriceApiEntry>>,
}

#[derive(Debug, Deserialize)]
struct PriceApiEntry {
    #[serde(default)]
    price: Option<String>,
}

// --- DexScreener wire types (validated once at ingress) ----------------------

#[derive(Debug, Deserialize)]
struct TokenPairsResponse {
    #[serde(default)]
    pairs: Option<Vec<DexPair>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DexPair {
    #[serde(rename = "chainId")]
    pub chain_id: String,
    #[serde(rename = "priceUsd")]
    pub price_usd: Option<String>,
    pub liquidity: Option<Liquidity>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Liquidity {
    pub usd: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct NativePriceResponse {
    #[serde(default)]
    solana: Option<NativePriceEntry>,
}

#[derive(Debug, Deserialize)]
struct NativePriceEntry {
    #[serde(default)]
    usd: Option<f64>,
}

/// Multi-source USD price oracle with TTL caching
pub struct PriceOracle {
    config: OracleConfig,
    http: reqwest::Client,
    cache: DashMap<String, (f64, Instant)>,
}

impl PriceOracle {
    pub fn new(config: OracleConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("oracle http client: {}", e)))?;
        Ok(Self {
            config,
            http,
            cache: DashMap::new(),
        })
    }

    /// Fetch the USD price for a mint. Positive or error, never zero.
    pub async fn price(&self, mint: &str) -> Result<(f64, PriceSource)> {
        // Known non-tradeable stablecoins bypass the network entirely
        if is_stable_mint(mint) {
            return Ok((1.0, PriceSource::Stable));
        }

        if let Some(entry) = self.cache.get(mint) {
            let (price, at) = *entry;
            if at.elapsed() < Duration::from_secs(self.config.price_ttl_secs) {
                return Ok((price, PriceSource::Cache));
            }
        }

        if let Some(price) = self.fetch_aggregator_price(mint).await {
            self.cache.insert(mint.to_string(), (price, Instant::now()));
            return Ok((price, PriceSource::Aggregator));
        }

        if let Some(price) = self.fetch_dex_pair_price(mint).await {
            self.cache.insert(mint.to_string(), (price, Instant::now()));
            return Ok((price, PriceSource::DexPair));
        }

        if mint == SOL_MINT {
            if let Some(price) = self.fetch_native_price().await {
                self.cache.insert(mint.to_string(), (price, Instant::now()));
                return Ok((price, PriceSource::Native));
            }
        }

        Err(Error::PriceUnavailable {
            mint: mint.to_string(),
            reason: "all sources returned zero or were unreachable".into(),
        })
    }

    /// Convenience: price of the native token
    pub async fn sol_price(&self) -> Result<f64> {
        self.price(SOL_MINT).await.map(|(p, _)| p)
    }

    async fn fetch_aggregator_price(&self, mint: &str) -> Option<f64> {
        let url = format!("{}?ids={}", self.config.price_api_url, mint);
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!("Aggregator price API returned {} for {}", r.status(), mint);
                return None;
            }
            Err(e) => {
                warn!("Aggregator price API failed for {}: {}", short(mint), e);
                return None;
            }
        };

        let body: PriceApiResponse = resp.json().await.ok()?;
        let price = body
            .data
            .get(mint)
            .and_then(|e| e.as_ref())
            .and_then(|e| e.price.as_deref())
            .and_then(|p| p.parse::<f64>().ok())?;
        (price > 0.0).then_some(price)
    }

    async fn fetch_dex_pair_price(&self, mint: &str) -> Option<f64> {
        let url = format!("{}/dex/tokens/{}", self.config.dexscreener_url, mint);
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return None,
        };

        let body: TokenPairsResponse = resp.json().await.ok()?;
        let pairs: Vec<DexPair> = body
            .pairs
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.chain_id == "solana")
            .collect();

        let best = pick_best_pair(&pairs)?;
        let price = pair_price_usd(best);
        (price > 0.0).then_some(price)
    }

    async fn fetch_native_price(&self) -> Option<f64> {
        let url = format!("{}?ids=solana&vs_currencies=usd", self.config.native_price_url);
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            _ => return None,
        };
        let body: NativePriceResponse = resp.json().await.ok()?;
        let price = body.solana?.usd?;
        (price > 0.0).then_some(price)
    }
}

#[async_trait]
impl PriceFeed for PriceOracle {
    async fn usd_price(&self, mint: &str) -> Result<(f64, PriceSource)> {
        self.price(mint).await
    }

    async fn liquidity_usd(&self, mint: &str) -> Option<f64> {
        let url = format!("{}/dex/tokens/{}", self.config.dexscreener_url, mint);
        let resp = self.http.get(&url).send().await.ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: TokenPairsResponse = resp.json().await.ok()?;
        let pairs: Vec<DexPair> = body
            .pairs
            .unwrap_or_default()
            .into_iter()
            .filter(|p| p.chain_id == "solana")
            .collect();
        pick_best_pair(&pairs).map(pair_liquidity)
    }
}

/// Pick the pair with the deepest USD liquidity
fn pick_best_pair(pairs: &[DexPair]) -> Option<&DexPair> {
    pairs.iter().max_by(|a, b| {
        pair_liquidity(a)
            .partial_cmp(&pair_liquidity(b))
            .unwrap_or(std::cmp::Ordering::Equal)
    })
}

fn pair_liquidity(pair: &DexPair) -> f64 {
    pair.liquidity.as_ref().and_then(|l| l.usd).unwrap_or(0.0)
}

fn pair_price_usd(pair: &DexPair) -> f64 {
    pair.price_usd
        .as_deref()
        .and_then(|p| p.parse::<f64>().ok())
        .unwrap_or(0.0)
}

fn short(mint: &str) -> &str {
    &mint[..mint.len().min(8)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::USDC_MINT;

    fn pair(liquidity_usd: f64, price: &str) -> DexPair {
        DexPair {
            chain_id: "solana".into(),
            price_usd: Some(price.into()),
            liquidity: Some(Liquidity {
                usd: Some(liquidity_usd),
            }),
        }
    }

    #[test]
    fn test_pick_best_pair_by_liquidity() {
        let pairs = vec![pair(1_000.0, "1.0"), pair(50_000.0, "1.1"), pair(10.0, "0.9")];
        let best = pick_best_pair(&pairs).unwrap();
        assert_eq!(pair_liquidity(best), 50_000.0);
        assert!((pair_price_usd(best) - 1.1).abs() < 1e-9);
    }

    #[test]
    fn test_pick_best_pair_empty() {
        assert!(pick_best_pair(&[]).is_none());
    }

    #[test]
    fn test_pair_price_parse_failure_is_zero() {
        let p = DexPair {
            chain_id: "solana".into(),
            price_usd: Some("not-a-number".into()),
            liquidity: None,
        };
        assert_eq!(pair_price_usd(&p), 0.0);
    }

    #[tokio::test]
    async fn test_stablecoin_fast_path_skips_network() {
        // Unroutable endpoints prove no network call happens
        let config = OracleConfig {
            price_api_url: "http://127.0.0.1:1/price".into(),
            dexscreener_url: "http://127.0.0.1:1/latest".into(),
            native_price_url: "http://127.0.0.1:1/native".into(),
            price_ttl_secs: 30,
            request_timeout_secs: 1,
        };
        let oracle = PriceOracle::new(config).unwrap();
        let (price, source) = oracle.price(USDC_MINT).await.unwrap();
        assert_eq!(price, 1.0);
        assert_eq!(source, PriceSource::Stable);
    }

    #[tokio::test]
    async fn test_unreachable_sources_yield_price_unavailable() {
        let config = OracleConfig {
            price_api_url: "http://127.0.0.1:1/price".into(),
            dexscreener_url: "http://127.0.0.1:1/latest".into(),
            native_price_url: "http://127.0.0.1:1/native".into(),
            price_ttl_secs: 30,
            request_timeout_secs: 1,
        };
        let oracle = PriceOracle::new(config).unwrap();
        let err = oracle.price("SomeRandomMint1111").await.unwrap_err();
        assert!(matches!(err, Error::PriceUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let config = OracleConfig {
            price_api_url: "http://127.0.0.1:1/price".into(),
            dexscreener_url: "http://127.0.0.1:1/latest".into(),
            native_price_url: "http://127.0.0.1:1/native".into(),
            price_ttl_secs: 30,
            request_timeout_secs: 1,
        };
        let oracle = PriceOracle::new(config).unwrap();
        oracle
            .cache
            .insert("MintX".into(), (2.5, Instant::now()));
        let (price, source) = oracle.price("MintX").await.unwrap();
        assert_eq!(price, 2.5);
        assert_eq!(source, PriceSource::Cache);
    }
}
