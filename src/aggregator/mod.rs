//! Swap aggregator interface
//!
//! The engine only ever sees this trait and the validated `Quote` it
//! returns. The raw HTTP wire lives behind the adapter; the only untyped
//! piece that crosses the boundary is the opaque `quote_blob`, which the
//! adapter hands back verbatim when building the swap transaction.

pub mod jupiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use jupiter::JupiterAggregator;

/// Swap quote mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwapMode {
    ExactIn,
    ExactOut,
}

impl SwapMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwapMode::ExactIn => "ExactIn",
            SwapMode::ExactOut => "ExactOut",
        }
    }
}

/// A priced, route-bound offer. Valid only for a short interval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quote {
    pub input_mint: String,
    pub output_mint: String,
    /// Smallest units
    pub input_amount: u64,
    /// Smallest units
    pub output_amount: u64,
    pub price_impact_pct: f64,
    pub slippage_bps: u16,
    /// Opaque routing detail, kept for logging only
    pub route_plan: serde_json::Value,
    /// Opaque provider blob required to build the swap transaction
    pub quote_blob: serde_json::Value,
}

impl Quote {
    /// Output per input unit, for sanity logging only
    pub fn exchange_rate(&self) -> f64 {
        if self.input_amount == 0 {
            return 0.0;
        }
        self.output_amount as f64 / self.input_amount as f64
    }
}

/// External service that prices a swap and constructs the transaction
#[async_trait]
pub trait Aggregator: Send + Sync {
    /// Quote a swap of `amount` smallest units
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote>;

    /// Build the unsigned swap transaction bytes for a quote
    async fn build_swap_tx(
        &self,
        quote: &Quote,
        payer: &str,
        priority_fee_micro_lamports: Option<u64>,
    ) -> Result<Vec<u8>>;
}
