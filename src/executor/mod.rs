//! Swap executor
//!
//! Composes the aggregator and the chain client to drive one buy or sell to
//! completion: quote, build, sign, simulate, send with fresh-blockhash
//! retries, confirm. The executor never touches the position store; the
//! engine owns that write path.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::aggregator::{Aggregator, Quote};
use crate::chain::history::{TxHistoryEntry, TxStatus};
use crate::chain::{ChainApi, Confirmation};
use crate::config::TradingConfig;
use crate::constants::{LAMPORTS_PER_SOL, SOL_MINT};
use crate::error::{Error, Result};
use crate::store::types::TradeSide;
use crate::wallet::WalletSigner;

/// Completed buy: what was spent and what was received, in smallest units
#[derive(Debug, Clone)]
pub struct BuyOutcome {
    pub signature: String,
    /// Lamports spent
    pub filled_input: u64,
    /// Token smallest units received
    pub filled_output: u64,
    pub price_impact_pct: f64,
    pub priority_fee_micro_lamports: u64,
}

/// Completed sell, symmetric to the buy
#[derive(Debug, Clone)]
pub struct SellOutcome {
    pub signature: String,
    /// Token smallest units sold
    pub filled_input: u64,
    /// Lamports received
    pub filled_output: u64,
    pub price_impact_pct: f64,
    pub priority_fee_micro_lamports: u64,
}

/// Drives individual swaps end to end
pub struct Executor {
    aggregator: Arc<dyn Aggregator>,
    chain: Arc<dyn ChainApi>,
    wallet: Arc<dyn WalletSigner>,
    config: TradingConfig,
    confirm_timeout: Duration,
}

impl Executor {
    pub fn new(
        aggregator: Arc<dyn Aggregator>,
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn WalletSigner>,
        config: TradingConfig,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            aggregator,
            chain,
            wallet,
            config,
            confirm_timeout,
        }
    }

    /// Buy `amount_usd` worth of `mint`, paying in SOL.
    pub async fn execute_buy(
        &self,
        position_id: &str,
        mint: &str,
        amount_usd: f64,
        sol_price: f64,
        token_price_usd: f64,
        slippage_bps: u16,
        priority_fee: Option<u64>,
    ) -> Result<BuyOutcome> {
        if sol_price <= 0.0 {
            return Err(Error::PriceUnavailable {
                mint: SOL_MINT.into(),
                reason: "SOL price required to size the input".into(),
            });
        }

        let lamports = (amount_usd / sol_price * LAMPORTS_PER_SOL as f64) as u64;
        if lamports == 0 {
            return Err(Error::TradeRejected(format!(
                "amount ${:.2} rounds to zero lamports",
                amount_usd
            )));
        }

        let quote = self
            .aggregator
            .quote(SOL_MINT, mint, lamports, slippage_bps)
            .await?;
        info!(
            mint = %mint,
            in_lamports = quote.input_amount,
            out_units = quote.output_amount,
            impact = quote.price_impact_pct,
            "Buy quote acquired"
        );

        let fee = match priority_fee {
            Some(fee) => fee,
            None => self.chain.sample_priority_fee().await,
        };

        let (signature, confirmation) = self.drive_swap(&quote, fee).await.map_err(|e| {
            self.record(
                position_id,
                TradeSide::Buy,
                "",
                TxStatus::Failed,
                None,
                Some(e.to_string()),
                lamports as f64 / LAMPORTS_PER_SOL as f64,
                quote.output_amount,
                token_price_usd,
            );
            e
        })?;

        self.record(
            position_id,
            TradeSide::Buy,
            &signature,
            status_for(&confirmation),
            Some(&confirmation),
            None,
            quote.input_amount as f64 / LAMPORTS_PER_SOL as f64,
            quote.output_amount,
            token_price_usd,
        );

        Ok(BuyOutcome {
            signature,
            filled_input: quote.input_amount,
            filled_output: quote.output_amount,
            price_impact_pct: quote.price_impact_pct,
            priority_fee_micro_lamports: fee,
        })
    }

    /// Sell `amount` smallest units of `mint` back into SOL.
    pub async fn execute_sell(
        &self,
        position_id: &str,
        mint: &str,
        amount: u64,
        token_price_usd: f64,
        slippage_bps: u16,
        priority_fee: Option<u64>,
    ) -> Result<SellOutcome> {
        if amount == 0 {
            return Err(Error::InsufficientBalance {
                available: 0,
                required: 1,
            });
        }

        let quote = self
            .aggregator
            .quote(mint, SOL_MINT, amount, slippage_bps)
            .await?;
        info!(
            mint = %mint,
            in_units = quote.input_amount,
            out_lamports = quote.output_amount,
            impact = quote.price_impact_pct,
            "Sell quote acquired"
        );

        let fee = match priority_fee {
            Some(fee) => fee,
            None => self.chain.sample_priority_fee().await,
        };

        let (signature, confirmation) = self.drive_swap(&quote, fee).await.map_err(|e| {
            self.record(
                position_id,
                TradeSide::Sell,
                "",
                TxStatus::Failed,
                None,
                Some(e.to_string()),
                quote.output_amount as f64 / LAMPORTS_PER_SOL as f64,
                amount,
                token_price_usd,
            );
            e
        })?;

        self.record(
            position_id,
            TradeSide::Sell,
            &signature,
            status_for(&confirmation),
            Some(&confirmation),
            None,
            quote.output_amount as f64 / LAMPORTS_PER_SOL as f64,
            quote.input_amount,
            token_price_usd,
        );

        Ok(SellOutcome {
            signature,
            filled_input: quote.input_amount,
            filled_output: quote.output_amount,
            price_impact_pct: quote.price_impact_pct,
            priority_fee_micro_lamports: fee,
        })
    }

    /// Build, sign, optionally simulate, then send-and-confirm with
    /// fresh-blockhash retries. Each attempt re-builds the transaction so
    /// the provider stamps a current blockhash.
    async fn drive_swap(&self, quote: &Quote, fee: u64) -> Result<(String, Confirmation)> {
        let payer = self.wallet.address();

        let build_and_sign = || async {
            let tx = self
                .aggregator
                .build_swap_tx(quote, &payer, Some(fee))
                .await?;
            let signed = self.wallet.sign(&tx)?;
            if self.config.simulate_before_send {
                self.chain.simulate(&signed).await?;
            }
            Ok(signed)
        };

        crate::chain::send_with_retry(
            self.chain.as_ref(),
            self.confirm_timeout,
            self.config.send_attempts,
            build_and_sign,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        position_id: &str,
        side: TradeSide,
        signature: &str,
        status: TxStatus,
        confirmation: Option<&Confirmation>,
        error: Option<String>,
        amount_sol: f64,
        amount_tokens: u64,
        price: f64,
    ) {
        if error.is_some() {
            warn!(position = %position_id, ?side, "Swap failed: {:?}", error);
        }
        self.chain.record_transaction(TxHistoryEntry {
            signature: signature.to_string(),
            status,
            slot: confirmation.and_then(|c| c.slot),
            block_time: confirmation.and_then(|c| c.block_time),
            error,
            position_id: Some(position_id.to_string()),
            side: Some(side),
            amount_sol,
            amount_tokens,
            price,
            timestamp: Utc::now(),
        });
    }
}

fn status_for(confirmation: &Confirmation) -> TxStatus {
    if confirmation.status == "finalized" {
        TxStatus::Finalized
    } else {
        TxStatus::Confirmed
    }
}

/// Classify an executor failure for metrics
pub fn classify_failure(error: &Error) -> crate::error::TradeErrorCode {
    crate::error::TradeErrorCode::classify(&error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test_support::{MockAggregator, MockChain, StaticWallet};

    fn executor(chain: Arc<MockChain>, aggregator: Arc<MockAggregator>) -> Executor {
        Executor::new(
            aggregator,
            chain,
            Arc::new(StaticWallet),
            TradingConfig {
                dry_run: false,
                slippage_bps: 200,
                exit_slippage_bps: 500,
                unwind_slippage_bps: 500,
                simulate_before_send: true,
                send_attempts: 3,
            },
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_execute_buy_happy_path() {
        let chain = Arc::new(MockChain::default());
        let aggregator = Arc::new(MockAggregator::with_rate(1_000));
        let exec = executor(chain.clone(), aggregator);

        // $100 at $25/SOL -> 4 SOL in lamports
        let outcome = exec
            .execute_buy("p1", "MintA", 100.0, 25.0, 1.5, 200, Some(5_000))
            .await
            .unwrap();

        assert_eq!(outcome.filled_input, 4 * LAMPORTS_PER_SOL);
        assert_eq!(outcome.filled_output, 4 * LAMPORTS_PER_SOL * 1_000);
        assert!(!outcome.signature.is_empty());
        assert_eq!(outcome.priority_fee_micro_lamports, 5_000);
        assert_eq!(chain.sent_count(), 1);
        assert_eq!(chain.recorded().len(), 1);
        assert_eq!(chain.recorded()[0].position_id.as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn test_execute_buy_simulation_failure_is_terminal() {
        let chain = Arc::new(MockChain::failing_simulation());
        let aggregator = Arc::new(MockAggregator::with_rate(1_000));
        let exec = executor(chain.clone(), aggregator);

        let err = exec
            .execute_buy("p1", "MintA", 100.0, 25.0, 1.5, 200, Some(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransactionSimulation(_)));
        assert_eq!(chain.sent_count(), 0, "simulation failure must not send");
        // Failure still lands in the transaction history
        assert_eq!(chain.recorded().len(), 1);
        assert!(chain.recorded()[0].is_failure());
    }

    #[tokio::test]
    async fn test_execute_buy_retries_blockhash_expiry() {
        let chain = Arc::new(MockChain::expiring_blockhash(2));
        let aggregator = Arc::new(MockAggregator::with_rate(1_000));
        let exec = executor(chain.clone(), aggregator);

        let outcome = exec
            .execute_buy("p1", "MintA", 100.0, 25.0, 1.5, 200, Some(5_000))
            .await
            .unwrap();
        assert!(!outcome.signature.is_empty());
        assert_eq!(chain.sent_count(), 3, "two expiries then success");
    }

    #[tokio::test]
    async fn test_execute_sell_zero_amount_rejected() {
        let chain = Arc::new(MockChain::default());
        let aggregator = Arc::new(MockAggregator::with_rate(1_000));
        let exec = executor(chain, aggregator);

        let err = exec
            .execute_sell("p1", "MintA", 0, 1.5, 500, Some(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_quote_rejection_surfaces() {
        let chain = Arc::new(MockChain::default());
        let aggregator = Arc::new(MockAggregator::rejecting("no route"));
        let exec = executor(chain.clone(), aggregator);

        let err = exec
            .execute_buy("p1", "MintA", 100.0, 25.0, 1.5, 200, Some(5_000))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuoteRejected(_)));
        assert_eq!(chain.sent_count(), 0);
    }
}

#[cfg(test)]
pub mod test_support;
