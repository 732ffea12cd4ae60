//! Shared mocks for executor, monitor and engine tests

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::aggregator::{Aggregator, Quote};
use crate::chain::history::TxHistoryEntry;
use crate::chain::{ChainApi, Commitment, Confirmation, TokenBalance};
use crate::error::{Error, Result};
use crate::oracle::{PriceFeed, PriceSource};
use crate::wallet::WalletSigner;

/// Pass-through signer with a fixed address
pub struct StaticWallet;

impl WalletSigner for StaticWallet {
    fn address(&self) -> String {
        "TestPayer11111111111111111111111111111111111".into()
    }

    fn sign(&self, tx_bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(tx_bytes.to_vec())
    }
}

/// In-memory chain double with scriptable failures
#[derive(Default)]
pub struct MockChain {
    pub fail_simulation: bool,
    /// First N sends fail with a blockhash-expired error
    expire_sends: AtomicU32,
    sent: AtomicU32,
    recorded: Mutex<Vec<TxHistoryEntry>>,
    sol_balance: AtomicU64,
    token_balances: Mutex<HashMap<String, TokenBalance>>,
}

impl MockChain {
    pub fn failing_simulation() -> Self {
        Self {
            fail_simulation: true,
            ..Self::default()
        }
    }

    pub fn expiring_blockhash(n: u32) -> Self {
        let chain = Self::default();
        chain.expire_sends.store(n, Ordering::SeqCst);
        chain
    }

    pub fn sent_count(&self) -> u32 {
        self.sent.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<TxHistoryEntry> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn set_sol_balance(&self, lamports: u64) {
        self.sol_balance.store(lamports, Ordering::SeqCst);
    }

    pub fn set_token_balance(&self, mint: &str, amount: u64, decimals: u8) {
        self.token_balances
            .lock()
            .unwrap()
            .insert(mint.to_string(), TokenBalance { amount, decimals });
    }

    pub fn clear_token_balance(&self, mint: &str) {
        self.token_balances.lock().unwrap().remove(mint);
    }
}

#[async_trait]
impl ChainApi for MockChain {
    async fn sample_priority_fee(&self) -> u64 {
        10_000
    }

    async fn simulate(&self, _tx: &[u8]) -> Result<()> {
        if self.fail_simulation {
            Err(Error::TransactionSimulation("mock: program error".into()))
        } else {
            Ok(())
        }
    }

    async fn send(&self, _tx: &[u8]) -> Result<String> {
        let n = self.sent.fetch_add(1, Ordering::SeqCst) + 1;
        if self
            .expire_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
        {
            return Err(Error::TransactionSend("Blockhash not found".into()));
        }
        Ok(format!("MockSig{n}"))
    }

    async fn confirm(
        &self,
        _signature: &str,
        _commitment: Commitment,
        _timeout: Duration,
    ) -> Result<Confirmation> {
        Ok(Confirmation {
            status: "confirmed".into(),
            slot: Some(1_000),
            block_time: Some(1_700_000_000),
        })
    }

    async fn balance(&self, _address: &str) -> Result<u64> {
        Ok(self.sol_balance.load(Ordering::SeqCst))
    }

    async fn token_balances(&self, _address: &str) -> Result<HashMap<String, TokenBalance>> {
        Ok(self.token_balances.lock().unwrap().clone())
    }

    fn record_transaction(&self, entry: TxHistoryEntry) {
        self.recorded.lock().unwrap().push(entry);
    }
}

/// Aggregator double quoting at a fixed output-per-input rate
pub struct MockAggregator {
    rate: u64,
    reject: Option<String>,
    slippages: Mutex<Vec<u16>>,
}

impl MockAggregator {
    pub fn with_rate(rate: u64) -> Self {
        Self {
            rate,
            reject: None,
            slippages: Mutex::new(Vec::new()),
        }
    }

    pub fn rejecting(reason: &str) -> Self {
        Self {
            rate: 0,
            reject: Some(reason.to_string()),
            slippages: Mutex::new(Vec::new()),
        }
    }

    /// Slippage of every quote requested, in order
    pub fn quoted_slippages(&self) -> Vec<u16> {
        self.slippages.lock().unwrap().clone()
    }
}

#[async_trait]
impl Aggregator for MockAggregator {
    async fn quote(
        &self,
        input_mint: &str,
        output_mint: &str,
        amount: u64,
        slippage_bps: u16,
    ) -> Result<Quote> {
        self.slippages.lock().unwrap().push(slippage_bps);
        if let Some(reason) = &self.reject {
            return Err(Error::QuoteRejected(reason.clone()));
        }
        Ok(Quote {
            input_mint: input_mint.to_string(),
            output_mint: output_mint.to_string(),
            input_amount: amount,
            output_amount: amount.saturating_mul(self.rate),
            price_impact_pct: 0.05,
            slippage_bps,
            route_plan: serde_json::json!([]),
            quote_blob: serde_json::json!({"inAmount": amount.to_string()}),
        })
    }

    async fn build_swap_tx(
        &self,
        _quote: &Quote,
        _payer: &str,
        _priority_fee_micro_lamports: Option<u64>,
    ) -> Result<Vec<u8>> {
        Ok(b"mock-swap-tx".to_vec())
    }
}

/// Price feed double with settable per-mint prices and liquidity
#[derive(Default)]
pub struct MockPriceFeed {
    prices: Mutex<HashMap<String, f64>>,
    liquidity: Mutex<HashMap<String, f64>>,
}

impl MockPriceFeed {
    pub fn with_prices(prices: &[(&str, f64)]) -> Self {
        let feed = Self::default();
        for (mint, price) in prices {
            feed.set_price(mint, *price);
        }
        feed
    }

    pub fn set_price(&self, mint: &str, price: f64) {
        self.prices.lock().unwrap().insert(mint.to_string(), price);
    }

    pub fn clear_price(&self, mint: &str) {
        self.prices.lock().unwrap().remove(mint);
    }

    pub fn set_liquidity(&self, mint: &str, liquidity_usd: f64) {
        self.liquidity
            .lock()
            .unwrap()
            .insert(mint.to_string(), liquidity_usd);
    }
}

#[async_trait]
impl PriceFeed for MockPriceFeed {
    async fn usd_price(&self, mint: &str) -> Result<(f64, PriceSource)> {
        match self.prices.lock().unwrap().get(mint) {
            Some(price) if *price > 0.0 => Ok((*price, PriceSource::Aggregator)),
            _ => Err(Error::PriceUnavailable {
                mint: mint.to_string(),
                reason: "mock: no price set".into(),
            }),
        }
    }

    async fn liquidity_usd(&self, mint: &str) -> Option<f64> {
        self.liquidity.lock().unwrap().get(mint).copied()
    }
}
