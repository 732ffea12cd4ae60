//! Trading engine orchestrator
//!
//! One coherent orchestrator composing the risk gate, executor, store,
//! monitor and emergency stop behind their trait seams. The engine owns the
//! single write path into the store: the monitor and reconciler decide,
//! the engine mutates.

pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::chain::ChainApi;
use crate::config::Config;
use crate::constants::{LAMPORTS_PER_SOL, SOL_MINT};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EventBus};
use crate::executor::Executor;
use crate::monitor::{ExitDecision, MonitorState, TpSlMonitor};
use crate::oracle::PriceFeed;
use crate::risk::{RiskGate, RiskSnapshot, RiskTier, TradeRequest};
use crate::stop::{EmergencyStop, StopAlert, StopLevel, UnwindStrategy};
use crate::store::types::{
    AuditAction, CloseReason, Position, TradeDirection, TradeReport, TradeStatus,
};
use crate::store::PositionStore;
use crate::wallet::WalletSigner;

/// Default token decimals when the chain has not told us yet
const DEFAULT_TOKEN_DECIMALS: u8 = 9;

/// A caller's request to open a position
#[derive(Debug, Clone, Default)]
pub struct OpenRequest {
    pub mint: String,
    pub symbol: Option<String>,
    pub amount_usd: Option<f64>,
    pub amount_sol: Option<f64>,
    pub sentiment_grade: Option<String>,
    pub sentiment_score: f64,
    pub custom_tp: Option<f64>,
    pub custom_sl: Option<f64>,
}

/// Result object for `open_position`
#[derive(Debug, Clone)]
pub struct OpenResult {
    pub message: String,
    pub position: Position,
}

/// Result object for `close_position`
#[derive(Debug, Clone)]
pub struct CloseResult {
    pub message: String,
    pub position: Position,
}

/// Engine status summary for front-ends
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub dry_run: bool,
    pub sol_balance: f64,
    pub portfolio_usd: f64,
    pub open_positions: usize,
    pub daily_volume_usd: f64,
    pub stop_level: StopLevel,
    pub circuit_breaker: bool,
    pub monitor_state: MonitorState,
    pub report: TradeReport,
}

/// The orchestrator
pub struct TradingEngine {
    pub(crate) store: Arc<PositionStore>,
    gate: RiskGate,
    pub(crate) oracle: Arc<dyn PriceFeed>,
    pub(crate) chain: Arc<dyn ChainApi>,
    executor: Executor,
    pub(crate) wallet: Arc<dyn WalletSigner>,
    stop: Arc<EmergencyStop>,
    pub(crate) monitor: Arc<TpSlMonitor>,
    events: EventBus,
    config: Config,
    pub(crate) dry_run: bool,
    /// Serialises the persistence span of concurrent trades
    exec_lock: Mutex<()>,
    cancel: CancellationToken,
    monitor_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        store: Arc<PositionStore>,
        oracle: Arc<dyn PriceFeed>,
        aggregator: Arc<dyn Aggregator>,
        chain: Arc<dyn ChainApi>,
        wallet: Arc<dyn WalletSigner>,
        stop: Arc<EmergencyStop>,
        monitor: Arc<TpSlMonitor>,
    ) -> Self {
        let executor = Executor::new(
            aggregator,
            chain.clone(),
            wallet.clone(),
            config.trading.clone(),
            Duration::from_secs(config.rpc.confirm_timeout_secs),
        );
        let dry_run = config.trading.dry_run;

        // Stop transitions surface on the event bus alongside position events
        let events = EventBus::new();
        let stop_events = events.clone();
        stop.register_alert_callback(Arc::new(move |alert: StopAlert| {
            stop_events.publish(EngineEvent::StopChanged {
                level: alert.level,
                reason: alert.message,
            });
        }));

        Self {
            store,
            gate: RiskGate::new(config.risk.clone()),
            oracle,
            chain,
            executor,
            wallet,
            stop,
            monitor,
            events,
            config,
            dry_run,
            exec_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
            monitor_task: std::sync::Mutex::new(None),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.stop
    }

    pub fn is_admin(&self, actor: &str) -> bool {
        self.gate.config().admin_ids.iter().any(|a| a == actor)
    }

    /// Load state and spawn the TP/SL poller
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.store.load().await?;

        let engine = Arc::clone(self);
        let monitor = Arc::clone(&self.monitor);
        let handle = monitor.start(self.cancel.clone(), move || {
            let engine = Arc::clone(&engine);
            async move {
                engine.monitor_tick().await;
            }
        });
        *self.monitor_task.lock().unwrap() = handle;
        Ok(())
    }

    /// Cooperative shutdown: stop scheduling ticks, let in-flight work land,
    /// flush the store.
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel.cancel();
        let task = self.monitor_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.store.save().await?;
        info!("Engine shut down");
        Ok(())
    }

    // ==========================================================================
    // PORTFOLIO
    // ==========================================================================

    /// (SOL balance, total USD value) of the treasury wallet
    pub async fn get_portfolio_value(&self) -> (f64, f64) {
        let address = self.wallet.address();

        let sol_balance = match self.chain.balance(&address).await {
            Ok(lamports) => lamports as f64 / LAMPORTS_PER_SOL as f64,
            Err(e) => {
                warn!("get_balance failed, defaulting to 0: {}", e);
                0.0
            }
        };

        let sol_price = self
            .oracle
            .usd_price(SOL_MINT)
            .await
            .map(|(p, _)| p)
            .unwrap_or(0.0);
        let mut usd_value = sol_balance * sol_price;

        if let Ok(balances) = self.chain.token_balances(&address).await {
            let priced = futures::future::join_all(
                balances
                    .into_iter()
                    .filter(|(mint, balance)| mint != SOL_MINT && balance.amount > 0)
                    .map(|(mint, balance)| async move {
                        let price = self
                            .oracle
                            .usd_price(&mint)
                            .await
                            .map(|(p, _)| p)
                            .unwrap_or(0.0);
                        balance.ui_amount() * price
                    }),
            )
            .await;
            usd_value += priced.into_iter().sum::<f64>();
        }

        (sol_balance, usd_value)
    }

    // ==========================================================================
    // OPEN
    // ==========================================================================

    pub async fn open_position(&self, request: OpenRequest, actor: &str) -> Result<OpenResult> {
        let symbol = request.symbol.clone().unwrap_or_else(|| "UNKNOWN".into());
        let grade = request
            .sentiment_grade
            .clone()
            .unwrap_or_else(|| "B".into());

        // Current price first: a refused price is a refused trade
        let (current_price, price_source) = match self.oracle.usd_price(&request.mint).await {
            Ok(p) => p,
            Err(e) => {
                self.audit_rejected(&symbol, "no_price", actor);
                return Err(e);
            }
        };

        // Resolve SOL-denominated sizing before admission
        let sol_price = match self.oracle.usd_price(SOL_MINT).await {
            Ok((p, _)) => p,
            Err(e) => {
                if !self.dry_run || request.amount_sol.is_some() {
                    self.audit_rejected(&symbol, "no_sol_price", actor);
                    return Err(e);
                }
                0.0
            }
        };
        let amount_usd = match (request.amount_usd, request.amount_sol) {
            (Some(usd), _) => Some(usd),
            (None, Some(sol)) => Some(sol * sol_price),
            (None, None) => None,
        };

        let (_, portfolio_usd) = self.get_portfolio_value().await;

        let trade_request = TradeRequest {
            mint: request.mint.clone(),
            symbol: symbol.clone(),
            amount_usd,
            sentiment_grade: grade.clone(),
            actor_id: Some(actor.to_string()),
        };

        let existing = self.store.open_positions_in_mint(&request.mint).await;
        let daily_pnl = self.store.daily_realized_pnl().await;
        let (stop_allowed, stop_reason) = self.stop.is_trading_allowed(Some(&request.mint));

        let snapshot = RiskSnapshot {
            portfolio_usd,
            daily_volume_usd: self.store.daily_volume(),
            open_positions: self.store.open_count().await,
            existing_in_mint: existing.len(),
            existing_in_mint_usd: existing.iter().map(|p| p.amount_usd).sum(),
            daily_realized_loss_usd: (-daily_pnl).max(0.0),
            circuit_breaker_latched: self.stop.circuit_breaker_latched(),
            stop_allowed,
            stop_reason,
        };

        let admission = match self.gate.admit(&trade_request, &snapshot) {
            Ok(admission) => admission,
            Err(rejection) => {
                if rejection.latches_breaker() {
                    self.stop.latch_circuit_breaker(&rejection.to_string());
                }
                warn!("Trade rejected: {}", rejection);
                self.audit_rejected(&symbol, rejection.code(), actor);
                return Err(Error::TradeRejected(rejection.to_string()));
            }
        };

        if admission.tier == RiskTier::HighRisk {
            warn!(
                "HIGH-RISK TOKEN: {} sized down to ${:.2}",
                symbol, admission.sized_usd
            );
        }

        // Liquidity gate; unverifiable liquidity on risky tiers is audited
        match self.oracle.liquidity_usd(&request.mint).await {
            Some(liquidity) if liquidity < self.gate.config().min_liquidity_usd => {
                self.store.audit(
                    AuditAction::OpenPositionRejected,
                    Some(actor),
                    false,
                    serde_json::json!({
                        "token": symbol,
                        "reason": "low_liquidity",
                        "liquidity_usd": liquidity,
                    }),
                );
                return Err(Error::TradeRejected(format!(
                    "{} has insufficient liquidity (${:.0})",
                    symbol, liquidity
                )));
            }
            Some(_) => {}
            None => {
                if matches!(admission.tier, RiskTier::HighRisk | RiskTier::Micro) {
                    warn!(
                        "Liquidity not verified for {} token {}",
                        admission.tier.as_str(),
                        symbol
                    );
                    self.store.audit(
                        AuditAction::LiquidityUnverified,
                        Some(actor),
                        true,
                        serde_json::json!({
                            "token": symbol,
                            "risk_tier": admission.tier.as_str(),
                            "action": "proceeding",
                        }),
                    );
                }
            }
        }

        let (tp_price, sl_price) =
            RiskGate::tp_sl(current_price, &grade, request.custom_tp, request.custom_sl);
        let position_id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let mut position = Position {
            id: position_id.clone(),
            mint: request.mint.clone(),
            symbol: symbol.clone(),
            decimals: DEFAULT_TOKEN_DECIMALS,
            direction: TradeDirection::Long,
            entry_price: current_price,
            current_price,
            peak_price: current_price,
            amount: 0,
            amount_usd: admission.sized_usd,
            tp_price,
            sl_price,
            status: TradeStatus::Pending,
            opened_at: chrono::Utc::now(),
            closed_at: None,
            exit_price: None,
            pnl_usd: 0.0,
            pnl_pct: 0.0,
            sentiment_grade: grade.clone(),
            sentiment_score: request.sentiment_score,
            tp_order_id: None,
            sl_order_id: None,
        };

        info!(
            mint = %request.mint,
            symbol = %symbol,
            tier = admission.tier.as_str(),
            amount_usd = admission.sized_usd,
            price = current_price,
            source = ?price_source,
            dry_run = self.dry_run,
            "Opening position"
        );

        let (message, tx_signature) = if self.dry_run {
            // Simulated fill at the observed price
            position.amount = (admission.sized_usd / current_price
                * 10f64.powi(DEFAULT_TOKEN_DECIMALS as i32))
                as u64;
            position.status = TradeStatus::Open;
            (format!("[DRY RUN] Position opened: {}", position_id), None)
        } else {
            let outcome = match self
                .executor
                .execute_buy(
                    &position_id,
                    &request.mint,
                    admission.sized_usd,
                    sol_price,
                    current_price,
                    self.config.trading.slippage_bps,
                    None,
                )
                .await
            {
                Ok(outcome) => outcome,
                Err(e) => {
                    // PENDING was never persisted; nothing to discard on disk
                    error!("Failed to open position: {}", e);
                    self.store.audit(
                        AuditAction::OpenPosition,
                        Some(actor),
                        false,
                        serde_json::json!({
                            "token": symbol,
                            "error": e.to_string(),
                            "error_code": crate::executor::classify_failure(&e).as_str(),
                        }),
                    );
                    return Err(e);
                }
            };

            position.amount = outcome.filled_output;
            position.status = TradeStatus::Open;
            if let Ok(balances) = self.chain.token_balances(&self.wallet.address()).await {
                if let Some(balance) = balances.get(&request.mint) {
                    position.decimals = balance.decimals;
                }
            }
            (
                format!("Position opened: {}", outcome.signature),
                Some(outcome.signature),
            )
        };

        // Arm triggers, then persist the OPEN position under the trade lock
        let (tp_order_id, sl_order_id) = self.monitor.arm(&position).await?;
        position.tp_order_id = Some(tp_order_id);
        position.sl_order_id = Some(sl_order_id);

        {
            let _guard = self.exec_lock.lock().await;
            self.store.insert(position.clone()).await?;
        }
        if let Err(e) = self.store.add_daily_volume(admission.sized_usd) {
            warn!("Failed to record daily volume: {}", e);
        }

        self.store.audit(
            AuditAction::OpenPosition,
            Some(actor),
            true,
            serde_json::json!({
                "position_id": position.id,
                "token": symbol,
                "token_mint": request.mint,
                "amount_usd": admission.sized_usd,
                "entry_price": current_price,
                "tp_price": tp_price,
                "sl_price": sl_price,
                "sentiment_grade": grade,
                "risk_tier": admission.tier.as_str(),
                "tx_signature": tx_signature,
                "dry_run": self.dry_run,
            }),
        );

        self.events.publish(EngineEvent::PositionOpened {
            position_id: position.id.clone(),
            mint: position.mint.clone(),
            symbol: position.symbol.clone(),
            amount_usd: position.amount_usd,
            entry_price: position.entry_price,
            dry_run: self.dry_run,
        });

        Ok(OpenResult { message, position })
    }

    fn audit_rejected(&self, symbol: &str, reason: &str, actor: &str) {
        self.store.audit(
            AuditAction::OpenPositionRejected,
            Some(actor),
            false,
            serde_json::json!({ "token": symbol, "reason": reason }),
        );
    }

    // ==========================================================================
    // CLOSE
    // ==========================================================================

    pub async fn close_position(
        &self,
        position_id: &str,
        actor: &str,
        reason: CloseReason,
    ) -> Result<CloseResult> {
        if self.gate.config().admin_ids.is_empty() {
            warn!("admin_ids is empty - no one can close positions");
            self.audit_close_rejected(position_id, "no_admins_configured", Some(actor));
            return Err(Error::TradeRejected("No admins configured".into()));
        }
        if !self.is_admin(actor) {
            self.audit_close_rejected(position_id, "unauthorized", Some(actor));
            return Err(Error::TradeRejected(
                "Unauthorized - admin access required".into(),
            ));
        }

        let position = self
            .store
            .get(position_id)
            .await
            .ok_or_else(|| Error::PositionNotFound(position_id.to_string()))?;
        if !position.is_open() {
            self.audit_close_rejected(position_id, "already_closed", Some(actor));
            return Err(Error::PositionAlreadyClosed(position_id.to_string()));
        }

        let (current_price, _) = self.oracle.usd_price(&position.mint).await?;
        let closed = self
            .close_internal(&position, current_price, reason, Some(actor))
            .await?;

        Ok(CloseResult {
            message: format!(
                "{}Closed with P&L: ${:+.2} ({:+.1}%)",
                if self.dry_run { "[DRY RUN] " } else { "" },
                closed.pnl_usd,
                closed.pnl_pct
            ),
            position: closed,
        })
    }

    fn audit_close_rejected(&self, position_id: &str, reason: &str, actor: Option<&str>) {
        self.store.audit(
            AuditAction::ClosePositionRejected,
            actor,
            false,
            serde_json::json!({ "position_id": position_id, "reason": reason }),
        );
    }

    /// The single close path: sells on-chain when live, mutates the store,
    /// cancels sibling triggers, audits, publishes.
    pub(crate) async fn close_internal(
        &self,
        position: &Position,
        current_price: f64,
        reason: CloseReason,
        actor: Option<&str>,
    ) -> Result<Position> {
        let mut effective_reason = reason;
        let mut exit_price = current_price;
        let mut tx_signature: Option<String> = None;

        if !self.dry_run {
            let balances = self.chain.token_balances(&self.wallet.address()).await?;
            let balance = balances
                .get(&position.mint)
                .map(|b| b.amount)
                .unwrap_or(0);

            if balance == 0 {
                effective_reason = CloseReason::NoBalance;
            } else {
                let slippage = match reason {
                    CloseReason::Manual => self.config.trading.slippage_bps,
                    // GRACEFUL unwinds sell at normal slippage; only IMMEDIATE
                    // (and the crash floor) pays the wide emergency band
                    CloseReason::EmergencyStop => match self.stop.unwind_strategy() {
                        UnwindStrategy::Graceful => self.config.trading.exit_slippage_bps,
                        _ => self.config.trading.unwind_slippage_bps,
                    },
                    CloseReason::Emergency90Pct => self.config.trading.unwind_slippage_bps,
                    _ => self.config.trading.exit_slippage_bps,
                };
                let outcome = self
                    .executor
                    .execute_sell(
                        &position.id,
                        &position.mint,
                        balance,
                        current_price,
                        slippage,
                        None,
                    )
                    .await?;
                exit_price = current_price;
                tx_signature = Some(outcome.signature);
            }
        }

        let pnl_pct = if position.entry_price > 0.0 && exit_price > 0.0 {
            (exit_price - position.entry_price) / position.entry_price * 100.0
        } else {
            -100.0
        };
        let pnl_usd = position.amount_usd * pnl_pct / 100.0;

        let closed = {
            let _guard = self.exec_lock.lock().await;
            self.store
                .close(&position.id, exit_price, pnl_usd, pnl_pct, TradeStatus::Closed)
                .await?
        };

        // Whichever trigger did not fire is cancelled with the rest
        self.monitor.cancel_for_position(&position.id).await?;

        // Manual closes that crossed a level are attributed to it
        let close_type = match effective_reason {
            CloseReason::Manual if exit_price >= position.tp_price => "tp",
            CloseReason::Manual if exit_price <= position.sl_price => "sl",
            other => other.as_str(),
        };

        self.store.audit(
            effective_reason.audit_action(),
            actor,
            true,
            serde_json::json!({
                "position_id": closed.id,
                "token": closed.symbol,
                "entry_price": closed.entry_price,
                "exit_price": exit_price,
                "sl_price": closed.sl_price,
                "pnl_usd": pnl_usd,
                "pnl_pct": pnl_pct,
                "reason": effective_reason.as_str(),
                "close_type": close_type,
                "tx_signature": tx_signature,
                "dry_run": self.dry_run,
            }),
        );

        self.publish_close(&closed, effective_reason);

        info!(
            "Closed {} via {}: P&L ${:+.2} ({:+.1}%)",
            closed.symbol,
            effective_reason.as_str(),
            pnl_usd,
            pnl_pct
        );
        Ok(closed)
    }

    pub(crate) fn publish_close(&self, position: &Position, reason: CloseReason) {
        self.events.publish(EngineEvent::PositionClosed {
            position_id: position.id.clone(),
            mint: position.mint.clone(),
            symbol: position.symbol.clone(),
            reason,
            pnl_usd: position.pnl_usd,
            pnl_pct: position.pnl_pct,
        });
    }

    // ==========================================================================
    // PRICE REFRESH
    // ==========================================================================

    /// Refresh current prices and derived PnL for every open position
    pub async fn update_positions(&self) -> Result<()> {
        for position in self.store.open_positions().await {
            let price = match self.oracle.usd_price(&position.mint).await {
                Ok((price, _)) => price,
                Err(e) => {
                    warn!("Price refresh failed for {}: {}", position.symbol, e);
                    continue;
                }
            };

            let updated = self
                .store
                .update_position(&position.id, |p| {
                    p.current_price = price;
                    if p.entry_price > 0.0 {
                        p.pnl_pct = (price - p.entry_price) / p.entry_price * 100.0;
                        p.pnl_usd = p.amount_usd * p.pnl_pct / 100.0;
                    }
                })
                .await?;

            self.events.publish(EngineEvent::PriceUpdated {
                position_id: updated.id,
                mint: updated.mint,
                price,
                pnl_pct: updated.pnl_pct,
            });
        }
        Ok(())
    }

    // ==========================================================================
    // MONITOR TICK
    // ==========================================================================

    /// One poller tick: honour the stop level, trail stops, fire exits.
    pub async fn monitor_tick(&self) {
        let level = self.stop.level();
        if level >= StopLevel::HardStop {
            if level == StopLevel::KillSwitch {
                if let Err(e) = self.monitor.cancel_all().await {
                    warn!("Failed to cancel triggers: {}", e);
                }
            }
            self.unwind_positions().await;
            return;
        }

        for position in self.store.open_positions().await {
            let price = match self.oracle.usd_price(&position.mint).await {
                Ok((price, _)) => price,
                Err(e) => {
                    warn!(
                        "Could not get price for {} - skipping check: {}",
                        position.symbol, e
                    );
                    continue;
                }
            };

            if position.direction != TradeDirection::Long {
                continue;
            }

            // A trigger that failed last tick gets this tick as its retry
            if let Err(e) = self.monitor.reactivate_failed(&position.id).await {
                warn!("Failed to reactivate triggers for {}: {}", position.id, e);
            }

            // Trailing stop first, then the exit tests
            let updated = match self
                .store
                .update_position(&position.id, |p| {
                    p.current_price = price;
                    if p.entry_price > 0.0 {
                        p.pnl_pct = (price - p.entry_price) / p.entry_price * 100.0;
                        p.pnl_usd = p.amount_usd * p.pnl_pct / 100.0;
                    }
                    self.monitor.apply_trailing(p, price);
                })
                .await
            {
                Ok(updated) => updated,
                Err(e) => {
                    warn!("Failed to update {}: {}", position.id, e);
                    continue;
                }
            };
            if let Err(e) = self.monitor.sync_sl_trigger(&updated).await {
                warn!("Failed to sync SL trigger for {}: {}", updated.id, e);
            }

            self.events.publish(EngineEvent::PriceUpdated {
                position_id: updated.id.clone(),
                mint: updated.mint.clone(),
                price,
                pnl_pct: updated.pnl_pct,
            });

            match self.monitor.evaluate(&updated, price).await {
                ExitDecision::Hold => {}
                ExitDecision::Fire { trigger_id, reason } => {
                    if let Err(e) = self.monitor.mark_executing(&trigger_id, price).await {
                        warn!("Failed to mark trigger executing: {}", e);
                        continue;
                    }
                    match self.close_internal(&updated, price, reason, None).await {
                        Ok(_) => {
                            let _ = self.monitor.mark_completed(&trigger_id).await;
                        }
                        Err(e) => {
                            // Keep the position; the next tick is the retry
                            warn!(
                                "Exit failed for {} ({}), will retry next tick: {}",
                                updated.symbol,
                                reason.as_str(),
                                e
                            );
                            let _ = self.monitor.mark_failed(&trigger_id).await;
                        }
                    }
                }
                ExitDecision::Emergency => {
                    warn!(
                        "EMERGENCY CLOSE: {} down {:.1}%",
                        updated.symbol, updated.pnl_pct
                    );
                    if let Err(e) = self
                        .close_internal(&updated, price, CloseReason::Emergency90Pct, None)
                        .await
                    {
                        warn!("Emergency close failed for {}: {}", updated.symbol, e);
                    }
                }
            }
        }
    }

    /// Unwind open positions per the configured strategy.
    ///
    /// IMMEDIATE closes the whole book this tick at wide slippage. GRACEFUL
    /// spreads the closes over the configured window at normal slippage:
    /// each tick takes a batch sized so the book is empty by the deadline,
    /// and anything still open past the deadline goes at once. SCHEDULED and
    /// MANUAL wait for operator action.
    pub async fn unwind_positions(&self) {
        let open = self.store.open_positions().await;
        if open.is_empty() {
            return;
        }

        let batch = match self.stop.unwind_strategy() {
            UnwindStrategy::Scheduled | UnwindStrategy::Manual => return,
            UnwindStrategy::Immediate => open.len(),
            UnwindStrategy::Graceful => self.graceful_unwind_batch(open.len()),
        };

        for position in open.into_iter().take(batch) {
            let price = match self.oracle.usd_price(&position.mint).await {
                Ok((price, _)) => price,
                Err(e) => {
                    warn!("Cannot price {} for unwind: {}", position.symbol, e);
                    continue;
                }
            };
            if let Err(e) = self
                .close_internal(&position, price, CloseReason::EmergencyStop, None)
                .await
            {
                warn!("Unwind close failed for {}: {}", position.symbol, e);
            }
        }
    }

    /// How many positions this tick may close so a graceful unwind finishes
    /// inside its window. Spreads the remaining book over the ticks left;
    /// a zero window or an expired deadline releases everything.
    fn graceful_unwind_batch(&self, open: usize) -> usize {
        let window_secs = self.config.emergency.graceful_unwind_minutes * 60;
        if window_secs == 0 {
            return open;
        }

        let elapsed_secs = self
            .stop
            .state()
            .activated_at
            .map(|at| (chrono::Utc::now() - at).num_seconds().max(0) as u64)
            .unwrap_or(window_secs);
        let remaining_secs = window_secs.saturating_sub(elapsed_secs);
        if remaining_secs == 0 {
            return open;
        }

        let tick_secs = self.config.monitor.poll_interval_secs.max(1);
        let ticks_left = (remaining_secs / tick_secs).max(1) as usize;
        open.div_ceil(ticks_left)
    }

    // ==========================================================================
    // STATUS
    // ==========================================================================

    pub async fn status(&self) -> EngineStatus {
        let (sol_balance, portfolio_usd) = self.get_portfolio_value().await;
        let open = self.store.open_positions().await;
        let history = self.store.full_history().await;

        EngineStatus {
            dry_run: self.dry_run,
            sol_balance,
            portfolio_usd,
            open_positions: open.len(),
            daily_volume_usd: self.store.daily_volume(),
            stop_level: self.stop.level(),
            circuit_breaker: self.stop.circuit_breaker_latched(),
            monitor_state: self.monitor.state(),
            report: TradeReport::build(&history, &open),
        }
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.store.open_positions().await
    }

    pub async fn history(&self, limit: usize) -> Vec<Position> {
        self.store.trade_history(limit).await
    }
}

#[cfg(test)]
mod tests;
