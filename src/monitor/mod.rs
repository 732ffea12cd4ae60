//! TP/SL monitor
//!
//! Holds the trigger book (persisted with the same atomic-write discipline
//! as the store) and the poller state machine. The poller itself never
//! writes the position store; every fired exit is handed to the engine's
//! single write path, and a failed exit simply retries on the next tick.
//!
//! WARNING: TP/SL is best-effort, not guaranteed. At a 5-second poll a fast
//! crash can gap through the stop level before detection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::MonitorConfig;
use crate::error::{Error, Result};
use crate::store::safe_state::SafeState;
use crate::store::types::{CloseReason, Position};

/// Trigger direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerKind {
    Tp,
    Sl,
}

/// Trigger lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    Active,
    Executing,
    Completed,
    Cancelled,
    Failed,
}

/// An engine-managed price condition whose satisfaction causes an exit swap
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerOrder {
    pub id: String,
    pub position_id: String,
    pub mint: String,
    /// Smallest units to sell when fired
    pub amount: u64,
    pub kind: TriggerKind,
    pub trigger_price: f64,
    pub status: TriggerStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub triggered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub triggered_price: Option<f64>,
}

/// Observable poller lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Running = 0,
    Ticking = 1,
    Suspended = 2,
    Stopping = 3,
}

impl MonitorState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => MonitorState::Ticking,
            2 => MonitorState::Suspended,
            3 => MonitorState::Stopping,
            _ => MonitorState::Running,
        }
    }
}

/// What a tick decided for one position
#[derive(Debug, Clone, PartialEq)]
pub enum ExitDecision {
    /// No exit condition met
    Hold,
    /// A trigger fired
    Fire {
        trigger_id: String,
        reason: CloseReason,
    },
    /// Price collapsed below the emergency floor; fires even with no armed
    /// or failed SL trigger
    Emergency,
}

/// Trigger book plus poller state machine
pub struct TpSlMonitor {
    config: MonitorConfig,
    orders: RwLock<HashMap<String, TriggerOrder>>,
    file: SafeState,
    state: AtomicU8,
}

impl TpSlMonitor {
    pub fn open<P: AsRef<Path>>(path: P, config: MonitorConfig) -> Result<Self> {
        let file = SafeState::new(path, Duration::from_secs(10))?;
        let orders: Vec<TriggerOrder> = file.read(Vec::new());
        let map = orders.into_iter().map(|o| (o.id.clone(), o)).collect();
        Ok(Self {
            config,
            orders: RwLock::new(map),
            file,
            state: AtomicU8::new(MonitorState::Running as u8),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn state(&self) -> MonitorState {
        MonitorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    async fn persist(&self) -> Result<()> {
        let mut orders: Vec<TriggerOrder> =
            self.orders.read().await.values().cloned().collect();
        orders.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        self.file.write(&orders)
    }

    // ==========================================================================
    // TRIGGER BOOK
    // ==========================================================================

    /// Arm one TP and one SL trigger for a freshly opened position.
    /// Returns (tp_order_id, sl_order_id).
    pub async fn arm(&self, position: &Position) -> Result<(String, String)> {
        let make = |kind: TriggerKind, price: f64| TriggerOrder {
            id: uuid::Uuid::new_v4().to_string()[..8].to_string(),
            position_id: position.id.clone(),
            mint: position.mint.clone(),
            amount: position.amount,
            kind,
            trigger_price: price,
            status: TriggerStatus::Active,
            created_at: Utc::now(),
            triggered_at: None,
            triggered_price: None,
        };

        let tp = make(TriggerKind::Tp, position.tp_price);
        let sl = make(TriggerKind::Sl, position.sl_price);
        let ids = (tp.id.clone(), sl.id.clone());

        {
            let mut orders = self.orders.write().await;
            orders.insert(tp.id.clone(), tp);
            orders.insert(sl.id.clone(), sl);
        }
        self.persist().await?;

        info!(
            position = %position.id,
            tp = %ids.0,
            sl = %ids.1,
            "Armed TP/SL triggers"
        );
        Ok(ids)
    }

    pub async fn get(&self, trigger_id: &str) -> Option<TriggerOrder> {
        self.orders.read().await.get(trigger_id).cloned()
    }

    pub async fn active_orders(&self) -> Vec<TriggerOrder> {
        self.orders
            .read()
            .await
            .values()
            .filter(|o| o.status == TriggerStatus::Active)
            .cloned()
            .collect()
    }

    async fn set_status(&self, trigger_id: &str, status: TriggerStatus) -> Result<()> {
        {
            let mut orders = self.orders.write().await;
            let order = orders
                .get_mut(trigger_id)
                .ok_or_else(|| Error::Internal(format!("unknown trigger {}", trigger_id)))?;
            order.status = status;
        }
        self.persist().await
    }

    /// Mark a trigger as firing, recording when and at what price
    pub async fn mark_executing(&self, trigger_id: &str, price: f64) -> Result<()> {
        {
            let mut orders = self.orders.write().await;
            let order = orders
                .get_mut(trigger_id)
                .ok_or_else(|| Error::Internal(format!("unknown trigger {}", trigger_id)))?;
            order.status = TriggerStatus::Executing;
            order.triggered_at = Some(Utc::now());
            order.triggered_price = Some(price);
        }
        self.persist().await
    }

    pub async fn mark_completed(&self, trigger_id: &str) -> Result<()> {
        self.set_status(trigger_id, TriggerStatus::Completed).await
    }

    /// A failed exit keeps the position open; the next tick retries
    pub async fn mark_failed(&self, trigger_id: &str) -> Result<()> {
        self.set_status(trigger_id, TriggerStatus::Failed).await
    }

    /// Re-activate failed triggers so the next tick can retry them
    pub async fn reactivate_failed(&self, position_id: &str) -> Result<()> {
        {
            let mut orders = self.orders.write().await;
            for order in orders.values_mut() {
                if order.position_id == position_id && order.status == TriggerStatus::Failed {
                    order.status = TriggerStatus::Active;
                }
            }
        }
        self.persist().await
    }

    /// Cancel every non-terminal trigger of a position (sibling cancellation
    /// on close)
    pub async fn cancel_for_position(&self, position_id: &str) -> Result<()> {
        {
            let mut orders = self.orders.write().await;
            for order in orders.values_mut() {
                if order.position_id == position_id
                    && matches!(
                        order.status,
                        TriggerStatus::Active | TriggerStatus::Executing | TriggerStatus::Failed
                    )
                {
                    order.status = TriggerStatus::Cancelled;
                }
            }
        }
        self.persist().await
    }

    /// Cancel everything (emergency stop at HARD_STOP / KILL_SWITCH)
    pub async fn cancel_all(&self) -> Result<()> {
        {
            let mut orders = self.orders.write().await;
            for order in orders.values_mut() {
                if matches!(
                    order.status,
                    TriggerStatus::Active | TriggerStatus::Executing | TriggerStatus::Failed
                ) {
                    order.status = TriggerStatus::Cancelled;
                }
            }
        }
        warn!("All triggers cancelled");
        self.persist().await
    }

    // ==========================================================================
    // EVALUATION
    // ==========================================================================

    /// Decide whether a position exits at this price. The emergency floor is
    /// checked independently of the trigger book.
    pub async fn evaluate(&self, position: &Position, price: f64) -> ExitDecision {
        if position.entry_price > 0.0
            && price < position.entry_price * self.config.emergency_close_factor
        {
            return ExitDecision::Emergency;
        }

        let orders = self.orders.read().await;
        for order in orders.values() {
            if order.position_id != position.id || order.status != TriggerStatus::Active {
                continue;
            }
            let fired = match order.kind {
                TriggerKind::Tp => price >= order.trigger_price,
                TriggerKind::Sl => price <= order.trigger_price,
            };
            if fired {
                return ExitDecision::Fire {
                    trigger_id: order.id.clone(),
                    reason: match order.kind {
                        TriggerKind::Tp => CloseReason::TakeProfit,
                        TriggerKind::Sl => CloseReason::StopLoss,
                    },
                };
            }
        }
        ExitDecision::Hold
    }

    /// Apply trailing-stop rules to an open position for the observed price.
    /// Returns true when peak or stop moved. The stop only ever moves up.
    pub fn apply_trailing(&self, position: &mut Position, price: f64) -> bool {
        if position.entry_price <= 0.0 {
            return false;
        }

        let mut changed = false;

        if position.peak_price < position.entry_price {
            position.peak_price = position.entry_price;
            changed = true;
        }
        if price > position.peak_price {
            position.peak_price = price;
            changed = true;
        }

        let gain_pct = (price - position.entry_price) / position.entry_price * 100.0;

        if gain_pct >= self.config.trailing_gain_pct {
            let trailed = position.peak_price * self.config.trailing_peak_factor;
            if trailed > position.sl_price {
                info!(
                    position = %position.id,
                    gain = format!("{:.1}%", gain_pct),
                    peak = position.peak_price,
                    sl = trailed,
                    "Trailing stop advanced"
                );
                position.sl_price = trailed;
                changed = true;
            }
        } else if gain_pct >= self.config.breakeven_gain_pct
            && position.sl_price < position.entry_price
        {
            info!(
                position = %position.id,
                gain = format!("{:.1}%", gain_pct),
                "Stop moved to breakeven"
            );
            position.sl_price = position.entry_price;
            changed = true;
        }

        changed
    }

    /// Mirror a position's current SL level onto its active SL trigger
    pub async fn sync_sl_trigger(&self, position: &Position) -> Result<()> {
        let mut dirty = false;
        {
            let mut orders = self.orders.write().await;
            for order in orders.values_mut() {
                if order.position_id == position.id
                    && order.kind == TriggerKind::Sl
                    && order.status == TriggerStatus::Active
                    && (order.trigger_price - position.sl_price).abs() > f64::EPSILON
                {
                    order.trigger_price = position.sl_price;
                    dirty = true;
                }
            }
        }
        if dirty {
            self.persist().await?;
        }
        Ok(())
    }

    // ==========================================================================
    // POLLER
    // ==========================================================================

    /// Spawn the single poller. Each tick runs `on_tick` to completion; the
    /// cancellation token stops scheduling new ticks.
    pub fn start<F, Fut>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        on_tick: F,
    ) -> Option<tokio::task::JoinHandle<()>>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.config.enabled {
            info!("TP/SL monitor disabled");
            self.set_state(MonitorState::Suspended);
            return None;
        }

        let monitor = Arc::clone(self);
        let interval = Duration::from_secs(self.config.poll_interval_secs);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(
                "TP/SL monitor started ({}s poll interval)",
                interval.as_secs()
            );

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.set_state(MonitorState::Ticking);
                        on_tick().await;
                        if monitor.state() == MonitorState::Ticking {
                            monitor.set_state(MonitorState::Running);
                        }
                    }
                    _ = cancel.cancelled() => {
                        monitor.set_state(MonitorState::Stopping);
                        info!("TP/SL monitor stopping");
                        break;
                    }
                }
            }
        });
        Some(handle)
    }
}
