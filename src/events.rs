//! Engine event bus
//!
//! External consumers (front-ends, alerting) subscribe here. Ordering is
//! guaranteed per position: OPENED strictly precedes any PRICE_UPDATED,
//! which strictly precedes CLOSED. No ordering across positions.

use tokio::sync::broadcast;

use crate::stop::StopLevel;
use crate::store::types::CloseReason;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Events surfaced to external consumers
#[derive(Debug, Clone)]
pub enum EngineEvent {
    PositionOpened {
        position_id: String,
        mint: String,
        symbol: String,
        amount_usd: f64,
        entry_price: f64,
        dry_run: bool,
    },
    PriceUpdated {
        position_id: String,
        mint: String,
        price: f64,
        pnl_pct: f64,
    },
    PositionClosed {
        position_id: String,
        mint: String,
        symbol: String,
        reason: CloseReason,
        pnl_usd: f64,
        pnl_pct: f64,
    },
    StopChanged {
        level: StopLevel,
        reason: String,
    },
}

/// Broadcast fan-out for engine events. Slow subscribers lag and drop,
/// they never block the engine.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // No subscribers is fine; events are best-effort
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}
