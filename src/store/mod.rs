//! Position persistence
//!
//! The store is the exclusive writer for four collections: open positions,
//! closed-trade history, daily volume, and the audit log. Everything lands
//! in pretty-printed JSON under `data_dir/<profile>/` so live and dry-run
//! books can never contaminate each other.

pub mod safe_state;
pub mod types;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use safe_state::SafeState;
use types::{AuditAction, AuditEntry, DailyVolume, Position, TradeStatus};

/// Audit log keeps the most recent entries only
const AUDIT_LOG_CAP: usize = 1000;

/// Exclusive owner of all persisted position state
pub struct PositionStore {
    profile_dir: PathBuf,
    positions_file: SafeState,
    history_file: SafeState,
    volume_file: SafeState,
    audit_file: SafeState,
    positions: Arc<RwLock<HashMap<String, Position>>>,
    history: Arc<RwLock<Vec<Position>>>,
}

impl PositionStore {
    pub fn open(config: &StoreConfig) -> Result<Self> {
        let profile_dir = Path::new(&config.data_dir).join(&config.state_profile);
        let lock_timeout = Duration::from_secs(config.lock_timeout_secs);

        let state = |name: &str| SafeState::new(profile_dir.join(name), lock_timeout);

        let store = Self {
            positions_file: state("positions.json")?,
            history_file: state("trade_history.json")?,
            volume_file: state(".daily_volume.json")?,
            audit_file: state(".audit_log.json")?,
            profile_dir,
            positions: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(Vec::new())),
        };
        Ok(store)
    }

    pub fn profile_dir(&self) -> &Path {
        &self.profile_dir
    }

    /// Load positions and history from disk, repairing legacy records that
    /// predate mandatory TP/SL levels
    pub async fn load(&self) -> Result<()> {
        let raw: Vec<Position> = self.positions_file.read(Vec::new());
        let mut repaired = 0usize;

        let mut map = HashMap::new();
        for mut position in raw {
            if position.repair_missing_levels() {
                repaired += 1;
            }
            map.insert(position.id.clone(), position);
        }

        let count = map.len();
        *self.positions.write().await = map;
        *self.history.write().await = self.history_file.read(Vec::new());

        if repaired > 0 {
            info!("Repaired {} positions missing TP/SL levels", repaired);
            self.save().await?;
        }
        info!("Loaded {} open positions from {:?}", count, self.profile_dir);
        Ok(())
    }

    /// Persist both the open set and the history
    pub async fn save(&self) -> Result<()> {
        let positions: Vec<Position> = {
            let guard = self.positions.read().await;
            let mut v: Vec<Position> = guard.values().cloned().collect();
            v.sort_by(|a, b| a.opened_at.cmp(&b.opened_at));
            v
        };
        self.positions_file.write(&positions)?;

        let history = self.history.read().await.clone();
        self.history_file.write(&history)?;

        debug!(
            "Saved {} open / {} closed positions",
            positions.len(),
            history.len()
        );
        Ok(())
    }

    // ==========================================================================
    // OPEN SET
    // ==========================================================================

    pub async fn insert(&self, position: Position) -> Result<()> {
        self.positions
            .write()
            .await
            .insert(position.id.clone(), position);
        self.save().await
    }

    pub async fn get(&self, position_id: &str) -> Option<Position> {
        self.positions.read().await.get(position_id).cloned()
    }

    pub async fn open_positions(&self) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .cloned()
            .collect()
    }

    pub async fn open_positions_in_mint(&self, mint: &str) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open() && p.mint == mint)
            .cloned()
            .collect()
    }

    pub async fn open_count(&self) -> usize {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.is_open())
            .count()
    }

    /// Apply a mutation to one open position and persist
    pub async fn update_position<F>(&self, position_id: &str, f: F) -> Result<Position>
    where
        F: FnOnce(&mut Position),
    {
        let updated = {
            let mut guard = self.positions.write().await;
            let position = guard
                .get_mut(position_id)
                .ok_or_else(|| Error::PositionNotFound(position_id.to_string()))?;
            f(position);
            position.clone()
        };
        self.save().await?;
        Ok(updated)
    }

    /// Move a position out of the open set into history with its final state
    pub async fn close(
        &self,
        position_id: &str,
        exit_price: f64,
        pnl_usd: f64,
        pnl_pct: f64,
        status: TradeStatus,
    ) -> Result<Position> {
        let closed = {
            let mut guard = self.positions.write().await;
            let mut position = guard
                .remove(position_id)
                .ok_or_else(|| Error::PositionNotFound(position_id.to_string()))?;
            position.status = status;
            position.closed_at = Some(chrono::Utc::now());
            position.exit_price = Some(exit_price);
            position.pnl_usd = pnl_usd;
            position.pnl_pct = pnl_pct;
            position
        };

        self.history.write().await.push(closed.clone());
        self.save().await?;
        Ok(closed)
    }

    pub async fn trade_history(&self, limit: usize) -> Vec<Position> {
        let guard = self.history.read().await;
        let start = guard.len().saturating_sub(limit);
        guard[start..].to_vec()
    }

    pub async fn full_history(&self) -> Vec<Position> {
        self.history.read().await.clone()
    }

    /// Realised PnL over history rows closed today (UTC)
    pub async fn daily_realized_pnl(&self) -> f64 {
        let today = DailyVolume::today();
        self.history
            .read()
            .await
            .iter()
            .filter(|p| {
                p.closed_at
                    .map(|t| t.format("%Y-%m-%d").to_string() == today)
                    .unwrap_or(false)
            })
            .map(|p| p.pnl_usd)
            .sum()
    }

    // ==========================================================================
    // DAILY VOLUME
    // ==========================================================================

    /// Today's traded volume; a stale date reads as zero
    pub fn daily_volume(&self) -> f64 {
        let record: DailyVolume = self.volume_file.read(DailyVolume::default());
        if record.date == DailyVolume::today() {
            record.volume_usd
        } else {
            0.0
        }
    }

    /// Add to today's volume, rolling the date over atomically
    pub fn add_daily_volume(&self, amount_usd: f64) -> Result<()> {
        let today = DailyVolume::today();
        self.volume_file.update(DailyVolume::default(), |current| {
            let base = if current.date == today {
                current.volume_usd
            } else {
                0.0
            };
            DailyVolume {
                date: today.clone(),
                volume_usd: base + amount_usd,
            }
        })?;
        Ok(())
    }

    // ==========================================================================
    // AUDIT LOG
    // ==========================================================================

    /// Append to the bounded audit log
    pub fn audit(
        &self,
        action: AuditAction,
        actor_id: Option<&str>,
        success: bool,
        details: serde_json::Value,
    ) {
        let entry = AuditEntry {
            timestamp: chrono::Utc::now(),
            action,
            actor_id: actor_id.map(str::to_string),
            success,
            details,
        };

        let result = self.audit_file.update(Vec::new(), |mut log: Vec<AuditEntry>| {
            log.push(entry);
            if log.len() > AUDIT_LOG_CAP {
                let excess = log.len() - AUDIT_LOG_CAP;
                log.drain(..excess);
            }
            log
        });

        match result {
            Ok(_) => info!(action = ?action, actor = ?actor_id, success, "AUDIT"),
            Err(e) => warn!("Failed to write audit log: {}", e),
        }
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit_file.read(Vec::new())
    }
}
