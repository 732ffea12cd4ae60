//! On-chain reconciliation
//!
//! Compares the store's open book against the wallet's actual token
//! balances. Store and chain agree within a 5% amount tolerance; a stored
//! position with no on-chain balance is orphaned, a non-zero balance with
//! no position is untracked.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::constants::RECONCILE_IGNORED_MINTS;
use crate::error::Result;
use crate::store::types::{AuditAction, CloseReason, TradeStatus};

use super::TradingEngine;

/// Relative amount difference tolerated before a position counts as mismatched
const AMOUNT_TOLERANCE: f64 = 0.05;

#[derive(Debug, Clone, Serialize)]
pub struct MatchedPosition {
    pub position_id: String,
    pub symbol: String,
    pub mint: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MismatchedPosition {
    pub position_id: String,
    pub symbol: String,
    pub mint: String,
    pub stored_amount: u64,
    pub onchain_amount: u64,
    pub difference_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrphanedPosition {
    pub position_id: String,
    pub symbol: String,
    pub mint: String,
    pub stored_amount: u64,
    pub stored_usd: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UntrackedBalance {
    pub mint: String,
    pub amount: u64,
    pub decimals: u8,
}

/// Full reconciliation outcome
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    pub timestamp: DateTime<Utc>,
    pub matched: Vec<MatchedPosition>,
    pub mismatched: Vec<MismatchedPosition>,
    pub orphaned: Vec<OrphanedPosition>,
    pub untracked: Vec<UntrackedBalance>,
    pub errors: Vec<String>,
}

impl ReconcileReport {
    fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            matched: Vec::new(),
            mismatched: Vec::new(),
            orphaned: Vec::new(),
            untracked: Vec::new(),
            errors: Vec::new(),
        }
    }
}

impl TradingEngine {
    /// Compare every open position against the wallet's token balances.
    pub async fn reconcile_with_onchain(&self) -> ReconcileReport {
        let mut report = ReconcileReport::empty();

        if self.dry_run {
            report
                .errors
                .push("reconciliation runs against the chain; dry-run book skipped".into());
            return report;
        }

        info!("[RECONCILE] Starting on-chain reconciliation");

        let balances = match self.chain.token_balances(&self.wallet.address()).await {
            Ok(balances) => balances,
            Err(e) => {
                warn!("[RECONCILE] Balance fetch failed: {}", e);
                report.errors.push(e.to_string());
                return report;
            }
        };

        let mut seen_mints = std::collections::HashSet::new();

        for position in self.store.open_positions().await {
            let onchain_amount = balances.get(&position.mint).map(|b| b.amount).unwrap_or(0);
            seen_mints.insert(position.mint.clone());

            if onchain_amount == 0 {
                warn!(
                    "[RECONCILE] ORPHANED: {} ({}) has no on-chain balance",
                    position.id, position.symbol
                );
                report.orphaned.push(OrphanedPosition {
                    position_id: position.id.clone(),
                    symbol: position.symbol.clone(),
                    mint: position.mint.clone(),
                    stored_amount: position.amount,
                    stored_usd: position.amount_usd,
                });
                continue;
            }

            let stored = position.amount.max(1) as f64;
            let difference = (onchain_amount as f64 - position.amount as f64).abs() / stored;
            if difference > AMOUNT_TOLERANCE {
                warn!(
                    "[RECONCILE] MISMATCH: {} stored={} onchain={}",
                    position.id, position.amount, onchain_amount
                );
                report.mismatched.push(MismatchedPosition {
                    position_id: position.id.clone(),
                    symbol: position.symbol.clone(),
                    mint: position.mint.clone(),
                    stored_amount: position.amount,
                    onchain_amount,
                    difference_pct: (onchain_amount as f64 - position.amount as f64) / stored
                        * 100.0,
                });
            } else {
                report.matched.push(MatchedPosition {
                    position_id: position.id.clone(),
                    symbol: position.symbol.clone(),
                    mint: position.mint.clone(),
                    amount: position.amount,
                });
            }
        }

        for (mint, balance) in &balances {
            if seen_mints.contains(mint)
                || balance.amount == 0
                || RECONCILE_IGNORED_MINTS.contains(mint.as_str())
            {
                continue;
            }
            warn!(
                "[RECONCILE] UNTRACKED: {} with balance {}",
                mint, balance.amount
            );
            report.untracked.push(UntrackedBalance {
                mint: mint.clone(),
                amount: balance.amount,
                decimals: balance.decimals,
            });
        }

        info!(
            "[RECONCILE] Complete: {} matched, {} orphaned, {} untracked, {} mismatched",
            report.matched.len(),
            report.orphaned.len(),
            report.untracked.len(),
            report.mismatched.len()
        );
        report
    }

    /// Close every orphaned position, attributing a total loss when the
    /// current price cannot be fetched.
    pub async fn auto_reconcile_orphaned(
        &self,
        report: Option<ReconcileReport>,
    ) -> Result<usize> {
        let report = match report {
            Some(r) => r,
            None => self.reconcile_with_onchain().await,
        };

        let mut closed = 0usize;
        for orphan in &report.orphaned {
            let position = match self.store.get(&orphan.position_id).await {
                Some(p) if p.is_open() => p,
                _ => continue,
            };

            let current_price = match self.oracle.usd_price(&position.mint).await {
                Ok((price, _)) => price,
                Err(_) => 0.0,
            };

            let (pnl_pct, pnl_usd) = if current_price > 0.0 && position.entry_price > 0.0 {
                let pct = (current_price - position.entry_price) / position.entry_price * 100.0;
                (pct, position.amount_usd * pct / 100.0)
            } else {
                (-100.0, -position.amount_usd)
            };

            let closed_position = self
                .store
                .close(
                    &position.id,
                    current_price,
                    pnl_usd,
                    pnl_pct,
                    TradeStatus::Closed,
                )
                .await?;
            self.monitor.cancel_for_position(&position.id).await?;

            self.store.audit(
                AuditAction::AutoCloseOrphaned,
                None,
                true,
                serde_json::json!({
                    "position_id": closed_position.id,
                    "token": closed_position.symbol,
                    "pnl_usd": closed_position.pnl_usd,
                    "pnl_pct": closed_position.pnl_pct,
                    "reason": "No on-chain balance",
                }),
            );
            self.publish_close(&closed_position, CloseReason::Orphaned);

            info!(
                "[RECONCILE] Auto-closed orphaned position {} ({}): P&L ${:+.2} ({:+.1}%)",
                closed_position.id, closed_position.symbol, closed_position.pnl_usd,
                closed_position.pnl_pct
            );
            closed += 1;
        }

        if closed > 0 {
            info!("[RECONCILE] Auto-closed {} orphaned positions", closed);
        }
        Ok(closed)
    }
}
