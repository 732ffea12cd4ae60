//! Core persisted trading types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Trade direction. Short is a reserved tag meaning "skip" for now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeDirection {
    Long,
    Short,
    Neutral,
}

/// Position lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
    Failed,
}

/// A single treasury position.
///
/// Amounts are held in the token's smallest unit; `amount_usd` is the cost
/// basis at entry. TP/SL are absolute USD levels, never percentages at rest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub mint: String,
    pub symbol: String,
    pub decimals: u8,
    pub direction: TradeDirection,
    pub entry_price: f64,
    pub current_price: f64,
    /// Highest price observed while open; drives the trailing stop
    #[serde(default)]
    pub peak_price: f64,
    /// Token amount in smallest units
    pub amount: u64,
    /// Cost basis at entry
    pub amount_usd: f64,
    pub tp_price: f64,
    pub sl_price: f64,
    pub status: TradeStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub pnl_usd: f64,
    #[serde(default)]
    pub pnl_pct: f64,
    #[serde(default)]
    pub sentiment_grade: String,
    #[serde(default)]
    pub sentiment_score: f64,
    #[serde(default)]
    pub tp_order_id: Option<String>,
    #[serde(default)]
    pub sl_order_id: Option<String>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == TradeStatus::Open
    }

    /// Token amount in display units
    pub fn ui_amount(&self) -> f64 {
        self.amount as f64 / 10f64.powi(self.decimals as i32)
    }

    pub fn unrealized_pnl_pct(&self) -> f64 {
        if self.entry_price > 0.0 {
            ((self.current_price - self.entry_price) / self.entry_price) * 100.0
        } else {
            0.0
        }
    }

    pub fn unrealized_pnl_usd(&self) -> f64 {
        self.amount_usd * (self.unrealized_pnl_pct() / 100.0)
    }

    /// Repair records persisted before TP/SL became mandatory
    pub fn repair_missing_levels(&mut self) -> bool {
        let mut repaired = false;
        if self.entry_price > 0.0 {
            if self.tp_price <= 0.0 {
                self.tp_price = self.entry_price * 1.20;
                repaired = true;
            }
            if self.sl_price <= 0.0 {
                self.sl_price = self.entry_price * 0.90;
                repaired = true;
            }
            if self.peak_price < self.entry_price {
                self.peak_price = self.entry_price;
                repaired = true;
            }
        }
        repaired
    }
}

/// Why a position left the open set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    TakeProfit,
    StopLoss,
    #[serde(rename = "EMERGENCY_90PCT")]
    Emergency90Pct,
    Manual,
    NoBalance,
    Orphaned,
    EmergencyStop,
}

impl CloseReason {
    pub fn audit_action(&self) -> AuditAction {
        match self {
            CloseReason::TakeProfit => AuditAction::ClosePositionTp,
            CloseReason::StopLoss => AuditAction::ClosePositionSl,
            CloseReason::Emergency90Pct => AuditAction::ClosePositionEmergency90Pct,
            CloseReason::Manual => AuditAction::ClosePositionManual,
            CloseReason::NoBalance => AuditAction::ClosePosition,
            CloseReason::Orphaned => AuditAction::AutoCloseOrphaned,
            CloseReason::EmergencyStop => AuditAction::ClosePositionEmergency,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::TakeProfit => "TP_HIT",
            CloseReason::StopLoss => "SL_BREACH",
            CloseReason::Emergency90Pct => "EMERGENCY_90PCT",
            CloseReason::Manual => "manual",
            CloseReason::NoBalance => "no_balance",
            CloseReason::Orphaned => "orphaned",
            CloseReason::EmergencyStop => "emergency_stop",
        }
    }
}

/// Which side of a position a trade record covers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeSide {
    Buy,
    Sell,
}

/// Immutable audit row for one side of a position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub side: TradeSide,
    pub tx_signature: String,
    pub amount_sol: f64,
    pub amount_tokens: u64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Rolling daily traded volume, keyed by UTC date
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DailyVolume {
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub volume_usd: f64,
}

impl DailyVolume {
    pub fn today() -> String {
        Utc::now().format("%Y-%m-%d").to_string()
    }
}

/// Closed set of auditable actions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    OpenPosition,
    OpenPositionRejected,
    ClosePosition,
    ClosePositionTp,
    ClosePositionSl,
    ClosePositionEmergency,
    #[serde(rename = "CLOSE_POSITION_EMERGENCY_90PCT")]
    ClosePositionEmergency90Pct,
    ClosePositionManual,
    ClosePositionRejected,
    WalletAccess,
    AutoCloseOrphaned,
    LiquidityUnverified,
    EmergencyStopChanged,
}

/// One audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub success: bool,
    pub details: serde_json::Value,
}

/// Summary of trading performance over the history plus the open book
#[derive(Debug, Clone, Default, Serialize)]
pub struct TradeReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl_usd: f64,
    pub best_trade_pnl: f64,
    pub worst_trade_pnl: f64,
    pub avg_trade_pnl: f64,
    pub open_positions: usize,
    pub unrealized_pnl: f64,
}

impl TradeReport {
    pub fn build(history: &[Position], open: &[Position]) -> Self {
        let total = history.len();
        let winners = history.iter().filter(|p| p.pnl_usd >= 0.0).count();
        let total_pnl: f64 = history.iter().map(|p| p.pnl_usd).sum();

        Self {
            total_trades: total,
            winning_trades: winners,
            losing_trades: total - winners,
            win_rate: if total > 0 {
                winners as f64 / total as f64 * 100.0
            } else {
                0.0
            },
            total_pnl_usd: total_pnl,
            best_trade_pnl: if total > 0 {
                history
                    .iter()
                    .map(|p| p.pnl_usd)
                    .fold(f64::NEG_INFINITY, f64::max)
            } else {
                0.0
            },
            worst_trade_pnl: if total > 0 {
                history.iter().map(|p| p.pnl_usd).fold(f64::INFINITY, f64::min)
            } else {
                0.0
            },
            avg_trade_pnl: if total > 0 {
                total_pnl / total as f64
            } else {
                0.0
            },
            open_positions: open.len(),
            unrealized_pnl: open.iter().map(|p| p.unrealized_pnl_usd()).sum(),
        }
    }
}

#[cfg(test)]
pub(crate) fn sample_position(id: &str, mint: &str, entry: f64) -> Position {
    Position {
        id: id.to_string(),
        mint: mint.to_string(),
        symbol: "TEST".into(),
        decimals: 6,
        direction: TradeDirection::Long,
        entry_price: entry,
        current_price: entry,
        peak_price: entry,
        amount: 1_000_000,
        amount_usd: 100.0,
        tp_price: entry * 1.20,
        sl_price: entry * 0.90,
        status: TradeStatus::Open,
        opened_at: Utc::now(),
        closed_at: None,
        exit_price: None,
        pnl_usd: 0.0,
        pnl_pct: 0.0,
        sentiment_grade: "B".into(),
        sentiment_score: 0.6,
        tp_order_id: None,
        sl_order_id: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_json_round_trip() {
        let position = sample_position("abc12345", "Mint111", 1.5);
        let json = serde_json::to_string_pretty(&position).unwrap();
        let back: Position = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, position.id);
        assert_eq!(back.amount, position.amount);
        assert_eq!(back.status, TradeStatus::Open);
        assert!((back.tp_price - position.tp_price).abs() < 1e-9);
    }

    #[test]
    fn test_repair_missing_levels() {
        let mut position = sample_position("p1", "Mint111", 2.0);
        position.tp_price = 0.0;
        position.sl_price = 0.0;
        position.peak_price = 0.0;

        assert!(position.repair_missing_levels());
        assert!((position.tp_price - 2.4).abs() < 1e-9);
        assert!((position.sl_price - 1.8).abs() < 1e-9);
        assert!((position.peak_price - 2.0).abs() < 1e-9);

        // Already well-formed: no-op
        assert!(!position.repair_missing_levels());
    }

    #[test]
    fn test_unrealized_pnl() {
        let mut position = sample_position("p1", "Mint111", 100.0);
        position.current_price = 110.0;
        assert!((position.unrealized_pnl_pct() - 10.0).abs() < 1e-9);
        assert!((position.unrealized_pnl_usd() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_status_serializes_screaming() {
        assert_eq!(
            serde_json::to_string(&TradeStatus::Open).unwrap(),
            r#""OPEN""#
        );
        assert_eq!(
            serde_json::to_string(&AuditAction::ClosePositionEmergency90Pct).unwrap(),
            r#""CLOSE_POSITION_EMERGENCY_90PCT""#
        );
    }

    #[test]
    fn test_trade_report() {
        let mut won = sample_position("w", "m1", 1.0);
        won.pnl_usd = 30.0;
        let mut lost = sample_position("l", "m2", 1.0);
        lost.pnl_usd = -10.0;
        let mut open = sample_position("o", "m3", 1.0);
        open.current_price = 1.1;

        let report = TradeReport::build(&[won, lost], &[open]);
        assert_eq!(report.total_trades, 2);
        assert_eq!(report.winning_trades, 1);
        assert!((report.win_rate - 50.0).abs() < 1e-9);
        assert!((report.total_pnl_usd - 20.0).abs() < 1e-9);
        assert!((report.best_trade_pnl - 30.0).abs() < 1e-9);
        assert!((report.worst_trade_pnl + 10.0).abs() < 1e-9);
        assert_eq!(report.open_positions, 1);
    }

    #[test]
    fn test_trade_report_all_losses() {
        let mut small_loss = sample_position("a", "m1", 1.0);
        small_loss.pnl_usd = -10.0;
        let mut big_loss = sample_position("b", "m2", 1.0);
        big_loss.pnl_usd = -30.0;

        let report = TradeReport::build(&[small_loss, big_loss], &[]);
        // Best is the least-bad trade, not a phantom 0.0
        assert!((report.best_trade_pnl + 10.0).abs() < 1e-9);
        assert!((report.worst_trade_pnl + 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_report_all_wins() {
        let mut small_win = sample_position("a", "m1", 1.0);
        small_win.pnl_usd = 5.0;
        let mut big_win = sample_position("b", "m2", 1.0);
        big_win.pnl_usd = 25.0;

        let report = TradeReport::build(&[small_win, big_win], &[]);
        assert!((report.best_trade_pnl - 25.0).abs() < 1e-9);
        // Worst is the least-good win
        assert!((report.worst_trade_pnl - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_trade_report_empty_history() {
        let report = TradeReport::build(&[], &[]);
        assert_eq!(report.best_trade_pnl, 0.0);
        assert_eq!(report.worst_trade_pnl, 0.0);
        assert_eq!(report.avg_trade_pnl, 0.0);
    }
}
