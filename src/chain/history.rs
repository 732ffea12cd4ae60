//! Bounded on-disk transaction history
//!
//! Every verified transaction, successful or failed, is appended here. The
//! entries double as the immutable per-side trade records: each carries the
//! position id, trade side, amounts and price alongside the verification
//! outcome. Capped at the most recent 1000 entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::store::safe_state::SafeState;
use crate::store::types::{TradeRecord, TradeSide};

/// History keeps the most recent entries only
const TX_HISTORY_CAP: usize = 1000;

/// Verification outcome for one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxStatus {
    Confirmed,
    Finalized,
    Failed,
    Timeout,
}

/// One verified transaction with its trade attribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxHistoryEntry {
    pub signature: String,
    pub status: TxStatus,
    #[serde(default)]
    pub slot: Option<u64>,
    #[serde(default)]
    pub block_time: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub position_id: Option<String>,
    #[serde(default)]
    pub side: Option<TradeSide>,
    #[serde(default)]
    pub amount_sol: f64,
    #[serde(default)]
    pub amount_tokens: u64,
    #[serde(default)]
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl TxHistoryEntry {
    pub fn is_failure(&self) -> bool {
        matches!(self.status, TxStatus::Failed | TxStatus::Timeout)
    }
}

/// Append-only ring of verified transactions
pub struct TxHistoryLog {
    file: SafeState,
}

impl TxHistoryLog {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self {
            file: SafeState::new(path, Duration::from_secs(10))?,
        })
    }

    pub fn append(&self, entry: TxHistoryEntry) {
        let result = self.file.update(Vec::new(), |mut log: Vec<TxHistoryEntry>| {
            log.push(entry);
            if log.len() > TX_HISTORY_CAP {
                let excess = log.len() - TX_HISTORY_CAP;
                log.drain(..excess);
            }
            log
        });
        if let Err(e) = result {
            warn!("Failed to append transaction history: {}", e);
        }
    }

    pub fn entries(&self) -> Vec<TxHistoryEntry> {
        self.file.read(Vec::new())
    }

    pub fn failed_entries(&self) -> Vec<TxHistoryEntry> {
        self.entries().into_iter().filter(|e| e.is_failure()).collect()
    }

    /// The immutable per-side trade records carried by confirmed entries
    pub fn trade_records(&self) -> Vec<TradeRecord> {
        self.entries()
            .into_iter()
            .filter(|e| !e.is_failure())
            .filter_map(|e| {
                Some(TradeRecord {
                    position_id: e.position_id?,
                    side: e.side?,
                    tx_signature: e.signature,
                    amount_sol: e.amount_sol,
                    amount_tokens: e.amount_tokens,
                    price: e.price,
                    timestamp: e.timestamp,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(sig: &str, status: TxStatus) -> TxHistoryEntry {
        TxHistoryEntry {
            signature: sig.into(),
            status,
            slot: Some(100),
            block_time: Some(1_700_000_000),
            error: None,
            position_id: Some("p1".into()),
            side: Some(TradeSide::Buy),
            amount_sol: 0.5,
            amount_tokens: 1_000_000,
            price: 1.25,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempdir().unwrap();
        let log = TxHistoryLog::open(dir.path().join("transaction_history.json")).unwrap();

        log.append(entry("sig1", TxStatus::Confirmed));
        log.append(entry("sig2", TxStatus::Failed));

        let entries = log.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(log.failed_entries().len(), 1);
        assert_eq!(log.failed_entries()[0].signature, "sig2");
    }

    #[test]
    fn test_trade_records_skip_failures() {
        let dir = tempdir().unwrap();
        let log = TxHistoryLog::open(dir.path().join("transaction_history.json")).unwrap();

        log.append(entry("sig1", TxStatus::Confirmed));
        log.append(entry("sig2", TxStatus::Failed));

        let records = log.trade_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tx_signature, "sig1");
        assert_eq!(records[0].position_id, "p1");
        assert_eq!(records[0].side, TradeSide::Buy);
    }

    #[test]
    fn test_history_bounded() {
        let dir = tempdir().unwrap();
        let log = TxHistoryLog::open(dir.path().join("transaction_history.json")).unwrap();

        for i in 0..(TX_HISTORY_CAP + 10) {
            log.append(entry(&format!("sig{}", i), TxStatus::Confirmed));
        }

        let entries = log.entries();
        assert_eq!(entries.len(), TX_HISTORY_CAP);
        assert_eq!(entries.first().unwrap().signature, "sig10");
    }
}
