//! Emergency stop controller
//!
//! Multi-level global halt consulted at the top of every admission path.
//! Levels form a strict lattice: NONE < TOKEN_PAUSE < SOFT_STOP < HARD_STOP
//! < KILL_SWITCH. State survives restarts; the daily-loss circuit breaker
//! latch lives here too so a crash cannot clear it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::config::EmergencyConfig;
use crate::error::Result;
use crate::store::safe_state::SafeState;

/// Emergency stop severity levels, strictly ordered
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLevel {
    #[default]
    None,
    TokenPause,
    SoftStop,
    HardStop,
    KillSwitch,
}

/// How existing positions are closed under HARD_STOP / KILL_SWITCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnwindStrategy {
    #[default]
    Immediate,
    Graceful,
    Scheduled,
    Manual,
}

/// Persisted stop state
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StopState {
    #[serde(default)]
    pub level: StopLevel,
    #[serde(default)]
    pub activated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub activated_by: Option<String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub paused_mints: BTreeSet<String>,
    #[serde(default)]
    pub unwind_strategy: UnwindStrategy,
    #[serde(default)]
    pub auto_resume_at: Option<DateTime<Utc>>,
    /// Latched by crossing the daily-loss hard limit; admin reset only
    #[serde(default)]
    pub circuit_breaker: bool,
}

/// Alert emitted on every transition
#[derive(Debug, Clone)]
pub struct StopAlert {
    pub level: StopLevel,
    pub message: String,
}

type AlertCallback = Arc<dyn Fn(StopAlert) + Send + Sync>;

/// Emergency stop controller with persistent state and alert fan-out
pub struct EmergencyStop {
    config: EmergencyConfig,
    state: RwLock<StopState>,
    file: SafeState,
    callbacks: RwLock<Vec<AlertCallback>>,
}

impl EmergencyStop {
    pub fn open<P: AsRef<Path>>(path: P, config: EmergencyConfig) -> Result<Self> {
        let file = SafeState::new(path, Duration::from_secs(10))?;
        let state: StopState = file.read(StopState::default());
        if state.level != StopLevel::None {
            info!("Loaded emergency stop state: {:?}", state.level);
        }
        Ok(Self {
            config,
            state: RwLock::new(state),
            file,
            callbacks: RwLock::new(Vec::new()),
        })
    }

    pub fn register_alert_callback(&self, callback: AlertCallback) {
        self.callbacks.write().unwrap().push(callback);
    }

    fn persist_and_alert(&self, state: &StopState, message: String) {
        if let Err(e) = self.file.write(state) {
            error!("Failed to save emergency stop state: {}", e);
        }

        let alert = StopAlert {
            level: state.level,
            message,
        };
        let callbacks = self.callbacks.read().unwrap().clone();
        for cb in callbacks {
            let alert = alert.clone();
            tokio::spawn(async move { cb(alert) });
        }
    }

    pub fn state(&self) -> StopState {
        self.state.read().unwrap().clone()
    }

    pub fn level(&self) -> StopLevel {
        self.state.read().unwrap().level
    }

    pub fn unwind_strategy(&self) -> UnwindStrategy {
        self.state.read().unwrap().unwind_strategy
    }

    /// Positions are unwound at HARD_STOP and above
    pub fn should_unwind(&self) -> bool {
        self.level() >= StopLevel::HardStop
    }

    // ==========================================================================
    // TRANSITIONS
    // ==========================================================================

    pub fn activate_kill_switch(
        &self,
        reason: &str,
        activated_by: &str,
        unwind_strategy: UnwindStrategy,
    ) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.level = StopLevel::KillSwitch;
            guard.activated_at = Some(Utc::now());
            guard.activated_by = Some(activated_by.to_string());
            guard.reason = reason.to_string();
            guard.unwind_strategy = unwind_strategy;
            self.arm_auto_resume(&mut guard);
            guard.clone()
        };
        let message = format!(
            "EMERGENCY KILL SWITCH ACTIVATED | reason: {} | by: {}",
            reason, activated_by
        );
        error!("{}", message);
        self.persist_and_alert(&state, message);
    }

    pub fn activate_hard_stop(
        &self,
        reason: &str,
        activated_by: &str,
        unwind_strategy: UnwindStrategy,
    ) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.level = StopLevel::HardStop;
            guard.activated_at = Some(Utc::now());
            guard.activated_by = Some(activated_by.to_string());
            guard.reason = reason.to_string();
            guard.unwind_strategy = unwind_strategy;
            self.arm_auto_resume(&mut guard);
            guard.clone()
        };
        let message = format!(
            "HARD STOP ACTIVATED | reason: {} | by: {} | unwinding ({:?})",
            reason, activated_by, unwind_strategy
        );
        error!("{}", message);
        self.persist_and_alert(&state, message);
    }

    pub fn activate_soft_stop(&self, reason: &str, activated_by: &str) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.level = StopLevel::SoftStop;
            guard.activated_at = Some(Utc::now());
            guard.activated_by = Some(activated_by.to_string());
            guard.reason = reason.to_string();
            self.arm_auto_resume(&mut guard);
            guard.clone()
        };
        let message = format!(
            "SOFT STOP ACTIVATED | reason: {} | by: {} | no new positions",
            reason, activated_by
        );
        warn!("{}", message);
        self.persist_and_alert(&state, message);
    }

    pub fn pause_token(&self, mint: &str, reason: &str, activated_by: &str) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.paused_mints.insert(mint.to_string());
            if guard.level == StopLevel::None {
                guard.level = StopLevel::TokenPause;
                guard.activated_at = Some(Utc::now());
                guard.activated_by = Some(activated_by.to_string());
            }
            let token_reason = format!("[{}]: {}", short_mint(mint), reason);
            if !guard.reason.contains(&token_reason) {
                if !guard.reason.is_empty() {
                    guard.reason.push('\n');
                }
                guard.reason.push_str(&token_reason);
            }
            guard.clone()
        };
        let message = format!("TOKEN PAUSED: {} | reason: {}", mint, reason);
        warn!("{}", message);
        self.persist_and_alert(&state, message);
    }

    pub fn resume_token(&self, mint: &str) -> bool {
        let state = {
            let mut guard = self.state.write().unwrap();
            if !guard.paused_mints.remove(mint) {
                return false;
            }
            if guard.paused_mints.is_empty() && guard.level == StopLevel::TokenPause {
                guard.level = StopLevel::None;
                guard.activated_at = None;
                guard.activated_by = None;
                guard.reason.clear();
            }
            guard.clone()
        };
        let message = format!("TOKEN RESUMED: {}", mint);
        info!("{}", message);
        self.persist_and_alert(&state, message);
        true
    }

    /// Clear the stop entirely. The circuit breaker stays latched unless
    /// explicitly reset.
    pub fn resume_trading(&self, resumed_by: &str) {
        let (old_level, state) = {
            let mut guard = self.state.write().unwrap();
            let old = guard.level;
            let breaker = guard.circuit_breaker;
            *guard = StopState {
                circuit_breaker: breaker,
                ..StopState::default()
            };
            (old, guard.clone())
        };
        let message = format!(
            "TRADING RESUMED | previous: {:?} | by: {}",
            old_level, resumed_by
        );
        info!("{}", message);
        self.persist_and_alert(&state, message);
    }

    // ==========================================================================
    // CIRCUIT BREAKER
    // ==========================================================================

    pub fn circuit_breaker_latched(&self) -> bool {
        self.state.read().unwrap().circuit_breaker
    }

    pub fn latch_circuit_breaker(&self, reason: &str) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.circuit_breaker = true;
            guard.clone()
        };
        let message = format!("CIRCUIT BREAKER LATCHED | {}", reason);
        error!("{}", message);
        self.persist_and_alert(&state, message);
    }

    pub fn reset_circuit_breaker(&self, admin: &str) {
        let state = {
            let mut guard = self.state.write().unwrap();
            guard.circuit_breaker = false;
            guard.clone()
        };
        let message = format!("Circuit breaker reset by {}", admin);
        info!("{}", message);
        self.persist_and_alert(&state, message);
    }

    // ==========================================================================
    // ADMISSION QUERY
    // ==========================================================================

    /// The canonical query at the top of every admission path.
    /// Returns (allowed, reason_if_blocked).
    pub fn is_trading_allowed(&self, mint: Option<&str>) -> (bool, String) {
        // Auto-resume check first
        let due = {
            let guard = self.state.read().unwrap();
            matches!(guard.auto_resume_at, Some(at) if Utc::now() >= at)
        };
        if due {
            self.resume_trading("auto");
        }

        let guard = self.state.read().unwrap();
        match guard.level {
            StopLevel::KillSwitch => (false, format!("KILL SWITCH ACTIVE: {}", guard.reason)),
            StopLevel::HardStop => (false, format!("HARD STOP ACTIVE: {}", guard.reason)),
            StopLevel::SoftStop => (false, format!("SOFT STOP ACTIVE: {}", guard.reason)),
            _ => {
                if let Some(mint) = mint {
                    if guard.paused_mints.contains(mint) {
                        return (false, format!("TOKEN PAUSED: {}", mint));
                    }
                }
                (true, String::new())
            }
        }
    }

    fn arm_auto_resume(&self, state: &mut StopState) {
        if self.config.auto_resume_after_minutes > 0 {
            state.auto_resume_at =
                Some(Utc::now() + ChronoDuration::minutes(self.config.auto_resume_after_minutes as i64));
        } else {
            state.auto_resume_at = None;
        }
    }
}

fn short_mint(mint: &str) -> &str {
    &mint[..mint.len().min(8)]
}
