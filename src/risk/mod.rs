//! Risk gate
//!
//! Pure admission decision for proposed trades. All inputs arrive in the
//! snapshot; the gate itself touches no I/O, so running it twice on the same
//! arguments yields the same answer. TP/SL policy is co-located here because
//! the same grade drives both sizing and exit levels.

use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::config::RiskConfig;
use crate::constants::{
    BLOCKED_SYMBOLS, BLOCKED_TOKENS, ESTABLISHED_TOKENS, HIGH_RISK_PATTERNS, MAJOR_SYMBOLS,
    TOKENIZED_EQUITY_PREFIX,
};

/// Token risk tiers for position sizing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Established,
    Mid,
    Micro,
    HighRisk,
}

impl RiskTier {
    /// Multiplier applied to the caller-supplied notional
    pub fn size_coefficient(&self) -> f64 {
        match self {
            RiskTier::Established => 1.0,
            RiskTier::Mid => 0.50,
            RiskTier::Micro => 0.25,
            RiskTier::HighRisk => 0.15,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Established => "ESTABLISHED",
            RiskTier::Mid => "MID",
            RiskTier::Micro => "MICRO",
            RiskTier::HighRisk => "HIGH_RISK",
        }
    }
}

/// A proposed trade, as submitted by the caller
#[derive(Debug, Clone)]
pub struct TradeRequest {
    pub mint: String,
    pub symbol: String,
    /// None means "size from the portfolio at the configured risk level"
    pub amount_usd: Option<f64>,
    pub sentiment_grade: String,
    pub actor_id: Option<String>,
}

/// Point-in-time view of everything the gate needs to decide
#[derive(Debug, Clone, Default)]
pub struct RiskSnapshot {
    pub portfolio_usd: f64,
    pub daily_volume_usd: f64,
    pub open_positions: usize,
    pub existing_in_mint: usize,
    pub existing_in_mint_usd: f64,
    pub daily_realized_loss_usd: f64,
    pub circuit_breaker_latched: bool,
    pub stop_allowed: bool,
    pub stop_reason: String,
}

/// Positive admission outcome: the sized trade and its classification
#[derive(Debug, Clone)]
pub struct Admission {
    pub sized_usd: f64,
    pub original_usd: f64,
    pub tier: RiskTier,
}

/// First failing check, with the data its message needs
#[derive(Debug, Clone, PartialEq)]
pub enum Rejection {
    EmergencyStop { reason: String },
    BlockedToken { name: String },
    BlockedSymbol { symbol: String },
    Grade { grade: String },
    NotAdmin,
    NoActor,
    InvalidAmount,
    Stacking { symbol: String },
    MaxPositions { max: usize },
    BelowMinNotional { sized: f64, tier: &'static str },
    TradeCap { amount: f64, max: f64 },
    DailyCap { used: f64, max: f64 },
    Concentration { pct: f64, max_pct: f64 },
    MintAllocation { pct: f64, max_pct: f64 },
    DailyLossLimit { loss: f64, limit: f64 },
    CircuitBreaker,
}

impl Rejection {
    /// Short machine-readable code for audit entries
    pub fn code(&self) -> &'static str {
        match self {
            Rejection::EmergencyStop { .. } => "emergency_stop",
            Rejection::BlockedToken { .. } => "blocked_token",
            Rejection::BlockedSymbol { .. } => "blocked_symbol",
            Rejection::Grade { .. } => "grade",
            Rejection::NotAdmin | Rejection::NoActor => "unauthorized",
            Rejection::InvalidAmount => "non_positive_amount",
            Rejection::Stacking { .. } => "duplicate",
            Rejection::MaxPositions { .. } => "max_positions",
            Rejection::BelowMinNotional { .. } => "risk_too_high",
            Rejection::TradeCap { .. } => "trade_cap",
            Rejection::DailyCap { .. } => "daily_cap",
            Rejection::Concentration { .. } => "concentration",
            Rejection::MintAllocation { .. } => "token_allocation",
            Rejection::DailyLossLimit { .. } => "daily_loss_limit",
            Rejection::CircuitBreaker => "circuit_breaker",
        }
    }

    /// The daily-loss rejection is the one that latches the breaker
    pub fn latches_breaker(&self) -> bool {
        matches!(self, Rejection::DailyLossLimit { .. })
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Rejection::EmergencyStop { reason } => write!(f, "{}", reason),
            Rejection::BlockedToken { name } => {
                write!(f, "{} is a stablecoin/blocked token - not tradeable", name)
            }
            Rejection::BlockedSymbol { symbol } => {
                write!(f, "{} is a stablecoin - not tradeable", symbol)
            }
            Rejection::Grade { grade } => write!(f, "Grade {} is too risky", grade),
            Rejection::NoActor => write!(f, "Admin only - please authenticate"),
            Rejection::NotAdmin => write!(f, "Admin only - you are not authorized to trade"),
            Rejection::InvalidAmount => write!(f, "Invalid amount: must be positive"),
            Rejection::Stacking { symbol } => {
                write!(f, "Already have position in {} (stacking disabled)", symbol)
            }
            Rejection::MaxPositions { max } => {
                write!(f, "Maximum positions reached ({})", max)
            }
            Rejection::BelowMinNotional { sized, tier } => write!(
                f,
                "Risk-adjusted size ${:.2} below minimum ({} tier)",
                sized, tier
            ),
            Rejection::TradeCap { amount, max } => {
                write!(f, "Trade ${:.2} exceeds max single trade ${}", amount, max)
            }
            Rejection::DailyCap { used, max } => write!(
                f,
                "Daily limit reached. Used ${:.2}/{}. Remaining: ${:.2}",
                used,
                max,
                max - used
            ),
            Rejection::Concentration { pct, max_pct } => write!(
                f,
                "Position {:.1}% exceeds max {:.0}% of portfolio",
                pct * 100.0,
                max_pct * 100.0
            ),
            Rejection::MintAllocation { pct, max_pct } => write!(
                f,
                "Token allocation {:.1}% exceeds max {:.0}%",
                pct * 100.0,
                max_pct * 100.0
            ),
            Rejection::DailyLossLimit { loss, limit } => write!(
                f,
                "Daily loss ${:.2} exceeds hard limit ${:.2} - circuit breaker latched",
                loss, limit
            ),
            Rejection::CircuitBreaker => write!(
                f,
                "CIRCUIT BREAKER ACTIVE - Trading halted. Contact admin to reset."
            ),
        }
    }
}

/// The admission gate. Configuration is fixed at construction; the per-call
/// state arrives in the snapshot.
pub struct RiskGate {
    config: RiskConfig,
    extra_high_risk: Vec<Regex>,
}

impl RiskGate {
    pub fn new(config: RiskConfig) -> Self {
        let extra_high_risk = config
            .high_risk_patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!("Skipping invalid high-risk pattern {:?}: {}", p, e);
                    None
                }
            })
            .collect();
        Self {
            config,
            extra_high_risk,
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    // ==========================================================================
    // TOKEN CLASSIFICATION
    // ==========================================================================

    pub fn is_blocked_token(&self, mint: &str, symbol: &str) -> Option<Rejection> {
        if let Some(name) = BLOCKED_TOKENS.get(mint) {
            return Some(Rejection::BlockedToken {
                name: name.to_string(),
            });
        }
        if BLOCKED_SYMBOLS.contains(symbol.to_uppercase().as_str()) {
            return Some(Rejection::BlockedSymbol {
                symbol: symbol.to_string(),
            });
        }
        None
    }

    pub fn is_high_risk(&self, mint: &str) -> bool {
        let mint_lower = mint.to_lowercase();
        HIGH_RISK_PATTERNS.iter().any(|p| mint_lower.contains(p))
            || self.extra_high_risk.iter().any(|re| re.is_match(mint))
    }

    /// Classify a token into a sizing tier
    pub fn classify(&self, mint: &str, symbol: &str) -> RiskTier {
        if ESTABLISHED_TOKENS.contains(mint) {
            return RiskTier::Established;
        }
        // Tokenized equities are backed assets
        if mint.starts_with(TOKENIZED_EQUITY_PREFIX) {
            return RiskTier::Established;
        }
        if self.is_high_risk(mint) {
            return RiskTier::HighRisk;
        }
        let upper = symbol.to_uppercase();
        if MAJOR_SYMBOLS.contains(upper.as_str()) {
            return RiskTier::Mid;
        }
        if upper.ends_with('X') && symbol.len() <= 6 {
            return RiskTier::Mid;
        }
        RiskTier::Micro
    }

    // ==========================================================================
    // ADMISSION
    // ==========================================================================

    /// Pure decision function: first failing check wins.
    pub fn admit(
        &self,
        request: &TradeRequest,
        snapshot: &RiskSnapshot,
    ) -> Result<Admission, Rejection> {
        // 1. Global admission
        if !snapshot.stop_allowed {
            return Err(Rejection::EmergencyStop {
                reason: snapshot.stop_reason.clone(),
            });
        }

        // 2. Blocked token / symbol
        if let Some(rejection) = self.is_blocked_token(&request.mint, &request.symbol) {
            return Err(rejection);
        }

        // 3. Risk tier classification
        let tier = self.classify(&request.mint, &request.symbol);

        // 4. Sentiment grade
        let grade = request.sentiment_grade.trim().to_uppercase();
        if grade == "D" || grade == "F" {
            return Err(Rejection::Grade { grade });
        }

        // 5. Admin gate
        match &request.actor_id {
            None => return Err(Rejection::NoActor),
            Some(actor) if !self.config.admin_ids.iter().any(|a| a == actor) => {
                return Err(Rejection::NotAdmin)
            }
            _ => {}
        }

        // 6. Stacking (the only place this flag is consulted)
        if snapshot.existing_in_mint > 0 && !self.config.allow_stacking {
            return Err(Rejection::Stacking {
                symbol: request.symbol.clone(),
            });
        }

        // 7. Position count
        if snapshot.open_positions >= self.config.max_positions {
            return Err(Rejection::MaxPositions {
                max: self.config.max_positions,
            });
        }

        // 8. Risk-adjusted sizing
        let original_usd = match request.amount_usd {
            Some(amount) if amount > 0.0 && amount.is_finite() => amount,
            Some(_) => return Err(Rejection::InvalidAmount),
            None => snapshot.portfolio_usd * self.config.risk_level.position_fraction(),
        };
        let sized_usd = original_usd * tier.size_coefficient();
        if sized_usd < self.config.min_notional_usd {
            return Err(Rejection::BelowMinNotional {
                sized: sized_usd,
                tier: tier.as_str(),
            });
        }

        // 9. Per-trade cap
        if sized_usd > self.config.max_trade_usd {
            return Err(Rejection::TradeCap {
                amount: sized_usd,
                max: self.config.max_trade_usd,
            });
        }

        // 10. Daily cap
        if snapshot.daily_volume_usd + sized_usd > self.config.max_daily_usd {
            return Err(Rejection::DailyCap {
                used: snapshot.daily_volume_usd,
                max: self.config.max_daily_usd,
            });
        }

        // 11. Portfolio concentration
        if snapshot.portfolio_usd > 0.0 {
            let pct = sized_usd / snapshot.portfolio_usd;
            if pct > self.config.max_position_pct {
                return Err(Rejection::Concentration {
                    pct,
                    max_pct: self.config.max_position_pct,
                });
            }
        }

        // 12. Per-mint allocation
        if let Some(max_alloc) = self.config.max_allocation_per_mint {
            if snapshot.portfolio_usd > 0.0 {
                let pct = (snapshot.existing_in_mint_usd + sized_usd) / snapshot.portfolio_usd;
                if pct > max_alloc {
                    return Err(Rejection::MintAllocation {
                        pct,
                        max_pct: max_alloc,
                    });
                }
            }
        }

        // 13. Circuit breaker
        if snapshot.circuit_breaker_latched {
            return Err(Rejection::CircuitBreaker);
        }
        if snapshot.daily_realized_loss_usd > self.config.daily_loss_limit_usd {
            return Err(Rejection::DailyLossLimit {
                loss: snapshot.daily_realized_loss_usd,
                limit: self.config.daily_loss_limit_usd,
            });
        }

        Ok(Admission {
            sized_usd,
            original_usd,
            tier,
        })
    }

    // ==========================================================================
    // TP/SL POLICY
    // ==========================================================================

    /// Grade-keyed TP/SL fractions; unknown grades fall back to +20%/-10%
    fn grade_levels(grade: &str) -> (f64, f64) {
        match grade.trim().to_uppercase().as_str() {
            "A" | "A+" => (0.30, 0.10),
            "B" | "B+" => (0.15, 0.08),
            "C" | "C+" => (0.12, 0.06),
            _ => (0.20, 0.10),
        }
    }

    /// Compute absolute TP/SL prices for an entry.
    /// Post-condition: tp > entry > sl > 0.
    pub fn tp_sl(
        entry_price: f64,
        grade: &str,
        custom_tp: Option<f64>,
        custom_sl: Option<f64>,
    ) -> (f64, f64) {
        let (default_tp, default_sl) = Self::grade_levels(grade);
        let tp_pct = custom_tp.filter(|v| *v > 0.0).unwrap_or(default_tp);
        let sl_pct = custom_sl
            .filter(|v| *v > 0.0 && *v < 1.0)
            .unwrap_or(default_sl);

        (entry_price * (1.0 + tp_pct), entry_price * (1.0 - sl_pct))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SOL_MINT, USDC_MINT};

    fn gate() -> RiskGate {
        let mut config = RiskConfig::test_defaults();
        config.admin_ids = vec!["admin1".into()];
        RiskGate::new(config)
    }

    fn request(mint: &str, amount: f64) -> TradeRequest {
        TradeRequest {
            mint: mint.into(),
            symbol: "TOK".into(),
            amount_usd: Some(amount),
            sentiment_grade: "B".into(),
            actor_id: Some("admin1".into()),
        }
    }

    fn snapshot() -> RiskSnapshot {
        RiskSnapshot {
            portfolio_usd: 10_000.0,
            stop_allowed: true,
            ..RiskSnapshot::default()
        }
    }

    #[test]
    fn test_admit_is_deterministic() {
        let gate = gate();
        let req = request("Mint1111", 100.0);
        let snap = snapshot();
        let first = gate.admit(&req, &snap);
        let second = gate.admit(&req, &snap);
        assert_eq!(first.is_ok(), second.is_ok());
        assert!((first.unwrap().sized_usd - second.unwrap().sized_usd).abs() < 1e-12);
    }

    #[test]
    fn test_grade_f_rejected() {
        let gate = gate();
        let mut req = request("Mint1111", 50.0);
        req.sentiment_grade = "F".into();
        let rejection = gate.admit(&req, &snapshot()).unwrap_err();
        assert_eq!(rejection.code(), "grade");
        assert_eq!(rejection.to_string(), "Grade F is too risky");
    }

    #[test]
    fn test_blocked_mint_and_symbol() {
        let gate = gate();
        let rejection = gate.admit(&request(SOL_MINT, 50.0), &snapshot()).unwrap_err();
        assert_eq!(rejection.code(), "blocked_token");

        let mut req = request("Mint1111", 50.0);
        req.symbol = "USDC".into();
        let rejection = gate.admit(&req, &snapshot()).unwrap_err();
        assert_eq!(rejection.code(), "blocked_symbol");
    }

    #[test]
    fn test_emergency_stop_checked_first() {
        let gate = gate();
        let mut snap = snapshot();
        snap.stop_allowed = false;
        snap.stop_reason = "SOFT STOP ACTIVE: pause".into();
        // Even a blocked token reports the stop first
        let rejection = gate.admit(&request(USDC_MINT, 50.0), &snap).unwrap_err();
        assert_eq!(rejection.code(), "emergency_stop");
    }

    #[test]
    fn test_admin_gate() {
        let gate = gate();
        let mut req = request("Mint1111", 50.0);
        req.actor_id = None;
        assert_eq!(gate.admit(&req, &snapshot()).unwrap_err().code(), "unauthorized");

        req.actor_id = Some("intruder".into());
        assert_eq!(gate.admit(&req, &snapshot()).unwrap_err().code(), "unauthorized");
    }

    #[test]
    fn test_stacking_disabled() {
        let gate = gate();
        let mut snap = snapshot();
        snap.existing_in_mint = 1;
        let rejection = gate.admit(&request("Mint1111", 50.0), &snap).unwrap_err();
        assert_eq!(rejection.code(), "duplicate");
    }

    #[test]
    fn test_stacking_enabled_allows_duplicates() {
        let mut config = RiskConfig::test_defaults();
        config.admin_ids = vec!["admin1".into()];
        config.allow_stacking = true;
        let gate = RiskGate::new(config);
        let mut snap = snapshot();
        snap.existing_in_mint = 1;
        assert!(gate.admit(&request("Mint1111", 50.0), &snap).is_ok());
    }

    #[test]
    fn test_max_positions() {
        let gate = gate();
        let mut snap = snapshot();
        snap.open_positions = gate.config.max_positions;
        let rejection = gate.admit(&request("Mint1111", 50.0), &snap).unwrap_err();
        assert_eq!(rejection.code(), "max_positions");
    }

    #[test]
    fn test_risk_adjusted_sizing() {
        let gate = gate();
        // Unknown token is MICRO: 25% of the requested notional
        let admission = gate.admit(&request("Mint1111", 100.0), &snapshot()).unwrap();
        assert_eq!(admission.tier, RiskTier::Micro);
        assert!((admission.sized_usd - 25.0).abs() < 1e-9);

        // Pump-suffix mint is HIGH_RISK: 15%
        let admission = gate
            .admit(&request("Mint1111pump", 100.0), &snapshot())
            .unwrap();
        assert_eq!(admission.tier, RiskTier::HighRisk);
        assert!((admission.sized_usd - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_tokenized_equity_prefix_is_established() {
        let gate = gate();
        assert_eq!(gate.classify("XsDoge1111", "TSLAX"), RiskTier::Established);
    }

    #[test]
    fn test_daily_cap_message() {
        let mut config = RiskConfig::test_defaults();
        config.admin_ids = vec!["admin1".into()];
        config.max_daily_usd = 500.0;
        let gate = RiskGate::new(config);

        let mut snap = snapshot();
        snap.daily_volume_usd = 480.0;
        // MICRO coefficient 0.25 -> request 120 to land a sized 30
        let rejection = gate.admit(&request("Mint1111", 120.0), &snap).unwrap_err();
        assert_eq!(
            rejection.to_string(),
            "Daily limit reached. Used $480.00/500. Remaining: $20.00"
        );
    }

    #[test]
    fn test_concentration() {
        let gate = gate();
        let mut snap = snapshot();
        snap.portfolio_usd = 100.0;
        // MICRO sizing: 200 * 0.25 = 50 = 50% of a $100 portfolio
        let rejection = gate.admit(&request("Mint1111", 200.0), &snap).unwrap_err();
        assert_eq!(rejection.code(), "concentration");
    }

    #[test]
    fn test_mint_allocation_cap() {
        let mut config = RiskConfig::test_defaults();
        config.admin_ids = vec!["admin1".into()];
        config.allow_stacking = true;
        config.max_allocation_per_mint = Some(0.05);
        let gate = RiskGate::new(config);

        let mut snap = snapshot();
        snap.existing_in_mint = 1;
        snap.existing_in_mint_usd = 480.0;
        let rejection = gate.admit(&request("Mint1111", 100.0), &snap).unwrap_err();
        assert_eq!(rejection.code(), "token_allocation");
    }

    #[test]
    fn test_circuit_breaker_and_daily_loss() {
        let gate = gate();
        let mut snap = snapshot();
        snap.circuit_breaker_latched = true;
        let rejection = gate.admit(&request("Mint1111", 50.0), &snap).unwrap_err();
        assert_eq!(rejection, Rejection::CircuitBreaker);

        let mut snap = snapshot();
        snap.daily_realized_loss_usd = 600.0;
        let rejection = gate.admit(&request("Mint1111", 50.0), &snap).unwrap_err();
        assert!(rejection.latches_breaker());
    }

    #[test]
    fn test_default_sizing_from_portfolio() {
        let gate = gate();
        let mut req = request("Mint1111", 0.0);
        req.amount_usd = None;
        let admission = gate.admit(&req, &snapshot()).unwrap();
        // 2% of 10k = 200, MICRO tier -> 50
        assert!((admission.original_usd - 200.0).abs() < 1e-9);
        assert!((admission.sized_usd - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_amount() {
        let gate = gate();
        let mut req = request("Mint1111", -5.0);
        assert_eq!(
            gate.admit(&req, &snapshot()).unwrap_err().code(),
            "non_positive_amount"
        );
        req.amount_usd = Some(f64::NAN);
        assert_eq!(
            gate.admit(&req, &snapshot()).unwrap_err().code(),
            "non_positive_amount"
        );
    }

    #[test]
    fn test_tp_sl_levels() {
        let (tp, sl) = RiskGate::tp_sl(100.0, "A", None, None);
        assert!((tp - 130.0).abs() < 1e-9);
        assert!((sl - 90.0).abs() < 1e-9);

        let (tp, sl) = RiskGate::tp_sl(100.0, "B", None, None);
        assert!((tp - 115.0).abs() < 1e-9);
        assert!((sl - 92.0).abs() < 1e-9);

        // Unknown grade falls back to +20/-10
        let (tp, sl) = RiskGate::tp_sl(100.0, "Z", None, None);
        assert!((tp - 120.0).abs() < 1e-9);
        assert!((sl - 90.0).abs() < 1e-9);

        // Custom overrides win
        let (tp, sl) = RiskGate::tp_sl(100.0, "A", Some(0.5), Some(0.25));
        assert!((tp - 150.0).abs() < 1e-9);
        assert!((sl - 75.0).abs() < 1e-9);

        // Post-condition holds for every grade
        for grade in ["A", "B", "C", "D", "?"] {
            let (tp, sl) = RiskGate::tp_sl(42.0, grade, None, None);
            assert!(tp > 42.0 && 42.0 > sl && sl > 0.0);
        }
    }
}
