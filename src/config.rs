//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure. Every section has working defaults; the
/// config file only needs to name what it overrides.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub emergency: EmergencyConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Priority fee (micro-lamports) used when fee sampling returns nothing
    #[serde(default = "default_priority_fee")]
    pub default_priority_fee: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_finalized_timeout_secs")]
    pub finalized_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OracleConfig {
    #[serde(default = "default_price_api_url")]
    pub price_api_url: String,
    #[serde(default = "default_dexscreener_url")]
    pub dexscreener_url: String,
    #[serde(default = "default_native_price_url")]
    pub native_price_url: String,
    /// Price cache TTL; control decisions never trust anything older
    #[serde(default = "default_price_ttl_secs")]
    pub price_ttl_secs: u64,
    #[serde(default = "default_oracle_timeout_secs")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregatorConfig {
    #[serde(default = "default_quote_api_url")]
    pub quote_api_url: String,
    #[serde(default = "default_quote_timeout_secs")]
    pub quote_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_swap_build_timeout_secs")]
    pub swap_build_timeout_secs: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TradingConfig {
    /// Simulate fills at quote prices instead of touching the chain.
    /// TREASURY_LIVE_MODE=true overrides this to false at startup.
    #[serde(default = "default_true")]
    pub dry_run: bool,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u16,
    /// Wider slippage used by trigger-driven exits
    #[serde(default = "default_exit_slippage_bps")]
    pub exit_slippage_bps: u16,
    /// Widest slippage allowed during emergency unwinds (500 = 5%)
    #[serde(default = "default_unwind_slippage_bps")]
    pub unwind_slippage_bps: u16,
    #[serde(default = "default_true")]
    pub simulate_before_send: bool,
    #[serde(default = "default_send_attempts")]
    pub send_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_trade_usd")]
    pub max_trade_usd: f64,
    #[serde(default = "default_max_daily_usd")]
    pub max_daily_usd: f64,
    /// Max fraction of the portfolio a single trade may represent
    #[serde(default = "default_max_position_pct")]
    pub max_position_pct: f64,
    /// Optional cap on total exposure per mint, as a portfolio fraction
    #[serde(default)]
    pub max_allocation_per_mint: Option<f64>,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default)]
    pub allow_stacking: bool,
    #[serde(default = "default_min_notional_usd")]
    pub min_notional_usd: f64,
    #[serde(default = "default_min_liquidity_usd")]
    pub min_liquidity_usd: f64,
    /// Daily realised loss that latches the circuit breaker
    #[serde(default = "default_daily_loss_limit_usd")]
    pub daily_loss_limit_usd: f64,
    /// Default sizing when the caller supplies no notional
    #[serde(default = "default_risk_level")]
    pub risk_level: RiskLevel,
    /// Extra mint substring patterns classified HIGH_RISK (regex, validated)
    #[serde(default)]
    pub high_risk_patterns: Vec<String>,
    #[serde(default)]
    pub admin_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Conservative,
    Moderate,
    Aggressive,
    Degen,
}

impl RiskLevel {
    /// Portfolio fraction committed per default-sized trade
    pub fn position_fraction(&self) -> f64 {
        match self {
            RiskLevel::Conservative => 0.01,
            RiskLevel::Moderate => 0.02,
            RiskLevel::Aggressive => 0.05,
            RiskLevel::Degen => 0.10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Gain that moves the stop to breakeven
    #[serde(default = "default_breakeven_gain_pct")]
    pub breakeven_gain_pct: f64,
    /// Gain that starts trailing the stop below the peak
    #[serde(default = "default_trailing_gain_pct")]
    pub trailing_gain_pct: f64,
    /// Trailing stop distance as a fraction of peak (0.95 = 5% below peak)
    #[serde(default = "default_trailing_peak_factor")]
    pub trailing_peak_factor: f64,
    /// Fraction of entry below which the emergency close fires (0.10 = -90%)
    #[serde(default = "default_emergency_close_factor")]
    pub emergency_close_factor: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmergencyConfig {
    /// Graceful unwind window
    #[serde(default = "default_graceful_unwind_minutes")]
    pub graceful_unwind_minutes: u64,
    /// 0 = manual resume only
    #[serde(default)]
    pub auto_resume_after_minutes: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    /// Logical namespace under data_dir; dry-run books use their own profile
    #[serde(default = "default_state_profile")]
    pub state_profile: String,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WalletConfig {
    /// Path to the treasury keypair file (JSON byte array)
    #[serde(default = "default_keypair_path")]
    pub keypair_path: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            keypair_path: default_keypair_path(),
        }
    }
}

// Default value functions
fn default_rpc_endpoint() -> String {
    std::env::var("RPC_URL").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".into())
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    3
}

fn default_priority_fee() -> u64 {
    10_000
}

fn default_confirm_timeout_secs() -> u64 {
    30
}

fn default_finalized_timeout_secs() -> u64 {
    120
}

fn default_price_api_url() -> String {
    "https://lite-api.jup.ag/price/v2".into()
}

fn default_dexscreener_url() -> String {
    "https://api.dexscreener.com/latest".into()
}

fn default_native_price_url() -> String {
    "https://api.coingecko.com/api/v3/simple/price".into()
}

fn default_price_ttl_secs() -> u64 {
    30
}

fn default_oracle_timeout_secs() -> u64 {
    5
}

fn default_quote_api_url() -> String {
    "https://lite-api.jup.ag/swap/v1".into()
}

fn default_quote_timeout_secs() -> u64 {
    60
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_swap_build_timeout_secs() -> u64 {
    60
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_secs() -> u64 {
    30
}

fn default_slippage_bps() -> u16 {
    200
}

fn default_exit_slippage_bps() -> u16 {
    500
}

fn default_unwind_slippage_bps() -> u16 {
    500
}

fn default_send_attempts() -> u32 {
    3
}

fn default_max_trade_usd() -> f64 {
    500.0
}

fn default_max_daily_usd() -> f64 {
    2000.0
}

fn default_max_position_pct() -> f64 {
    0.10
}

fn default_max_positions() -> usize {
    50
}

fn default_min_notional_usd() -> f64 {
    1.0
}

fn default_min_liquidity_usd() -> f64 {
    10_000.0
}

fn default_daily_loss_limit_usd() -> f64 {
    500.0
}

fn default_risk_level() -> RiskLevel {
    RiskLevel::Moderate
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_breakeven_gain_pct() -> f64 {
    10.0
}

fn default_trailing_gain_pct() -> f64 {
    15.0
}

fn default_trailing_peak_factor() -> f64 {
    0.95
}

fn default_emergency_close_factor() -> f64 {
    0.10
}

fn default_graceful_unwind_minutes() -> u64 {
    30
}

fn default_data_dir() -> String {
    std::env::var("DATA_DIR").unwrap_or_else(|_| "data".into())
}

fn default_state_profile() -> String {
    "treasury".into()
}

fn default_lock_timeout_secs() -> u64 {
    10
}

fn default_keypair_path() -> String {
    "credentials/treasury-keypair.json".into()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            .set_default("store.data_dir", default_data_dir())?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix TREASURY_)
            .add_source(
                config::Environment::with_prefix("TREASURY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Apply the flat environment gates recognised by the treasury.
    ///
    /// TREASURY_LIVE_MODE wins over the configured dry_run default when both
    /// are supplied (inherited behaviour, see DESIGN.md).
    fn apply_env_overrides(&mut self) {
        if let Ok(live) = std::env::var("TREASURY_LIVE_MODE") {
            let live = matches!(live.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
            self.trading.dry_run = !live;
        }

        if let Ok(ids) = std::env::var("TREASURY_ADMIN_IDS") {
            self.risk.admin_ids = ids
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
    }

    /// True when KILL_SWITCH is set in the environment; forces the stop
    /// controller to KILL_SWITCH at startup
    pub fn kill_switch_env() -> bool {
        std::env::var("KILL_SWITCH")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.trading.slippage_bps > 10000 {
            anyhow::bail!("slippage_bps cannot exceed 10000 (100%)");
        }

        if self.trading.unwind_slippage_bps > 10000 {
            anyhow::bail!("unwind_slippage_bps cannot exceed 10000 (100%)");
        }

        if self.risk.max_trade_usd <= 0.0 {
            anyhow::bail!("max_trade_usd must be positive");
        }

        if self.risk.max_daily_usd <= 0.0 {
            anyhow::bail!("max_daily_usd must be positive");
        }

        if !(0.0..=1.0).contains(&self.risk.max_position_pct) {
            anyhow::bail!("max_position_pct must be within [0, 1]");
        }

        if let Some(per_mint) = self.risk.max_allocation_per_mint {
            if !(0.0..=1.0).contains(&per_mint) {
                anyhow::bail!("max_allocation_per_mint must be within [0, 1]");
            }
        }

        if self.risk.daily_loss_limit_usd <= 0.0 {
            anyhow::bail!("daily_loss_limit_usd must be positive");
        }

        if self.monitor.poll_interval_secs == 0 {
            anyhow::bail!("monitor poll_interval_secs must be positive");
        }

        if !(0.0..1.0).contains(&self.monitor.emergency_close_factor) {
            anyhow::bail!("emergency_close_factor must be within [0, 1)");
        }

        if self.monitor.trailing_peak_factor <= 0.0 || self.monitor.trailing_peak_factor >= 1.0 {
            anyhow::bail!("trailing_peak_factor must be within (0, 1)");
        }

        // Validate high-risk patterns (compile regex to check)
        for pattern in &self.risk.high_risk_patterns {
            regex::Regex::new(pattern)
                .with_context(|| format!("Invalid high_risk_pattern regex: {}", pattern))?;
        }

        if self.store.state_profile.is_empty() {
            anyhow::bail!("state_profile must not be empty");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  RPC:
    endpoint: {}
    timeout: {}ms
  Trading:
    dry_run: {}
    slippage: {}bps
    exit_slippage: {}bps
  Risk:
    max_trade: ${}
    max_daily: ${}
    max_position_pct: {}%
    max_positions: {}
    allow_stacking: {}
    daily_loss_limit: ${}
    admins: {}
  Monitor:
    enabled: {}
    poll_interval: {}s
  Store:
    data_dir: {}
    profile: {}
"#,
            mask_url(&self.rpc.endpoint),
            self.rpc.timeout_ms,
            self.trading.dry_run,
            self.trading.slippage_bps,
            self.trading.exit_slippage_bps,
            self.risk.max_trade_usd,
            self.risk.max_daily_usd,
            self.risk.max_position_pct * 100.0,
            self.risk.max_positions,
            self.risk.allow_stacking,
            self.risk.daily_loss_limit_usd,
            self.risk.admin_ids.len(),
            self.monitor.enabled,
            self.monitor.poll_interval_secs,
            self.store.data_dir,
            self.store.state_profile,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            oracle: OracleConfig::default(),
            aggregator: AggregatorConfig::default(),
            trading: TradingConfig::default(),
            risk: RiskConfig::default(),
            monitor: MonitorConfig::default(),
            emergency: EmergencyConfig::default(),
            store: StoreConfig::default(),
            wallet: WalletConfig::default(),
        }
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rpc_endpoint(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            default_priority_fee: default_priority_fee(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            finalized_timeout_secs: default_finalized_timeout_secs(),
        }
    }
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            price_api_url: default_price_api_url(),
            dexscreener_url: default_dexscreener_url(),
            native_price_url: default_native_price_url(),
            price_ttl_secs: default_price_ttl_secs(),
            request_timeout_secs: default_oracle_timeout_secs(),
        }
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            quote_api_url: default_quote_api_url(),
            quote_timeout_secs: default_quote_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            swap_build_timeout_secs: default_swap_build_timeout_secs(),
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_secs: default_retry_max_delay_secs(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            dry_run: true,
            slippage_bps: default_slippage_bps(),
            exit_slippage_bps: default_exit_slippage_bps(),
            unwind_slippage_bps: default_unwind_slippage_bps(),
            simulate_before_send: true,
            send_attempts: default_send_attempts(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_trade_usd: default_max_trade_usd(),
            max_daily_usd: default_max_daily_usd(),
            max_position_pct: default_max_position_pct(),
            max_allocation_per_mint: None,
            max_positions: default_max_positions(),
            allow_stacking: false,
            min_notional_usd: default_min_notional_usd(),
            min_liquidity_usd: default_min_liquidity_usd(),
            daily_loss_limit_usd: default_daily_loss_limit_usd(),
            risk_level: default_risk_level(),
            high_risk_patterns: vec![],
            admin_ids: vec![],
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            breakeven_gain_pct: default_breakeven_gain_pct(),
            trailing_gain_pct: default_trailing_gain_pct(),
            trailing_peak_factor: default_trailing_peak_factor(),
            emergency_close_factor: default_emergency_close_factor(),
        }
    }
}

impl Default for EmergencyConfig {
    fn default() -> Self {
        Self {
            graceful_unwind_minutes: default_graceful_unwind_minutes(),
            auto_resume_after_minutes: 0,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            state_profile: default_state_profile(),
            lock_timeout_secs: default_lock_timeout_secs(),
        }
    }
}

#[cfg(test)]
impl RiskConfig {
    /// Default risk table for unit tests across the crate
    pub(crate) fn test_defaults() -> Self {
        Config::default().risk
    }
}
