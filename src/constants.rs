//! Curated token tables and well-known mint addresses
//!
//! # WARNING: These lists are policy, not protocol
//! A mint landing in BLOCKED_TOKENS or ESTABLISHED_TOKENS changes how the
//! risk gate sizes and admits trades. Review before editing.

use std::collections::{HashMap, HashSet};

/// Wrapped SOL mint
pub const SOL_MINT: &str = "So11111111111111111111111111111111111111112";

/// USDC mint
pub const USDC_MINT: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

/// USDT mint
pub const USDT_MINT: &str = "Es9vMFrzaCERmJfrF4H2FYD4KCoNkY11McCe8BenwNYB";

/// SOL has 9 decimals; one SOL is 1e9 lamports
pub const SOL_DECIMALS: u8 = 9;
pub const LAMPORTS_PER_SOL: u64 = 1_000_000_000;

lazy_static::lazy_static! {
    /// Tokens that are never tradeable: the treasury's own quote assets
    /// and anything explicitly banned. Maps mint -> display name.
    pub static ref BLOCKED_TOKENS: HashMap<&'static str, &'static str> = {
        let mut m = HashMap::new();
        m.insert(SOL_MINT, "Wrapped SOL");
        m.insert(USDC_MINT, "USDC");
        m.insert(USDT_MINT, "USDT");
        m.insert("USDH1SM1ojwWUga67PGrgFWUHibbjqMvuMaDkRJTgkX", "USDH");
        m
    };

    /// Symbols refused regardless of mint (stablecoins travel under many mints)
    pub static ref BLOCKED_SYMBOLS: HashSet<&'static str> = {
        ["USDC", "USDT", "USDH", "DAI", "PYUSD", "USDE", "WSOL"]
            .into_iter()
            .collect()
    };

    /// Vetted mints that trade at full size
    pub static ref ESTABLISHED_TOKENS: HashSet<&'static str> = {
        [
            // JUP
            "JUPyiwrYJFskUPiHa7hkeR8VUtAeFoSYbKedZNsDvCN",
            // BONK
            "DezXAZ8z7PnrnRJjz3wXBoRgixCa6xjnB7YaB1pPB263",
            // WIF
            "EKpQGSJtjMFqKZ9KQanSqYXRcF8fBopzLHYxdM65zcjm",
            // PYTH
            "HZ1JovNiVvGrGNiiYvEozEVgZ58xaU3RKwX8eACQBCt3",
            // JTO
            "jtojtomepa8beP8AuQc6eXt5FriJwfFMwQx2v2f9mCL",
            // RAY
            "4k3Dyjzvzp8eMZWUXbBCjEvwSkkk59S5iCNLY3QrkX6R",
        ]
        .into_iter()
        .collect()
    };

    /// Symbols of majors that may appear under bridged or alternate mints
    pub static ref MAJOR_SYMBOLS: HashSet<&'static str> = {
        ["BTC", "ETH", "SOL", "BONK", "WIF", "JUP", "PYTH", "JTO", "RAY"]
            .into_iter()
            .collect()
    };

    /// Mints excluded from "untracked" reporting during reconciliation
    pub static ref RECONCILE_IGNORED_MINTS: HashSet<&'static str> = {
        [SOL_MINT, USDC_MINT, USDT_MINT].into_iter().collect()
    };
}

/// Mint substring patterns that classify a token as HIGH_RISK.
/// Pump-launch mints carry a recognisable suffix.
pub const HIGH_RISK_PATTERNS: &[&str] = &["pump", "moon", "bonkbot"];

/// Prefix used by tokenized-equity mints (backed assets, trade as established)
pub const TOKENIZED_EQUITY_PREFIX: &str = "Xs";

/// Check whether a mint is in the curated stablecoin set (price is always 1.0)
pub fn is_stable_mint(mint: &str) -> bool {
    mint == USDC_MINT || mint == USDT_MINT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_tokens_cover_quote_assets() {
        assert!(BLOCKED_TOKENS.contains_key(SOL_MINT));
        assert!(BLOCKED_TOKENS.contains_key(USDC_MINT));
        assert!(BLOCKED_TOKENS.contains_key(USDT_MINT));
    }

    #[test]
    fn test_stable_mint() {
        assert!(is_stable_mint(USDC_MINT));
        assert!(!is_stable_mint(SOL_MINT));
    }
}
