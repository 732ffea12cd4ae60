//! Error types for the treasury trading engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the trading engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid keypair: {0}")]
    InvalidKeypair(String),

    // Price oracle errors
    #[error("Price unavailable for {mint}: {reason}")]
    PriceUnavailable { mint: String, reason: String },

    // Aggregator errors
    #[error("Quote rejected: {0}")]
    QuoteRejected(String),

    #[error("Swap transaction build failed: {0}")]
    SwapBuild(String),

    // RPC errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    // Trading errors
    #[error("Transaction simulation failed: {0}")]
    TransactionSimulation(String),

    #[error("Transaction send failed: {0}")]
    TransactionSend(String),

    #[error("Transaction failed on-chain: {0}")]
    TransactionFailed(String),

    #[error("Transaction confirmation timeout after {0}s")]
    ConfirmationTimeout(u64),

    #[error("Slippage exceeded: expected {expected}, got {actual}")]
    SlippageExceeded { expected: u64, actual: u64 },

    #[error("Insufficient balance: {available} available, {required} required")]
    InsufficientBalance { available: u64, required: u64 },

    // Wallet errors
    #[error("Wallet signing failed: {0}")]
    WalletSign(String),

    // Admission errors
    #[error("Trade rejected: {0}")]
    TradeRejected(String),

    #[error("Circuit breaker active: {0}")]
    CircuitBreaker(String),

    #[error("Emergency stop active: {0}")]
    EmergencyStop(String),

    // Position management errors
    #[error("Position not found: {0}")]
    PositionNotFound(String),

    #[error("Position already closed: {0}")]
    PositionAlreadyClosed(String),

    // State file errors
    #[error("State lock timeout for {0}")]
    StateLock(String),

    #[error("State persistence failed: {0}")]
    StatePersistence(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Engine-wide failure classification driving the caller's reaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient; the executor retries internally
    Retry,
    /// Final for this request; surfaced to the caller with a reason
    Reject,
    /// Admission layer detected a latched invariant; surfaced with instructions
    Fatal,
}

/// Machine-readable trade error code for metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeErrorCode {
    Timeout,
    BlockhashExpired,
    SlippageExceeded,
    SimulationFailed,
    InsufficientBalance,
    Unknown,
}

impl TradeErrorCode {
    /// Classify a raw error string the way the execution layer reports them
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("blockhash") || lower.contains("expired") {
            TradeErrorCode::BlockhashExpired
        } else if lower.contains("timeout") || lower.contains("timed out") {
            TradeErrorCode::Timeout
        } else if lower.contains("slippage") {
            TradeErrorCode::SlippageExceeded
        } else if lower.contains("simulation") || lower.contains("simulate") {
            TradeErrorCode::SimulationFailed
        } else if lower.contains("insufficient") {
            TradeErrorCode::InsufficientBalance
        } else {
            TradeErrorCode::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeErrorCode::Timeout => "TIMEOUT",
            TradeErrorCode::BlockhashExpired => "BLOCKHASH_EXPIRED",
            TradeErrorCode::SlippageExceeded => "SLIPPAGE_EXCEEDED",
            TradeErrorCode::SimulationFailed => "SIMULATION_FAILED",
            TradeErrorCode::InsufficientBalance => "INSUFFICIENT_BALANCE",
            TradeErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_)
                | Error::RpcTimeout(_)
                | Error::RpcConnection(_)
                | Error::TransactionSend(_)
                | Error::ConfirmationTimeout(_)
        )
    }

    /// Map into the engine-wide failure classification
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            _ if self.is_retryable() => FailureKind::Retry,
            Error::CircuitBreaker(_) | Error::EmergencyStop(_) => FailureKind::Fatal,
            _ => FailureKind::Reject,
        }
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RpcTimeout(0)
        } else if e.is_connect() {
            Error::RpcConnection(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
