//! Error types for the crash game engine
//!
//! One root error with category enums underneath. Admission failures
//! (`GameError`) are ordinary user-facing outcomes; store failures are
//! retried by the orchestrator; `Halted` is the only fatal condition.

use thiserror::Error;

/// Root error type for all crashline operations
#[derive(Debug, Error)]
pub enum CrashError {
    /// Round admission and lifecycle errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// State store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Crash point commitment / reveal errors
    #[error("Fairness error: {0}")]
    Fairness(#[from] FairnessError),

    /// The engine cannot create new rounds any more
    #[error("Engine halted: {0}")]
    Halted(String),
}

/// Round admission and lifecycle errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GameError {
    #[error("Operation '{operation}' not allowed while round is {status}")]
    InvalidState {
        operation: &'static str,
        status: &'static str,
    },

    #[error("Player {0} already has a bet in this round")]
    DuplicateBet(String),

    #[error("Player {0} has no bet in this round")]
    NoSuchBet(String),

    #[error("Player {0} already cashed out")]
    AlreadyCashedOut(String),

    #[error("Insufficient funds: balance {balance:.2}, requested {requested:.2}")]
    InsufficientFunds { balance: f64, requested: f64 },

    #[error("Round not found: {0}")]
    RoundNotFound(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}

/// State store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupted record at {key}: {reason}")]
    Corrupted { key: String, reason: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Configuration and validation errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Invalid value for {field}: '{value}' ({reason})")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration: {0}")]
    LoadFailed(String),
}

/// Crash point commitment / reveal errors
#[derive(Debug, Error)]
pub enum FairnessError {
    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Malformed proof: {0}")]
    MalformedProof(String),

    #[error("VRF proof does not verify")]
    BadSignature,

    #[error("Revealed output does not match commitment")]
    CommitmentMismatch,

    #[error("No crash point available: {0}")]
    Exhausted(String),
}

/// Stable, user-facing error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidState,
    DuplicateBet,
    NoSuchBet,
    AlreadyCashedOut,
    InsufficientFunds,
    StoreUnavailable,
    RoundNotFound,
    InvalidAmount,
    Internal,
    Halted,
}

impl ErrorKind {
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::DuplicateBet => "DUPLICATE_BET",
            ErrorKind::NoSuchBet => "NO_SUCH_BET",
            ErrorKind::AlreadyCashedOut => "ALREADY_CASHED_OUT",
            ErrorKind::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorKind::StoreUnavailable => "STORE_UNAVAILABLE",
            ErrorKind::RoundNotFound => "ROUND_NOT_FOUND",
            ErrorKind::InvalidAmount => "INVALID_AMOUNT",
            ErrorKind::Internal => "INTERNAL_ERROR",
            ErrorKind::Halted => "HALTED",
        }
    }
}

impl CrashError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CrashError::Game(e) => match e {
                GameError::InvalidState { .. } => ErrorKind::InvalidState,
                GameError::DuplicateBet(_) => ErrorKind::DuplicateBet,
                GameError::NoSuchBet(_) => ErrorKind::NoSuchBet,
                GameError::AlreadyCashedOut(_) => ErrorKind::AlreadyCashedOut,
                GameError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
                GameError::RoundNotFound(_) => ErrorKind::RoundNotFound,
                GameError::InvalidAmount(_) => ErrorKind::InvalidAmount,
            },
            CrashError::Store(StoreError::Unavailable(_)) => ErrorKind::StoreUnavailable,
            CrashError::Halted(_) => ErrorKind::Halted,
            _ => ErrorKind::Internal,
        }
    }

    /// True for transient collaborator failures that are worth retrying
    pub fn is_store_unavailable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }

    /// True for expected admission outcomes reported back to the caller
    pub fn is_admission(&self) -> bool {
        matches!(self, CrashError::Game(_))
    }
}

// External error conversions
impl From<rocksdb::Error> for CrashError {
    fn from(e: rocksdb::Error) -> Self {
        CrashError::Store(StoreError::Unavailable(e.to_string()))
    }
}

impl From<serde_json::Error> for CrashError {
    fn from(e: serde_json::Error) -> Self {
        CrashError::Store(StoreError::Serialization(e.to_string()))
    }
}

impl From<std::io::Error> for CrashError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                CrashError::Configuration(ConfigurationError::LoadFailed(e.to_string()))
            }
            _ => CrashError::Store(StoreError::Unavailable(e.to_string())),
        }
    }
}

// Convenience type alias for Results
pub type CrashResult<T> = Result<T, CrashError>;
