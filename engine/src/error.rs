//! # Engine Error Taxonomy
//!
//! One error enum for the whole engine, mirroring the operation contracts:
//! callers can match on the variant to decide between "your fault"
//! ([`EngineError::Validation`], [`EngineError::InsufficientFunds`]),
//! "not there" ([`EngineError::NotFound`]), "try later"
//! ([`EngineError::RateLimited`], [`EngineError::CapacityExhausted`]) and
//! "our fault" ([`EngineError::Internal`]).
//!
//! `Validation` and `NotFound` are reported before any side effect. Any
//! failure after a reservation goes through compensation first — the
//! settlement engine owns that contract, not this module.
//!
//! `Internal` deliberately carries only a message string: storage details
//! are logged server-side and must never leak to callers.

use thiserror::Error;

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The request was malformed or semantically invalid (zero amount,
    /// missing recipient, self-transfer, ...). No side effects occurred.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The wallet's available balance cannot cover the requested amount
    /// plus fees.
    #[error("insufficient funds: available {available}, requested {requested}")]
    InsufficientFunds {
        /// Spendable balance (`balance - frozen_balance`) at check time.
        available: u64,
        /// Amount the operation needed, fees included.
        requested: u64,
    },

    /// A referenced wallet, transaction, staking position, or receiving
    /// account does not exist (or is not visible to the caller).
    #[error("not found: {0}")]
    NotFound(String),

    /// No active receiving account can absorb the deposit without
    /// breaching its daily cap.
    #[error("no receiving account has capacity for this deposit")]
    CapacityExhausted,

    /// An illegal state transition or a duplicate terminal operation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The caller exceeded the fixed-window limit for this operation
    /// class.
    #[error("rate limited, retry after {retry_after_secs}s")]
    RateLimited {
        /// Whole seconds until the current window expires.
        retry_after_secs: u64,
    },

    /// Storage or infrastructure failure. Logged with full context where
    /// it happened; opaque to callers.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the engine.
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Shorthand constructor for validation failures.
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Shorthand constructor for internal failures.
    pub fn internal(msg: impl Into<String>) -> Self {
        EngineError::Internal(msg.into())
    }
}

impl From<sled::Error> for EngineError {
    fn from(e: sled::Error) -> Self {
        EngineError::Internal(format!("storage: {e}"))
    }
}

impl From<Box<bincode::ErrorKind>> for EngineError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        EngineError::Internal(format!("encoding: {e}"))
    }
}
