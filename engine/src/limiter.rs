//! # Fixed-Window Rate Limiter
//!
//! Counts requests per (caller identity, operation class) inside fixed
//! windows. When a window expires the counter restarts; when the counter
//! exceeds the configured limit the call is rejected with the number of
//! whole seconds until the window resets.
//!
//! Two deliberate softnesses:
//!
//! - **Fail open.** An operation class with no configured policy is
//!   allowed. Rate limiting is a traffic control, not a financial
//!   correctness control — blocking legitimate money movement on a
//!   limiter misconfiguration is the worse failure mode.
//! - **Ephemeral state.** Counters live in memory only. Losing them on
//!   restart resets windows early, which is harmless.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Operation classes
// ---------------------------------------------------------------------------

/// The request classes the limiter distinguishes. Each (caller, class)
/// pair gets its own window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationClass {
    /// Deposit initiation and confirmation.
    Deposit,
    /// Withdrawal initiation.
    Withdrawal,
    /// Internal transfers.
    Transfer,
    /// Stake, unstake, and reward claims.
    Staking,
    /// Read-only lookups.
    Query,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deposit => write!(f, "deposit"),
            Self::Withdrawal => write!(f, "withdrawal"),
            Self::Transfer => write!(f, "transfer"),
            Self::Staking => write!(f, "staking"),
            Self::Query => write!(f, "query"),
        }
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Limit for one operation class: at most `limit` calls per caller in
/// any window of `window_secs` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Maximum calls per window.
    pub limit: u32,
    /// Window length in seconds.
    pub window_secs: u64,
}

impl RateLimitPolicy {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }
}

// ---------------------------------------------------------------------------
// Limiter
// ---------------------------------------------------------------------------

/// One caller's counter inside the current window.
#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    expires_at_ms: u64,
}

/// Thread-safe fixed-window limiter.
///
/// Stateless with respect to configuration: the policy for each call is
/// passed in by the caller (the engine reads it from live config), so
/// limit changes apply without rebuilding the limiter.
#[derive(Debug, Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check and count one call. `policy = None` means the class is not
    /// configured: the call is allowed (fail open).
    pub fn check(
        &self,
        caller: &str,
        class: OperationClass,
        policy: Option<&RateLimitPolicy>,
    ) -> EngineResult<()> {
        self.check_at(caller, class, policy, now_ms())
    }

    /// Clock-injected variant used by tests.
    pub fn check_at(
        &self,
        caller: &str,
        class: OperationClass,
        policy: Option<&RateLimitPolicy>,
        now_ms: u64,
    ) -> EngineResult<()> {
        let Some(policy) = policy else {
            return Ok(());
        };

        let key = format!("{caller}:{class}");
        let mut entry = self.windows.entry(key).or_insert(Window {
            count: 0,
            expires_at_ms: now_ms + policy.window_secs * 1_000,
        });
        if now_ms >= entry.expires_at_ms {
            entry.count = 0;
            entry.expires_at_ms = now_ms + policy.window_secs * 1_000;
        }
        entry.count += 1;
        if entry.count > policy.limit {
            let remaining_ms = entry.expires_at_ms.saturating_sub(now_ms);
            return Err(EngineError::RateLimited {
                retry_after_secs: remaining_ms.div_ceil(1_000),
            });
        }
        Ok(())
    }

    /// Number of live (caller, class) windows. Observability only.
    pub fn tracked_windows(&self) -> usize {
        self.windows.len()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
