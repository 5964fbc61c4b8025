//! # Receiving-Account Allocator
//!
//! Decides which fiat bank account absorbs an incoming deposit. The pool
//! lives in the [`AccountPool`](crate::config::AccountPool) configuration
//! record; selection runs inside that record's read-modify-write, so the
//! chosen account's daily total is incremented in the same operation that
//! returns the choice — two concurrent deposits can never both squeeze
//! past the same account's remaining capacity.
//!
//! Candidates are active accounts whose cap survives the deposit
//! (`current_daily_total + amount <= daily_limit`). Each candidate is
//! scored on four weighted signals and the highest score wins, ties
//! broken by pool order (stable, so the result is deterministic):
//!
//! ```text
//! score = 0.45 * capacity_ratio      // headroom fraction
//!       + 0.15 * (1 - utilization)   // inverse fill level
//!       + 0.25 * priority_norm       // operator preference
//!       + 0.15 * reliability         // confirmed / routed history
//! ```
//!
//! The capacity weight dominates priority on purpose: a nearly full
//! high-priority account should lose to a nearly empty low-priority one,
//! spreading load instead of hammering the operator's favourite until it
//! caps out.

use std::sync::Arc;

use crate::config::{AccountStatus, ConfigStore, ReceivingAccount};
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

/// Scores one candidate. `max_priority` is the highest priority among
/// all candidates (minimum 1 to keep the division meaningful).
pub fn score_account(account: &ReceivingAccount, max_priority: u32) -> f64 {
    let limit = account.daily_limit.max(1) as f64;
    let total = account.current_daily_total as f64;

    let capacity_ratio = ((limit - total).max(0.0)) / limit;
    let utilization = total / limit;
    let priority_norm = f64::from(account.priority) / f64::from(max_priority.max(1));
    let history = account.success_count + account.failure_count;
    let reliability = if history == 0 {
        1.0
    } else {
        account.success_count as f64 / history as f64
    };

    0.45 * capacity_ratio + 0.15 * (1.0 - utilization) + 0.25 * priority_norm + 0.15 * reliability
}

fn is_candidate(account: &ReceivingAccount, amount: u64) -> bool {
    account.status == AccountStatus::Active
        && account
            .current_daily_total
            .checked_add(amount)
            .is_some_and(|t| t <= account.daily_limit)
}

// ---------------------------------------------------------------------------
// Allocator
// ---------------------------------------------------------------------------

/// Selection and lifecycle operations over the receiving-account pool.
pub struct Allocator {
    config: Arc<ConfigStore>,
}

impl Allocator {
    pub fn new(config: Arc<ConfigStore>) -> Self {
        Self { config }
    }

    /// Picks the account for a deposit of `amount` (THB minor units) and
    /// increments its daily total atomically with the selection.
    ///
    /// Fails with `CapacityExhausted` when no active account can absorb
    /// the amount within its daily cap.
    pub fn select(&self, amount: u64) -> EngineResult<ReceivingAccount> {
        self.config.update_pool(|pool| {
            let candidates: Vec<usize> = pool
                .accounts
                .iter()
                .enumerate()
                .filter(|(_, a)| is_candidate(a, amount))
                .map(|(i, _)| i)
                .collect();
            if candidates.is_empty() {
                return Err(EngineError::CapacityExhausted);
            }

            let max_priority = candidates
                .iter()
                .map(|&i| pool.accounts[i].priority)
                .max()
                .unwrap_or(1);

            let mut best = candidates[0];
            let mut best_score = score_account(&pool.accounts[best], max_priority);
            for &i in &candidates[1..] {
                let s = score_account(&pool.accounts[i], max_priority);
                if s > best_score {
                    best = i;
                    best_score = s;
                }
            }

            let chosen = &mut pool.accounts[best];
            chosen.current_daily_total += amount;
            Ok(chosen.clone())
        })
    }

    /// Compensating decrement for a selection whose deposit record never
    /// landed. Saturating: a reset in between must not underflow.
    pub fn release(&self, account_id: &str, amount: u64) -> EngineResult<()> {
        self.config.update_pool(|pool| {
            if let Some(account) = pool
                .accounts
                .iter_mut()
                .find(|a| a.account_id == account_id)
            {
                account.current_daily_total = account.current_daily_total.saturating_sub(amount);
            }
            Ok(())
        })
    }

    /// Records a confirmed (success) or cancelled-unpaid (failure)
    /// deposit against the account's reliability history.
    pub fn record_outcome(&self, account_id: &str, success: bool) -> EngineResult<()> {
        self.config.update_pool(|pool| {
            if let Some(account) = pool
                .accounts
                .iter_mut()
                .find(|a| a.account_id == account_id)
            {
                if success {
                    account.success_count += 1;
                } else {
                    account.failure_count += 1;
                }
            }
            Ok(())
        })
    }

    /// Zeroes every account's daily total. Idempotent: running it twice
    /// in a day is safe, the second run just finds nothing to clear.
    /// Returns the number of accounts whose total actually changed.
    pub fn daily_reset(&self) -> EngineResult<usize> {
        self.config.update_pool(|pool| {
            let mut cleared = 0;
            for account in &mut pool.accounts {
                if account.current_daily_total != 0 {
                    account.current_daily_total = 0;
                    cleared += 1;
                }
            }
            pool.last_reset_on = Some(chrono::Utc::now().date_naive());
            Ok(cleared)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
