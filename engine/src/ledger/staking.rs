//! Staking position records.
//!
//! A position is created when a stake reserves wallet funds and stays
//! `Active` until unstaked. Rewards accrue linearly against the position's
//! APY (fixed at creation from the duration ladder) and are tracked via
//! `rewards_claimed` so repeated claims only ever pay the delta. The
//! accrual arithmetic itself lives in [`crate::policy::staking`] — this
//! module is just the record.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle status of a staking position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Funds are locked and accruing rewards.
    Active,
    /// Unstaked. Terminal; no further accrual or claims.
    Completed,
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

/// A staked principal with its fixed terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakingPosition {
    /// Unique position identifier.
    pub id: String,
    /// Owning user.
    pub user_id: String,
    /// Staked principal in KEL minor units. Held frozen in the wallet
    /// for the life of the position.
    pub amount: u64,
    /// Agreed lock duration in days.
    pub duration_days: u32,
    /// APY in basis points, fixed at creation from the duration ladder.
    pub apy_bps: u32,
    /// When accrual starts.
    pub start_date: DateTime<Utc>,
    /// Maturity. Unstaking before this date pays an early-exit penalty.
    pub end_date: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: PositionStatus,
    /// Total rewards already credited to the wallet, in minor units.
    pub rewards_claimed: u64,
}

impl StakingPosition {
    /// Opens a new active position starting now.
    pub fn open(user_id: &str, amount: u64, duration_days: u32, apy_bps: u32) -> Self {
        let start = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            amount,
            duration_days,
            apy_bps,
            start_date: start,
            end_date: start + Duration::days(i64::from(duration_days)),
            status: PositionStatus::Active,
            rewards_claimed: 0,
        }
    }

    /// `true` once the lock period has elapsed.
    pub fn matured(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_date
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_sets_terms() {
        let pos = StakingPosition::open("alice", 500_00, 90, 800);
        assert_eq!(pos.status, PositionStatus::Active);
        assert_eq!(pos.rewards_claimed, 0);
        assert_eq!(pos.end_date - pos.start_date, Duration::days(90));
    }

    #[test]
    fn maturity_check() {
        let pos = StakingPosition::open("alice", 500_00, 30, 600);
        assert!(!pos.matured(pos.start_date + Duration::days(29)));
        assert!(pos.matured(pos.start_date + Duration::days(30)));
    }

    #[test]
    fn serde_roundtrip() {
        let pos = StakingPosition::open("alice", 500_00, 365, 1200);
        let json = serde_json::to_string(&pos).unwrap();
        let back: StakingPosition = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, pos.id);
        assert_eq!(back.apy_bps, 1200);
    }
}
