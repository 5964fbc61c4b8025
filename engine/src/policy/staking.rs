//! Staking rate arithmetic: the APY ladder and linear reward accrual.

use chrono::{DateTime, Utc};

use crate::config::{RateConfig, BPS_SCALE};
use crate::ledger::StakingPosition;

/// APY (bps) for a lock duration, from the configured ladder. The
/// ladder is ordered descending by `min_days`; the first band the
/// duration clears wins.
pub fn apy_bps_for_duration(cfg: &RateConfig, duration_days: u32) -> u32 {
    for band in &cfg.apy_schedule {
        if duration_days >= band.min_days {
            return band.apy_bps;
        }
    }
    // An empty or gapless-at-zero ladder shouldn't happen; accrue
    // nothing rather than guess.
    0
}

/// Linear accrual: `amount * apy * days / 365`, with the APY in basis
/// points. Computed in `u128` so principal × rate × days can't overflow.
pub fn accrued_reward(amount: u64, apy_bps: u32, days: u32) -> u64 {
    (u128::from(amount) * u128::from(apy_bps) * u128::from(days)
        / (365 * u128::from(BPS_SCALE))) as u64
}

/// Whole days a position has been accruing at `now`, capped at the
/// agreed duration — accrual stops at maturity.
pub fn accrual_days(position: &StakingPosition, now: DateTime<Utc>) -> u32 {
    let elapsed = (now - position.start_date).num_days().max(0) as u32;
    elapsed.min(position.duration_days)
}
