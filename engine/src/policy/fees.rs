//! Fee computation: deposit commission, tiered withdrawal fees, and the
//! transfer-family rate table.
//!
//! All amounts are KEL minor units unless a name says fiat; all rates
//! are basis points. Intermediate products go through `u128` so a large
//! balance times a rate can't overflow.

use crate::config::{RateConfig, BPS_SCALE, RATE_SCALE};

/// Which proportional rate applies to an internal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferKind {
    Transfer,
    Exchange,
    Stake,
    Unstake,
}

/// `amount * bps / 10_000`, rounded down.
fn bps_of(amount: u64, bps: u32) -> u64 {
    (u128::from(amount) * u128::from(bps) / u128::from(BPS_SCALE)) as u64
}

/// Converts a fiat THB amount (satang) into KEL minor units at the
/// configured exchange rate.
pub fn kel_from_fiat(cfg: &RateConfig, fiat_minor: u64) -> u64 {
    (u128::from(fiat_minor) * u128::from(RATE_SCALE) / u128::from(cfg.thb_per_kel.max(1))) as u64
}

/// Deposit commission on the gross converted amount.
pub fn deposit_fee(cfg: &RateConfig, gross: u64) -> u64 {
    bps_of(gross, cfg.deposit_commission_bps)
}

/// Tiered withdrawal fee: flat per tier, proportional above the last
/// tier.
pub fn withdrawal_fee(cfg: &RateConfig, amount: u64) -> u64 {
    for tier in &cfg.withdrawal_tiers {
        if amount <= tier.up_to {
            return tier.fee;
        }
    }
    bps_of(amount, cfg.withdrawal_over_bps)
}

/// The flat protocol fee added on the quick-withdraw path, on top of the
/// tiered fee.
pub fn quick_withdraw_fee(cfg: &RateConfig, amount: u64) -> u64 {
    bps_of(amount, cfg.quick_withdraw_bps)
}

/// Proportional fee for the transfer family, with the configured floor.
pub fn transfer_fee(cfg: &RateConfig, amount: u64, kind: TransferKind) -> u64 {
    let bps = match kind {
        TransferKind::Transfer => cfg.transfer_fees.transfer_bps,
        TransferKind::Exchange => cfg.transfer_fees.exchange_bps,
        TransferKind::Stake => cfg.transfer_fees.stake_bps,
        TransferKind::Unstake => cfg.transfer_fees.unstake_bps,
    };
    if bps == 0 {
        return 0;
    }
    bps_of(amount, bps).max(cfg.transfer_fee_floor)
}
