//! # Fee & Rate Policy
//!
//! Pure arithmetic over the live [`RateConfig`](crate::config::RateConfig).
//! Nothing here touches storage, the clock, or a wallet — given the same
//! inputs these functions always return the same money.

pub mod fees;
pub mod staking;
