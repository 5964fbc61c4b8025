//! # The Ledger
//!
//! Wallets, transactions, staking positions, and the durable store that
//! mutates them. The records here are the system of record for every
//! balance; nothing outside [`store::LedgerStore`] writes them, and the
//! store itself only writes through atomic units.

pub mod staking;
pub mod store;
pub mod transaction;
pub mod wallet;

pub use staking::{PositionStatus, StakingPosition};
pub use store::{FinalizeJob, FinalizeKind, LedgerStore, LedgerUpdate, WalletEffect, WalletRef};
pub use transaction::{Currency, StatusChange, Transaction, TransactionKind, TransactionStatus};
pub use wallet::Wallet;
