//! # Settlement
//!
//! The reserve → finalize (or reserve → compensate) machinery: the
//! engine that owns every operation state machine, the payout-rail
//! boundary, and the durable finalize worker.

pub mod engine;
pub mod rail;
pub mod worker;

pub use engine::{
    ClaimReceipt, DepositInitiation, DepositReceipt, EngineStatus, PaymentInstructions,
    ResetReport, SettlementEngine, StakeReceipt, SweepReport, TransferReceipt, UnstakeReceipt,
    WalletView, WithdrawalInitiation,
};
pub use rail::{DirectRail, MockRail, PayoutOutcome, PayoutRail, PayoutRequest};
pub use worker::FinalizeWorker;
