//! Transaction records and their per-kind state machines.
//!
//! Every ledger-affecting operation produces exactly one [`Transaction`].
//! A transaction is created at reservation time in a `Pending*` status and
//! transitions exactly once into a terminal status. Terminal records are
//! immutable: re-applying the same terminal status is a no-op, anything
//! else is a [`Conflict`](crate::error::EngineError::Conflict).
//!
//! The legal transitions are per kind:
//!
//! | Kind        | Lifecycle                                        |
//! |-------------|--------------------------------------------------|
//! | Deposit     | `PendingPayment` → `Completed` \| `Cancelled`    |
//! | Withdrawal  | `PendingWithdrawal` → `Completed` \| `Failed`    |
//! | Transfer    | `Pending` → `Confirmed` \| `Failed`              |
//! | all others  | created terminal (`Completed`), no transitions   |
//!
//! "All others" covers fee realizations, fee refunds, and the staking
//! family — those settle instantly because the funds never leave the
//! system mid-flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Currency
// ---------------------------------------------------------------------------

/// Currency denominations the ledger understands.
///
/// All engine-internal balances are denominated in [`Currency::Kel`].
/// Fiat shows up only on the deposit boundary, where amounts are
/// converted before they ever touch a wallet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Currency {
    /// KEL, the internal unit (smallest unit: 10^-2).
    Kel,
    /// Thai Baht (smallest unit: satang, 10^-2).
    Thb,
    /// Arbitrary ticker for non-standard assets.
    Custom(String),
}

impl Currency {
    /// Decimal places for display formatting. The ledger itself always
    /// operates on integer minor units.
    pub fn decimals(&self) -> u8 {
        match self {
            Self::Kel | Self::Thb => 2,
            Self::Custom(_) => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kel => write!(f, "KEL"),
            Self::Thb => write!(f, "THB"),
            Self::Custom(ticker) => write!(f, "{}", ticker),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionKind
// ---------------------------------------------------------------------------

/// Discriminant for the operation a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    /// Inbound fiat deposit converting to KEL.
    Deposit,
    /// Outbound payout through the crypto rail.
    Withdrawal,
    /// Internal user-to-user transfer.
    Transfer,
    /// A realized fee or commission.
    Fee,
    /// Reversal of a previously realized fee during compensation.
    FeeRefund,
    /// Funds relabeled into a staking position.
    Stake,
    /// Principal returned from a staking position.
    Unstake,
    /// Staking rewards credited to the wallet.
    RewardClaim,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deposit => write!(f, "Deposit"),
            Self::Withdrawal => write!(f, "Withdrawal"),
            Self::Transfer => write!(f, "Transfer"),
            Self::Fee => write!(f, "Fee"),
            Self::FeeRefund => write!(f, "FeeRefund"),
            Self::Stake => write!(f, "Stake"),
            Self::Unstake => write!(f, "Unstake"),
            Self::RewardClaim => write!(f, "RewardClaim"),
        }
    }
}

// ---------------------------------------------------------------------------
// TransactionStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Deposit created, awaiting fiat payment confirmation.
    PendingPayment,
    /// Withdrawal reserved, awaiting the payout rail.
    PendingWithdrawal,
    /// Transfer reserved, awaiting confirmation.
    Pending,
    /// Terminal: executed successfully.
    Completed,
    /// Terminal: transfer confirmed and recipient credited.
    Confirmed,
    /// Terminal: rejected or compensated after a reservation.
    Failed,
    /// Terminal: abandoned before any funds moved (stale deposits).
    Cancelled,
}

impl TransactionStatus {
    /// `true` for statuses from which no further transition occurs.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Confirmed | Self::Failed | Self::Cancelled
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PendingPayment => write!(f, "PendingPayment"),
            Self::PendingWithdrawal => write!(f, "PendingWithdrawal"),
            Self::Pending => write!(f, "Pending"),
            Self::Completed => write!(f, "Completed"),
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

// ---------------------------------------------------------------------------
// Transaction
// ---------------------------------------------------------------------------

/// A single ledger-affecting operation.
///
/// The `id` doubles as the idempotency key: the store inserts each id
/// exactly once, and finalize steps keyed by it are safe to run more
/// than once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier (UUID v4 for system-generated records).
    pub id: String,
    /// Debited user, when one exists (deposits have none).
    pub from_user: Option<String>,
    /// Credited user, when one exists (withdrawals have none).
    pub to_user: Option<String>,
    /// Principal amount in minor units of `currency`.
    pub amount: u64,
    /// Fee attached to this operation, in KEL minor units.
    pub fee: u64,
    /// Denomination of `amount`.
    pub currency: Currency,
    /// What this transaction does.
    pub kind: TransactionKind,
    /// Where it is in its lifecycle.
    pub status: TransactionStatus,
    /// Free-form annotation (failure reasons, payment references).
    pub note: Option<String>,
    /// Receiving bank account a deposit was routed to.
    pub receiving_account: Option<String>,
    /// Destination address for withdrawals.
    pub destination: Option<String>,
    /// Net amount that actually settled (credited or paid out), recorded
    /// at terminal time so idempotent replays can answer without
    /// recomputing against possibly-changed rates.
    pub settled_amount: Option<u64>,
    /// When the record was created (reservation time).
    pub created_at: DateTime<Utc>,
    /// When the record reached a terminal status.
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// A fiat deposit awaiting payment.
    pub fn deposit(id: String, user_id: &str, fiat_amount: u64, account_id: &str) -> Self {
        Self {
            id,
            from_user: None,
            to_user: Some(user_id.to_string()),
            amount: fiat_amount,
            fee: 0,
            currency: Currency::Thb,
            kind: TransactionKind::Deposit,
            status: TransactionStatus::PendingPayment,
            note: None,
            receiving_account: Some(account_id.to_string()),
            destination: None,
            settled_amount: None,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// A crypto withdrawal awaiting the payout rail.
    pub fn withdrawal(id: String, user_id: &str, amount: u64, fee: u64, destination: &str) -> Self {
        Self {
            id,
            from_user: Some(user_id.to_string()),
            to_user: None,
            amount,
            fee,
            currency: Currency::Kel,
            kind: TransactionKind::Withdrawal,
            status: TransactionStatus::PendingWithdrawal,
            note: None,
            receiving_account: None,
            destination: Some(destination.to_string()),
            settled_amount: None,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// An internal transfer awaiting confirmation.
    pub fn transfer(
        id: String,
        from_user: &str,
        to_user: &str,
        amount: u64,
        fee: u64,
        note: Option<String>,
    ) -> Self {
        Self {
            id,
            from_user: Some(from_user.to_string()),
            to_user: Some(to_user.to_string()),
            amount,
            fee,
            currency: Currency::Kel,
            kind: TransactionKind::Transfer,
            status: TransactionStatus::Pending,
            note,
            receiving_account: None,
            destination: None,
            settled_amount: None,
            created_at: Utc::now(),
            confirmed_at: None,
        }
    }

    /// An instantly settled record: fees, fee refunds, and the staking
    /// family. Created terminal.
    pub fn settled(
        id: String,
        kind: TransactionKind,
        from_user: Option<&str>,
        to_user: Option<&str>,
        amount: u64,
        fee: u64,
        note: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            from_user: from_user.map(str::to_string),
            to_user: to_user.map(str::to_string),
            amount,
            fee,
            currency: Currency::Kel,
            kind,
            status: TransactionStatus::Completed,
            note,
            receiving_account: None,
            destination: None,
            settled_amount: Some(amount),
            created_at: now,
            confirmed_at: Some(now),
        }
    }

    /// Whether `to` is a legal next status for this transaction.
    pub fn can_transition(&self, to: TransactionStatus) -> bool {
        use TransactionKind as K;
        use TransactionStatus as S;
        match (self.kind, self.status, to) {
            (K::Deposit, S::PendingPayment, S::Completed | S::Cancelled) => true,
            (K::Withdrawal, S::PendingWithdrawal, S::Completed | S::Failed) => true,
            (K::Transfer, S::Pending, S::Confirmed | S::Failed) => true,
            _ => false,
        }
    }

    /// Applies a status change, enforcing the transition table.
    ///
    /// Re-applying the terminal status the record already holds is a
    /// no-op — unless the change is [`strict`](StatusChange::strict),
    /// in which case it is a `Conflict`. Strict changes gate atomic
    /// units that carry balance effects: when two racing finalizes both
    /// read a pending transaction, only the first may apply its
    /// settlement; the loser's whole unit must abort, not silently
    /// re-run its wallet effects behind a no-op transition.
    ///
    /// Any other transition out of a terminal status, or a transition
    /// not in the per-kind table, is a `Conflict`.
    pub fn apply_change(&mut self, change: &StatusChange, now: DateTime<Utc>) -> EngineResult<()> {
        if self.status == change.status && self.status.is_terminal() {
            if change.require_transition {
                return Err(EngineError::Conflict(format!(
                    "{} {} already settled as {}",
                    self.kind, self.id, self.status
                )));
            }
            return Ok(());
        }
        if !self.can_transition(change.status) {
            return Err(EngineError::Conflict(format!(
                "illegal transition for {} {}: {} -> {}",
                self.kind, self.id, self.status, change.status
            )));
        }
        self.status = change.status;
        if change.status.is_terminal() {
            self.confirmed_at = Some(now);
        }
        if let Some(note) = &change.note {
            self.note = Some(note.clone());
        }
        if let Some(settled) = change.settled_amount {
            self.settled_amount = Some(settled);
        }
        if let Some(fee) = change.fee {
            self.fee = fee;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StatusChange
// ---------------------------------------------------------------------------

/// A requested status transition, carried inside an atomic ledger update.
#[derive(Debug, Clone)]
pub struct StatusChange {
    /// Transaction to transition.
    pub tx_id: String,
    /// Target status.
    pub status: TransactionStatus,
    /// Optional annotation (failure reason, rail reference).
    pub note: Option<String>,
    /// Net settled amount to record at terminal time.
    pub settled_amount: Option<u64>,
    /// Fee to record at terminal time (deposits learn their fee at
    /// confirmation, not creation).
    pub fee: Option<u64>,
    /// When set, a matching-terminal replay is a `Conflict` instead of
    /// a no-op. Used by atomic units whose balance effects must apply
    /// at most once.
    pub require_transition: bool,
}

impl StatusChange {
    /// A bare transition with no extra fields.
    pub fn to(tx_id: &str, status: TransactionStatus) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            status,
            note: None,
            settled_amount: None,
            fee: None,
            require_transition: false,
        }
    }

    /// Demand a real transition (abort the unit on a terminal replay).
    pub fn strict(mut self) -> Self {
        self.require_transition = true;
        self
    }

    /// Attach a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    /// Attach the net settled amount.
    pub fn with_settled(mut self, settled: u64) -> Self {
        self.settled_amount = Some(settled);
        self
    }

    /// Attach the realized fee.
    pub fn with_fee(mut self, fee: u64) -> Self {
        self.fee = Some(fee);
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
