//! # Settlement Engine
//!
//! The orchestrator. Every operation follows the same spine:
//!
//! 1. validate input — no side effects before this passes;
//! 2. consult the rate limiter (fail open on anything but a real limit);
//! 3. execute one atomic ledger unit (reservation + records + durable
//!    finalize job);
//! 4. answer the caller;
//! 5. for operations with asynchronous completion, the finalize worker
//!    drives the reservation to a terminal status later — settling on
//!    success, compensating on failure.
//!
//! The compensation rule is absolute: a failure after a reservation must
//! refund before it surfaces. An engine that leaves funds frozen with no
//! path to a terminal status has lost money, not hit an edge case.

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::allocator::Allocator;
use crate::config::{AccountStatus, ConfigStore, RateConfig, RateUpdate, ReceivingAccount};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{
    Currency, FinalizeJob, FinalizeKind, LedgerStore, LedgerUpdate, PositionStatus, StakingPosition,
    StatusChange, Transaction, TransactionKind, TransactionStatus, Wallet, WalletEffect, WalletRef,
};
use crate::limiter::{OperationClass, RateLimiter};
use crate::policy::{fees, staking};

use super::rail::{PayoutOutcome, PayoutRail, PayoutRequest};
use super::worker::FinalizeWorker;

// ---------------------------------------------------------------------------
// Operation results
// ---------------------------------------------------------------------------

/// Where and how to pay for an initiated deposit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentInstructions {
    /// Receiving bank account to pay into.
    pub account_id: String,
    /// Reference the payer must attach (the deposit id).
    pub reference: String,
    /// Fiat amount due, THB minor units.
    pub amount: u64,
}

/// Result of [`SettlementEngine::initiate_deposit`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositInitiation {
    pub deposit_id: String,
    pub payment: PaymentInstructions,
}

/// Result of [`SettlementEngine::confirm_deposit`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepositReceipt {
    /// KEL minor units credited to the wallet.
    pub credited: u64,
    /// Commission realized, KEL minor units.
    pub fee: u64,
}

/// Result of [`SettlementEngine::initiate_withdrawal`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalInitiation {
    pub withdrawal_id: String,
    /// Amount the rail will pay out (principal net of fee).
    pub net_amount: u64,
    pub fee: u64,
}

/// Result of [`SettlementEngine::transfer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub transaction_id: String,
}

/// Result of [`SettlementEngine::stake`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StakeReceipt {
    pub staking_id: String,
    pub apy_bps: u32,
}

/// Result of [`SettlementEngine::unstake`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnstakeReceipt {
    /// Principal returned to the balance, net of any penalty.
    pub principal_returned: u64,
    /// Unclaimed rewards credited alongside.
    pub rewards_claimed: u64,
    /// Early-exit penalty withheld.
    pub penalty: u64,
}

/// Result of [`SettlementEngine::claim_rewards`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClaimReceipt {
    pub claimed: u64,
}

/// Result of [`SettlementEngine::daily_reset`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResetReport {
    pub accounts_reset: usize,
}

/// Result of [`SettlementEngine::sweep_stale`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SweepReport {
    /// Unpaid deposits driven to `Cancelled`.
    pub cancelled_deposits: usize,
    /// Reservations whose finalize job was re-enqueued.
    pub requeued_finalizes: usize,
}

/// A wallet as callers see it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletView {
    pub user_id: String,
    pub currency: String,
    pub balance: u64,
    pub frozen_balance: u64,
    pub available: u64,
    pub address: String,
    pub active: bool,
}

impl From<Wallet> for WalletView {
    fn from(w: Wallet) -> Self {
        let available = w.available();
        Self {
            user_id: w.user_id,
            currency: w.currency.to_string(),
            balance: w.balance,
            frozen_balance: w.frozen_balance,
            available,
            address: w.address,
            active: w.active,
        }
    }
}

/// Engine counters for status reporting.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EngineStatus {
    pub wallets: usize,
    pub transactions: usize,
    pub pending_finalize: usize,
    pub rates_version: u64,
    pub pool_version: u64,
}

// ---------------------------------------------------------------------------
// SettlementEngine
// ---------------------------------------------------------------------------

/// The wallet ledger's only writer and the owner of every operation
/// state machine.
pub struct SettlementEngine {
    store: Arc<LedgerStore>,
    config: Arc<ConfigStore>,
    allocator: Allocator,
    limiter: RateLimiter,
    rail: Arc<dyn PayoutRail>,
    /// Feed to the finalize worker. Taken on shutdown so the worker can
    /// drain and exit.
    jobs: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl SettlementEngine {
    /// Wires an engine and its finalize worker. Spawn the worker with
    /// [`FinalizeWorker::spawn`]; tests may skip it and drive
    /// [`finalize`](Self::finalize) directly.
    pub fn new(
        store: Arc<LedgerStore>,
        config: Arc<ConfigStore>,
        rail: Arc<dyn PayoutRail>,
    ) -> (Arc<Self>, FinalizeWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(Self {
            store,
            allocator: Allocator::new(Arc::clone(&config)),
            config,
            limiter: RateLimiter::new(),
            rail,
            jobs: Mutex::new(Some(tx)),
        });
        let worker = FinalizeWorker::new(Arc::clone(&engine), rx);
        (engine, worker)
    }

    /// Direct access to the ledger store (status endpoints, tests).
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Stops feeding the finalize worker; already-queued jobs drain.
    pub fn shutdown(&self) {
        self.jobs.lock().take();
    }

    fn enqueue_finalize(&self, tx_id: &str) {
        if let Some(sender) = self.jobs.lock().as_ref() {
            // A closed channel only means no worker is running; the
            // durable job record still gets picked up by recovery.
            let _ = sender.send(tx_id.to_string());
        }
    }

    /// Rate-limit gate. Only a real `RateLimited` blocks the caller;
    /// any other limiter failure is logged and allowed through.
    fn check_rate(&self, caller: &str, class: OperationClass, rates: &RateConfig) -> EngineResult<()> {
        match self.limiter.check(caller, class, rates.limits.policy_for(class)) {
            Ok(()) => Ok(()),
            Err(e @ EngineError::RateLimited { .. }) => Err(e),
            Err(other) => {
                tracing::warn!(caller, %class, error = %other, "rate limiter unavailable, failing open");
                Ok(())
            }
        }
    }

    // -- Deposits ------------------------------------------------------------

    /// Routes a fiat deposit to a receiving account and records it as
    /// `PendingPayment`.
    pub fn initiate_deposit(&self, user_id: &str, amount: u64) -> EngineResult<DepositInitiation> {
        validate_user(user_id)?;
        validate_amount(amount)?;
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Deposit, &rates)?;

        self.store.ensure_wallet(user_id, Currency::Kel)?;
        let account = self.allocator.select(amount)?;

        let deposit_id = Uuid::new_v4().to_string();
        let tx = Transaction::deposit(deposit_id.clone(), user_id, amount, &account.account_id);
        if let Err(e) = self.store.apply(&LedgerUpdate::new().insert_tx(tx)) {
            // The selection already consumed capacity; give it back
            // before surfacing the failure.
            if let Err(release_err) = self.allocator.release(&account.account_id, amount) {
                tracing::error!(
                    account = %account.account_id,
                    error = %release_err,
                    "failed to release allocator capacity after aborted deposit"
                );
            }
            return Err(e);
        }

        tracing::info!(user_id, deposit_id = %deposit_id, amount, account = %account.account_id, "deposit initiated");
        Ok(DepositInitiation {
            payment: PaymentInstructions {
                account_id: account.account_id,
                reference: deposit_id.clone(),
                amount,
            },
            deposit_id,
        })
    }

    /// Confirms a paid deposit: converts, takes commission, credits the
    /// wallet. Idempotent — confirming an already-completed deposit
    /// returns the original receipt without crediting again.
    pub fn confirm_deposit(
        &self,
        deposit_id: &str,
        user_id: &str,
        amount: u64,
    ) -> EngineResult<DepositReceipt> {
        validate_user(user_id)?;
        validate_amount(amount)?;
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Deposit, &rates)?;

        let tx = self
            .store
            .transaction_opt(deposit_id)?
            .filter(|t| t.kind == TransactionKind::Deposit)
            .filter(|t| t.to_user.as_deref() == Some(user_id))
            .ok_or_else(|| EngineError::NotFound(format!("pending deposit {deposit_id}")))?;

        match tx.status {
            TransactionStatus::Completed => {
                // Exactly-once: replay answers from the stored record.
                return Ok(DepositReceipt {
                    credited: tx.settled_amount.unwrap_or(0),
                    fee: tx.fee,
                });
            }
            TransactionStatus::PendingPayment => {}
            _ => return Err(EngineError::NotFound(format!("pending deposit {deposit_id}"))),
        }

        let gross = fees::kel_from_fiat(&rates, amount);
        let fee = fees::deposit_fee(&rates, gross);
        let credited = gross.saturating_sub(fee);

        let mut update = LedgerUpdate::new()
            .wallet(WalletRef::kel(user_id), WalletEffect::Credit { amount: credited })
            .change_status(
                StatusChange::to(deposit_id, TransactionStatus::Completed)
                    .with_settled(credited)
                    .with_fee(fee)
                    .strict(),
            );
        if fee > 0 {
            update = update.insert_tx(Transaction::settled(
                format!("{deposit_id}:fee"),
                TransactionKind::Fee,
                Some(user_id),
                None,
                fee,
                0,
                Some("deposit commission".into()),
            ));
        }
        self.store.apply(&update)?;

        if let Some(account_id) = &tx.receiving_account {
            self.allocator.record_outcome(account_id, true)?;
        }

        tracing::info!(user_id, deposit_id, credited, fee, "deposit confirmed");
        Ok(DepositReceipt { credited, fee })
    }

    // -- Withdrawals ---------------------------------------------------------

    /// Reserves a crypto withdrawal and schedules its finalize step.
    ///
    /// The principal is reserved and the fee realized immediately (the
    /// balance drops by `amount + fee`, `amount` of it frozen); the rail
    /// is paid `amount - fee` when the job settles. Compensation on a
    /// rejected payout restores both principal and fee exactly.
    pub fn initiate_withdrawal(
        &self,
        user_id: &str,
        amount: u64,
        destination: &str,
        quick: bool,
    ) -> EngineResult<WithdrawalInitiation> {
        validate_user(user_id)?;
        validate_amount(amount)?;
        if destination.trim().is_empty() {
            return Err(EngineError::validation("destination address is required"));
        }
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Withdrawal, &rates)?;

        let mut fee = fees::withdrawal_fee(&rates, amount);
        if quick {
            fee += fees::quick_withdraw_fee(&rates, amount);
        }
        if fee >= amount {
            return Err(EngineError::validation(format!(
                "amount {amount} does not cover the withdrawal fee {fee}"
            )));
        }
        let net = amount - fee;

        let wallet = self.store.wallet(user_id, &Currency::Kel)?;
        if !wallet.active {
            return Err(EngineError::validation("wallet is deactivated"));
        }

        let withdrawal_id = Uuid::new_v4().to_string();
        let mut update = LedgerUpdate::new()
            .wallet(WalletRef::kel(user_id), WalletEffect::Reserve { amount, fee: 0 })
            .wallet(WalletRef::kel(user_id), WalletEffect::Charge { amount: fee })
            .insert_tx(Transaction::withdrawal(
                withdrawal_id.clone(),
                user_id,
                amount,
                fee,
                destination,
            ))
            .enqueue(FinalizeJob::new(&withdrawal_id, FinalizeKind::Withdrawal));
        if fee > 0 {
            update = update.insert_tx(Transaction::settled(
                format!("{withdrawal_id}:fee"),
                TransactionKind::Fee,
                Some(user_id),
                None,
                fee,
                0,
                Some("withdrawal fee".into()),
            ));
        }
        self.store.apply(&update)?;
        self.enqueue_finalize(&withdrawal_id);

        tracing::info!(user_id, withdrawal_id = %withdrawal_id, amount, fee, net, "withdrawal reserved");
        Ok(WithdrawalInitiation {
            withdrawal_id,
            net_amount: net,
            fee,
        })
    }

    // -- Transfers -----------------------------------------------------------

    /// Reserves an internal transfer and schedules its confirmation.
    pub fn transfer(
        &self,
        from_user: &str,
        to_user: &str,
        amount: u64,
        note: Option<String>,
    ) -> EngineResult<TransferReceipt> {
        validate_user(from_user)?;
        validate_amount(amount)?;
        if to_user.trim().is_empty() {
            return Err(EngineError::validation("recipient is required"));
        }
        if from_user == to_user {
            return Err(EngineError::validation("cannot transfer to yourself"));
        }
        let rates = self.config.rates();
        self.check_rate(from_user, OperationClass::Transfer, &rates)?;

        let recipient = self
            .store
            .wallet_opt(to_user, &Currency::Kel)?
            .filter(|w| w.active)
            .ok_or_else(|| EngineError::NotFound(format!("recipient {to_user}")))?;

        let sender = self.store.wallet(from_user, &Currency::Kel)?;
        if !sender.active {
            return Err(EngineError::validation("wallet is deactivated"));
        }

        let fee = fees::transfer_fee(&rates, amount, fees::TransferKind::Transfer);
        let transaction_id = Uuid::new_v4().to_string();
        self.store.apply(
            &LedgerUpdate::new()
                .wallet(WalletRef::kel(from_user), WalletEffect::Reserve { amount, fee })
                .insert_tx(Transaction::transfer(
                    transaction_id.clone(),
                    from_user,
                    &recipient.user_id,
                    amount,
                    fee,
                    note,
                ))
                .enqueue(FinalizeJob::new(&transaction_id, FinalizeKind::Transfer)),
        )?;
        self.enqueue_finalize(&transaction_id);

        tracing::info!(from_user, to_user, transaction_id = %transaction_id, amount, fee, "transfer reserved");
        Ok(TransferReceipt { transaction_id })
    }

    // -- Staking -------------------------------------------------------------

    /// Locks funds into a staking position. Settles instantly: the
    /// funds stay in the system, merely relabeled as frozen.
    pub fn stake(&self, user_id: &str, amount: u64, duration_days: u32) -> EngineResult<StakeReceipt> {
        validate_user(user_id)?;
        validate_amount(amount)?;
        if duration_days == 0 {
            return Err(EngineError::validation("duration must be at least one day"));
        }
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Staking, &rates)?;

        let wallet = self.store.wallet(user_id, &Currency::Kel)?;
        if !wallet.active {
            return Err(EngineError::validation("wallet is deactivated"));
        }

        let apy_bps = staking::apy_bps_for_duration(&rates, duration_days);
        let position = StakingPosition::open(user_id, amount, duration_days, apy_bps);
        let staking_id = position.id.clone();
        self.store.apply(
            &LedgerUpdate::new()
                .wallet(WalletRef::kel(user_id), WalletEffect::Reserve { amount, fee: 0 })
                .insert_position(position)
                .insert_tx(Transaction::settled(
                    Uuid::new_v4().to_string(),
                    TransactionKind::Stake,
                    Some(user_id),
                    None,
                    amount,
                    0,
                    Some(format!("stake {staking_id} for {duration_days}d")),
                )),
        )?;

        tracing::info!(user_id, staking_id = %staking_id, amount, duration_days, apy_bps, "position opened");
        Ok(StakeReceipt { staking_id, apy_bps })
    }

    /// Closes a position: returns the principal (minus the early-exit
    /// penalty before maturity) and credits any unclaimed rewards.
    pub fn unstake(&self, user_id: &str, staking_id: &str) -> EngineResult<UnstakeReceipt> {
        validate_user(user_id)?;
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Staking, &rates)?;

        let mut position = self.owned_position(user_id, staking_id)?;
        if position.status != PositionStatus::Active {
            return Err(EngineError::Conflict(format!(
                "staking position {staking_id} is already completed"
            )));
        }

        let now = Utc::now();
        let days = staking::accrual_days(&position, now);
        let accrued = staking::accrued_reward(position.amount, position.apy_bps, days);
        let unclaimed = accrued.saturating_sub(position.rewards_claimed);

        let penalty = if position.matured(now) {
            0
        } else {
            (u128::from(position.amount) * u128::from(rates.early_exit_penalty_bps)
                / u128::from(crate::config::BPS_SCALE)) as u64
        };
        let principal_returned = position.amount - penalty;

        position.status = PositionStatus::Completed;
        position.rewards_claimed = position.rewards_claimed.max(accrued);

        let unstake_tx_id = Uuid::new_v4().to_string();
        let mut update = LedgerUpdate::new()
            .wallet(
                WalletRef::kel(user_id),
                WalletEffect::Refund {
                    amount: principal_returned,
                },
            )
            .update_position(position.clone())
            .insert_tx(Transaction::settled(
                unstake_tx_id.clone(),
                TransactionKind::Unstake,
                None,
                Some(user_id),
                position.amount,
                penalty,
                Some(format!("unstake {staking_id} after {days}d")),
            ));
        if penalty > 0 {
            // The penalty portion of the frozen principal leaves for
            // good; it was already deducted from the balance at stake
            // time.
            update = update.wallet(WalletRef::kel(user_id), WalletEffect::Settle { amount: penalty });
        }
        if unclaimed > 0 {
            update = update
                .wallet(WalletRef::kel(user_id), WalletEffect::Credit { amount: unclaimed })
                .insert_tx(Transaction::settled(
                    format!("{unstake_tx_id}:reward"),
                    TransactionKind::RewardClaim,
                    None,
                    Some(user_id),
                    unclaimed,
                    0,
                    Some(format!("final rewards for {staking_id}")),
                ));
        }
        self.store.apply(&update)?;

        tracing::info!(user_id, staking_id, principal_returned, unclaimed, penalty, "position closed");
        Ok(UnstakeReceipt {
            principal_returned,
            rewards_claimed: unclaimed,
            penalty,
        })
    }

    /// Credits rewards accrued since the last claim.
    pub fn claim_rewards(&self, user_id: &str, staking_id: &str) -> EngineResult<ClaimReceipt> {
        validate_user(user_id)?;
        let rates = self.config.rates();
        self.check_rate(user_id, OperationClass::Staking, &rates)?;

        let mut position = self.owned_position(user_id, staking_id)?;
        if position.status != PositionStatus::Active {
            return Err(EngineError::Conflict(format!(
                "staking position {staking_id} is already completed"
            )));
        }

        let days = staking::accrual_days(&position, Utc::now());
        let accrued = staking::accrued_reward(position.amount, position.apy_bps, days);
        let claimable = accrued.saturating_sub(position.rewards_claimed);
        if claimable == 0 {
            return Err(EngineError::validation("no rewards accrued yet"));
        }

        position.rewards_claimed = accrued;
        self.store.apply(
            &LedgerUpdate::new()
                .wallet(WalletRef::kel(user_id), WalletEffect::Credit { amount: claimable })
                .update_position(position)
                .insert_tx(Transaction::settled(
                    Uuid::new_v4().to_string(),
                    TransactionKind::RewardClaim,
                    None,
                    Some(user_id),
                    claimable,
                    0,
                    Some(format!("rewards for {staking_id}")),
                )),
        )?;

        tracing::info!(user_id, staking_id, claimed = claimable, "rewards claimed");
        Ok(ClaimReceipt { claimed: claimable })
    }

    fn owned_position(&self, user_id: &str, staking_id: &str) -> EngineResult<StakingPosition> {
        let position = self.store.position(staking_id)?;
        if position.user_id != user_id {
            return Err(EngineError::NotFound(format!("staking position {staking_id}")));
        }
        Ok(position)
    }

    // -- Finalization --------------------------------------------------------

    /// Drives one pending reservation to a terminal status. Idempotent
    /// and exactly-once-effective: a transaction that is already
    /// terminal only has its job record cleaned up.
    pub async fn finalize(&self, tx_id: &str) -> EngineResult<()> {
        let Some(job) = self.store.job(tx_id)? else {
            return Ok(());
        };
        let Some(tx) = self.store.transaction_opt(tx_id)? else {
            // A job without a transaction should be impossible (they are
            // written in one atomic unit); clean up rather than loop.
            tracing::error!(tx_id, "finalize job has no transaction, dropping");
            self.store.remove_job(tx_id)?;
            return Ok(());
        };
        if tx.status.is_terminal() {
            self.store.remove_job(tx_id)?;
            return Ok(());
        }

        let result = match job.kind {
            FinalizeKind::Withdrawal => self.finalize_withdrawal(&tx).await,
            FinalizeKind::Transfer => self.finalize_transfer(&tx),
        };
        if result.is_err() {
            let mut retry = job;
            retry.attempts += 1;
            self.store.update_job(&retry)?;
        }
        result
    }

    async fn finalize_withdrawal(&self, tx: &Transaction) -> EngineResult<()> {
        let user_id = tx
            .from_user
            .clone()
            .ok_or_else(|| EngineError::internal("withdrawal without a sender"))?;
        let net = tx.amount.saturating_sub(tx.fee);
        let request = PayoutRequest {
            reference: tx.id.clone(),
            destination: tx.destination.clone().unwrap_or_default(),
            amount: net,
            currency: Currency::Kel,
        };

        match self.rail.submit_payout(&request).await {
            Ok(PayoutOutcome::Accepted { rail_reference }) => {
                self.store.apply(
                    &LedgerUpdate::new()
                        .wallet(WalletRef::kel(&user_id), WalletEffect::Settle { amount: tx.amount })
                        .change_status(
                            StatusChange::to(&tx.id, TransactionStatus::Completed)
                                .with_settled(net)
                                .with_note(format!("rail {rail_reference}"))
                                .strict(),
                        )
                        .remove_job(&tx.id),
                )?;
                tracing::info!(user_id, tx_id = %tx.id, net, "withdrawal settled");
                Ok(())
            }
            Ok(PayoutOutcome::Rejected { reason }) => {
                // Compensate before surfacing anything: principal back,
                // fee reversed, exact pre-reservation balances restored.
                let mut update = LedgerUpdate::new()
                    .wallet(WalletRef::kel(&user_id), WalletEffect::Refund { amount: tx.amount })
                    .change_status(
                        StatusChange::to(&tx.id, TransactionStatus::Failed)
                            .with_note(reason.clone())
                            .strict(),
                    )
                    .remove_job(&tx.id);
                if tx.fee > 0 {
                    update = update
                        .wallet(WalletRef::kel(&user_id), WalletEffect::Credit { amount: tx.fee })
                        .insert_tx(Transaction::settled(
                            format!("{}:feerefund", tx.id),
                            TransactionKind::FeeRefund,
                            None,
                            Some(&user_id),
                            tx.fee,
                            0,
                            Some("withdrawal fee reversed".into()),
                        ));
                }
                if let Err(e) = self.store.apply(&update) {
                    // Funds are still frozen. The job stays queued and
                    // will be retried; this must never be dropped.
                    tracing::error!(user_id, tx_id = %tx.id, error = %e, "withdrawal compensation failed, retrying");
                    return Err(e);
                }
                tracing::warn!(user_id, tx_id = %tx.id, reason, "withdrawal rejected, reservation refunded");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(tx_id = %tx.id, error = %e, "payout rail unavailable, will retry");
                Err(e)
            }
        }
    }

    fn finalize_transfer(&self, tx: &Transaction) -> EngineResult<()> {
        let from_user = tx
            .from_user
            .clone()
            .ok_or_else(|| EngineError::internal("transfer without a sender"))?;
        let to_user = tx
            .to_user
            .clone()
            .ok_or_else(|| EngineError::internal("transfer without a recipient"))?;
        let reserved = tx.amount + tx.fee;

        let recipient_active = self
            .store
            .wallet_opt(&to_user, &Currency::Kel)?
            .map(|w| w.active)
            .unwrap_or(false);

        if recipient_active {
            // Sender-side settlement: the frozen principal + fee is
            // extinguished (balance was already debited at reserve
            // time); only the recipient is credited with the principal.
            let mut update = LedgerUpdate::new()
                .wallet(WalletRef::kel(&to_user), WalletEffect::Credit { amount: tx.amount })
                .wallet(WalletRef::kel(&from_user), WalletEffect::Release { amount: reserved })
                .change_status(
                    StatusChange::to(&tx.id, TransactionStatus::Confirmed)
                        .with_settled(tx.amount)
                        .strict(),
                )
                .remove_job(&tx.id);
            if tx.fee > 0 {
                update = update.insert_tx(Transaction::settled(
                    format!("{}:fee", tx.id),
                    TransactionKind::Fee,
                    Some(&from_user),
                    None,
                    tx.fee,
                    0,
                    Some("transfer fee".into()),
                ));
            }
            self.store.apply(&update)?;
            tracing::info!(from_user, to_user, tx_id = %tx.id, amount = tx.amount, "transfer confirmed");
            Ok(())
        } else {
            let update = LedgerUpdate::new()
                .wallet(WalletRef::kel(&from_user), WalletEffect::Refund { amount: reserved })
                .change_status(
                    StatusChange::to(&tx.id, TransactionStatus::Failed)
                        .with_note("recipient wallet inactive at settlement")
                        .strict(),
                )
                .remove_job(&tx.id);
            if let Err(e) = self.store.apply(&update) {
                tracing::error!(from_user, tx_id = %tx.id, error = %e, "transfer compensation failed, retrying");
                return Err(e);
            }
            tracing::warn!(from_user, to_user, tx_id = %tx.id, "transfer failed, sender refunded");
            Ok(())
        }
    }

    // -- Scheduled operations ------------------------------------------------

    /// Zeroes every receiving account's daily total. Safe to run more
    /// than once per day.
    pub fn daily_reset(&self) -> EngineResult<ResetReport> {
        let accounts_reset = self.allocator.daily_reset()?;
        tracing::info!(accounts_reset, "daily receiving-account reset");
        Ok(ResetReport { accounts_reset })
    }

    /// Drives stale pendings toward a terminal status: cancels unpaid
    /// deposits older than `max_age` and re-enqueues reservations whose
    /// finalize job was lost or stalled.
    pub fn sweep_stale(&self, max_age: Duration) -> EngineResult<SweepReport> {
        let cutoff = Utc::now() - max_age;
        let mut report = SweepReport::default();

        for tx in self.store.stale_pending(cutoff)? {
            match tx.kind {
                TransactionKind::Deposit => {
                    self.store.apply(&LedgerUpdate::new().change_status(
                        StatusChange::to(&tx.id, TransactionStatus::Cancelled)
                            .with_note("expired unpaid"),
                    ))?;
                    if let Some(account_id) = &tx.receiving_account {
                        self.allocator.record_outcome(account_id, false)?;
                    }
                    report.cancelled_deposits += 1;
                    tracing::info!(deposit_id = %tx.id, "stale deposit cancelled");
                }
                TransactionKind::Withdrawal | TransactionKind::Transfer => {
                    if self.store.job(&tx.id)?.is_none() {
                        let kind = if tx.kind == TransactionKind::Withdrawal {
                            FinalizeKind::Withdrawal
                        } else {
                            FinalizeKind::Transfer
                        };
                        self.store.update_job(&FinalizeJob::new(&tx.id, kind))?;
                    }
                    self.enqueue_finalize(&tx.id);
                    report.requeued_finalizes += 1;
                    tracing::warn!(tx_id = %tx.id, kind = %tx.kind, "stale reservation re-enqueued");
                }
                // Instantly settled kinds are terminal from birth and
                // never show up in the stale scan.
                _ => {}
            }
        }
        Ok(report)
    }

    // -- Admin ---------------------------------------------------------------

    /// Applies a partial rates update. Takes effect for the next
    /// operation; nothing in flight is recomputed.
    pub fn admin_update_rates(&self, patch: &RateUpdate) -> EngineResult<RateConfig> {
        let updated = self.config.update_rates(patch)?;
        tracing::info!(version = updated.version, "rates updated");
        Ok(updated)
    }

    /// Adds a receiving bank account to the pool.
    pub fn admin_add_bank_account(
        &self,
        account_id: &str,
        daily_limit: u64,
        priority: u32,
    ) -> EngineResult<()> {
        if account_id.trim().is_empty() {
            return Err(EngineError::validation("account id is required"));
        }
        if daily_limit == 0 {
            return Err(EngineError::validation("daily limit must be positive"));
        }
        self.config.update_pool(|pool| {
            if pool.accounts.iter().any(|a| a.account_id == account_id) {
                return Err(EngineError::Conflict(format!(
                    "receiving account {account_id} already exists"
                )));
            }
            pool.accounts
                .push(ReceivingAccount::new(account_id, daily_limit, priority));
            Ok(())
        })?;
        tracing::info!(account_id, daily_limit, priority, "receiving account added");
        Ok(())
    }

    /// Updates an account's status and optionally its priority.
    pub fn admin_update_account_status(
        &self,
        account_id: &str,
        status: AccountStatus,
        priority: Option<u32>,
    ) -> EngineResult<()> {
        self.config.update_pool(|pool| {
            let account = pool
                .accounts
                .iter_mut()
                .find(|a| a.account_id == account_id)
                .ok_or_else(|| EngineError::NotFound(format!("receiving account {account_id}")))?;
            account.status = status;
            if let Some(p) = priority {
                account.priority = p;
            }
            Ok(())
        })?;
        tracing::info!(account_id, %status, "receiving account updated");
        Ok(())
    }

    /// Removes a receiving account. An account that absorbed deposits
    /// today still carries capacity state; removing it is a `Conflict`
    /// unless forced.
    pub fn admin_remove_bank_account(&self, account_id: &str, force: bool) -> EngineResult<()> {
        self.config.update_pool(|pool| {
            let idx = pool
                .accounts
                .iter()
                .position(|a| a.account_id == account_id)
                .ok_or_else(|| EngineError::NotFound(format!("receiving account {account_id}")))?;
            if pool.accounts[idx].current_daily_total > 0 && !force {
                return Err(EngineError::Conflict(format!(
                    "receiving account {account_id} absorbed deposits today; use force to remove"
                )));
            }
            pool.accounts.remove(idx);
            Ok(())
        })?;
        tracing::info!(account_id, force, "receiving account removed");
        Ok(())
    }

    // -- Queries -------------------------------------------------------------

    /// A user's KEL wallet.
    pub fn wallet_view(&self, user_id: &str) -> EngineResult<WalletView> {
        Ok(self.store.wallet(user_id, &Currency::Kel)?.into())
    }

    /// A transaction by id.
    pub fn transaction_status(&self, tx_id: &str) -> EngineResult<Transaction> {
        self.store.transaction(tx_id)
    }

    /// A user's recent transactions, most recent first.
    pub fn history(&self, user_id: &str, limit: usize) -> EngineResult<Vec<Transaction>> {
        self.store.transactions_for_user(user_id, limit)
    }

    /// A user's staking positions.
    pub fn positions(&self, user_id: &str) -> EngineResult<Vec<StakingPosition>> {
        self.store.positions_for_user(user_id)
    }

    /// Engine counters for the status endpoint.
    pub fn status_snapshot(&self) -> EngineStatus {
        EngineStatus {
            wallets: self.store.wallet_count(),
            transactions: self.store.transaction_count(),
            pending_finalize: self.store.job_count(),
            rates_version: self.config.rates().version,
            pool_version: self.config.pool().version,
        }
    }

    /// Outstanding finalize job ids, oldest first. The worker drains
    /// these at startup recovery.
    pub fn pending_finalize_ids(&self) -> EngineResult<Vec<String>> {
        Ok(self
            .store
            .pending_jobs()?
            .into_iter()
            .map(|j| j.tx_id)
            .collect())
    }
}

fn validate_user(user_id: &str) -> EngineResult<()> {
    if user_id.trim().is_empty() {
        return Err(EngineError::validation("user id is required"));
    }
    Ok(())
}

fn validate_amount(amount: u64) -> EngineResult<()> {
    if amount == 0 {
        return Err(EngineError::validation("amount must be positive"));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settlement::rail::DirectRail;

    fn engine() -> Arc<SettlementEngine> {
        let store = Arc::new(LedgerStore::open_temporary().unwrap());
        let config = Arc::new(ConfigStore::new(store.open_tree("config").unwrap()));
        let (engine, _worker) = SettlementEngine::new(store, config, Arc::new(DirectRail));
        engine
    }

    #[test]
    fn deposit_requires_positive_amount() {
        let engine = engine();
        assert!(matches!(
            engine.initiate_deposit("alice", 0).unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn deposit_without_pool_is_capacity_exhausted() {
        let engine = engine();
        assert!(matches!(
            engine.initiate_deposit("alice", 100_00).unwrap_err(),
            EngineError::CapacityExhausted
        ));
    }

    #[test]
    fn transfer_to_self_is_rejected() {
        let engine = engine();
        assert!(matches!(
            engine.transfer("alice", "alice", 10_00, None).unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn transfer_to_unknown_recipient_is_not_found() {
        let engine = engine();
        engine.store().ensure_wallet("alice", Currency::Kel).unwrap();
        assert!(matches!(
            engine.transfer("alice", "ghost", 10_00, None).unwrap_err(),
            EngineError::NotFound(_)
        ));
    }

    #[test]
    fn withdrawal_smaller_than_fee_is_rejected() {
        let engine = engine();
        engine.store().ensure_wallet("alice", Currency::Kel).unwrap();
        // Tier fee for tiny amounts is 1 KEL; withdrawing 0.50 can't cover it.
        assert!(matches!(
            engine
                .initiate_withdrawal("alice", 50, "addr", false)
                .unwrap_err(),
            EngineError::Validation(_)
        ));
    }

    #[test]
    fn admin_duplicate_account_is_conflict() {
        let engine = engine();
        engine.admin_add_bank_account("a1", 100_000_00, 1).unwrap();
        assert!(matches!(
            engine.admin_add_bank_account("a1", 100_000_00, 1).unwrap_err(),
            EngineError::Conflict(_)
        ));
    }

    #[test]
    fn admin_remove_routed_account_needs_force() {
        let engine = engine();
        engine.admin_add_bank_account("a1", 100_000_00, 1).unwrap();
        engine.initiate_deposit("alice", 500_00).unwrap();

        assert!(matches!(
            engine.admin_remove_bank_account("a1", false).unwrap_err(),
            EngineError::Conflict(_)
        ));
        engine.admin_remove_bank_account("a1", true).unwrap();
    }

    #[test]
    fn stake_rejects_zero_duration() {
        let engine = engine();
        engine.store().ensure_wallet("alice", Currency::Kel).unwrap();
        assert!(matches!(
            engine.stake("alice", 100_00, 0).unwrap_err(),
            EngineError::Validation(_)
        ));
    }
}
