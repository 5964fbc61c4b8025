//! # LedgerStore — Durable Wallet & Transaction Storage
//!
//! The persistence layer for the KEEL ledger, built on sled's embedded
//! key-value store. The store is the single source of truth for balances;
//! the settlement engine is its only writer.
//!
//! ## Tree Layout
//!
//! sled organizes data into named "trees", each an independent B+ tree
//! with its own keyspace:
//!
//! | Tree      | Key                  | Value                       |
//! |-----------|----------------------|-----------------------------|
//! | `wallets` | `user/currency`      | `bincode(Wallet)`           |
//! | `records` | `tx/{id}`            | `bincode(Transaction)`      |
//! | `records` | `pos/{id}`           | `bincode(StakingPosition)`  |
//! | `records` | `job/{tx_id}`        | `bincode(FinalizeJob)`      |
//! | `config`  | record name (UTF-8)  | owned by `ConfigStore`      |
//!
//! Transactions, staking positions, and finalize jobs share the `records`
//! tree under distinct key prefixes so that every atomic unit the engine
//! needs — a wallet mutation plus the transaction record plus the durable
//! finalize job — spans exactly two trees and runs as one serializable
//! sled transaction.
//!
//! ## Atomicity & Isolation
//!
//! [`LedgerStore::apply`] executes a [`LedgerUpdate`] (wallet effects,
//! record inserts, status transitions, job queue changes) in a single
//! multi-tree transaction: either every effect lands or none do. sled's
//! optimistic concurrency retries the closure on conflict, which
//! serializes concurrent mutations touching the same wallet — no two
//! read-modify-writes of a balance can interleave.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, TransactionalTree};
use sled::Transactional;
use std::collections::BTreeMap;
use std::path::Path;
use uuid::Uuid;

use super::staking::StakingPosition;
use super::transaction::{Currency, StatusChange, Transaction};
use super::wallet::Wallet;
use crate::error::{EngineError, EngineResult};

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

fn wallet_key(user_id: &str, currency: &Currency) -> String {
    format!("{user_id}/{currency}")
}

fn tx_key(id: &str) -> String {
    format!("tx/{id}")
}

fn pos_key(id: &str) -> String {
    format!("pos/{id}")
}

fn job_key(tx_id: &str) -> String {
    format!("job/{tx_id}")
}

const TX_PREFIX: &str = "tx/";
const POS_PREFIX: &str = "pos/";
const JOB_PREFIX: &str = "job/";

// ---------------------------------------------------------------------------
// Wallet effects
// ---------------------------------------------------------------------------

/// Identifies a wallet inside a [`LedgerUpdate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletRef {
    /// Owning user.
    pub user_id: String,
    /// Wallet currency.
    pub currency: Currency,
}

impl WalletRef {
    /// The KEL wallet of a user — the one every engine operation touches.
    pub fn kel(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            currency: Currency::Kel,
        }
    }
}

/// A single balance mutation, named after the ledger contract it
/// implements. Applied through [`Wallet`]'s checked-arithmetic methods.
#[derive(Debug, Clone)]
pub enum WalletEffect {
    /// Debit `amount + fee` from the balance and freeze the same total.
    Reserve { amount: u64, fee: u64 },
    /// Clear frozen funds consumed by a completed operation.
    Release { amount: u64 },
    /// Clear frozen funds that left the system permanently.
    Settle { amount: u64 },
    /// Compensation: restore a reservation exactly.
    Refund { amount: u64 },
    /// Inbound funds.
    Credit { amount: u64 },
    /// Fee realized directly against the balance.
    Charge { amount: u64 },
}

fn apply_effect(wallet: &mut Wallet, effect: &WalletEffect) -> EngineResult<()> {
    match *effect {
        WalletEffect::Reserve { amount, fee } => wallet.reserve(amount, fee),
        WalletEffect::Release { amount } => wallet.release(amount),
        WalletEffect::Settle { amount } => wallet.settle(amount),
        WalletEffect::Refund { amount } => wallet.refund(amount),
        WalletEffect::Credit { amount } => wallet.credit(amount),
        WalletEffect::Charge { amount } => wallet.charge(amount),
    }
}

// ---------------------------------------------------------------------------
// Finalize jobs
// ---------------------------------------------------------------------------

/// Which finalize routine a job drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinalizeKind {
    /// Crypto payout awaiting the external rail.
    Withdrawal,
    /// Internal transfer awaiting confirmation.
    Transfer,
}

/// A durable "reservation awaiting finalize" record.
///
/// Written in the same atomic unit as the reservation it belongs to, so
/// a crash can never leave a reservation without a path to a terminal
/// status. The worker removes the job in the same atomic unit that makes
/// the transaction terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizeJob {
    /// The pending transaction this job finalizes.
    pub tx_id: String,
    /// Which finalize routine applies.
    pub kind: FinalizeKind,
    /// Processing attempts so far. Bumped by the worker on retriable
    /// failures.
    pub attempts: u32,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
}

impl FinalizeJob {
    /// A fresh job for a just-reserved transaction.
    pub fn new(tx_id: &str, kind: FinalizeKind) -> Self {
        Self {
            tx_id: tx_id.to_string(),
            kind,
            attempts: 0,
            enqueued_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// LedgerUpdate
// ---------------------------------------------------------------------------

/// A bundle of ledger effects executed as one atomic unit.
///
/// The settlement engine describes *what* must happen (reserve this,
/// record that, enqueue a job); the store guarantees it happens
/// together or not at all.
#[derive(Debug, Default)]
pub struct LedgerUpdate {
    wallet_ops: Vec<(WalletRef, WalletEffect)>,
    insert_txs: Vec<Transaction>,
    status_changes: Vec<StatusChange>,
    insert_positions: Vec<StakingPosition>,
    update_positions: Vec<StakingPosition>,
    enqueue_jobs: Vec<FinalizeJob>,
    remove_jobs: Vec<String>,
}

impl LedgerUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a balance effect to a wallet.
    pub fn wallet(mut self, wallet: WalletRef, effect: WalletEffect) -> Self {
        self.wallet_ops.push((wallet, effect));
        self
    }

    /// Insert a new transaction record. Duplicate ids abort the unit
    /// with `Conflict`.
    pub fn insert_tx(mut self, tx: Transaction) -> Self {
        self.insert_txs.push(tx);
        self
    }

    /// Transition an existing transaction's status.
    pub fn change_status(mut self, change: StatusChange) -> Self {
        self.status_changes.push(change);
        self
    }

    /// Insert a new staking position.
    pub fn insert_position(mut self, pos: StakingPosition) -> Self {
        self.insert_positions.push(pos);
        self
    }

    /// Overwrite an existing staking position.
    pub fn update_position(mut self, pos: StakingPosition) -> Self {
        self.update_positions.push(pos);
        self
    }

    /// Enqueue a durable finalize job.
    pub fn enqueue(mut self, job: FinalizeJob) -> Self {
        self.enqueue_jobs.push(job);
        self
    }

    /// Remove a finalize job (finalize reached a terminal status).
    pub fn remove_job(mut self, tx_id: &str) -> Self {
        self.remove_jobs.push(tx_id.to_string());
        self
    }
}

// ---------------------------------------------------------------------------
// Encoding helpers
// ---------------------------------------------------------------------------

fn encode<T: Serialize>(value: &T) -> EngineResult<Vec<u8>> {
    bincode::serialize(value).map_err(EngineError::from)
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> EngineResult<T> {
    bincode::deserialize(bytes).map_err(EngineError::from)
}

type TxnResult<T> = Result<T, ConflictableTransactionError<EngineError>>;

/// Lifts an engine error into a transaction abort.
fn tx_try<T>(r: EngineResult<T>) -> TxnResult<T> {
    r.map_err(ConflictableTransactionError::Abort)
}

fn unwrap_txn<T>(r: Result<T, TransactionError<EngineError>>) -> EngineResult<T> {
    match r {
        Ok(v) => Ok(v),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(EngineError::from(e)),
    }
}

// ---------------------------------------------------------------------------
// LedgerStore
// ---------------------------------------------------------------------------

/// Durable storage for wallets, transactions, staking positions, and
/// finalize jobs.
///
/// # Thread Safety
///
/// sled trees support lock-free concurrent reads and serialized writes;
/// `LedgerStore` is shared across tasks via `Arc<LedgerStore>` without
/// external synchronization. Isolation for read-modify-write sequences
/// comes from the transactions in [`apply`](Self::apply).
#[derive(Debug, Clone)]
pub struct LedgerStore {
    /// Underlying sled handle; kept for tree opening and flushes.
    db: sled::Db,
    /// Wallets keyed by `user/currency`.
    wallets: sled::Tree,
    /// Transactions, staking positions, and finalize jobs, key-prefixed.
    records: sled::Tree,
}

impl LedgerStore {
    /// Open or create a ledger database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> EngineResult<Self> {
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// An in-memory database cleaned up on drop. For tests.
    pub fn open_temporary() -> EngineResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> EngineResult<Self> {
        let wallets = db.open_tree("wallets")?;
        let records = db.open_tree("records")?;
        Ok(Self {
            db,
            wallets,
            records,
        })
    }

    /// Open a named sled tree from the same database. Used by the
    /// configuration store so everything lives in one data directory.
    pub fn open_tree(&self, name: &str) -> EngineResult<sled::Tree> {
        Ok(self.db.open_tree(name)?)
    }

    /// Block until all pending writes are durable.
    pub fn flush(&self) -> EngineResult<()> {
        self.db.flush()?;
        Ok(())
    }

    // -- Wallet operations ---------------------------------------------------

    /// Fetch a wallet, creating an empty active one with a fresh deposit
    /// address if the user has none yet.
    pub fn ensure_wallet(&self, user_id: &str, currency: Currency) -> EngineResult<Wallet> {
        if let Some(existing) = self.wallet_opt(user_id, &currency)? {
            return Ok(existing);
        }
        let key = wallet_key(user_id, &currency);
        let address = format!("kel:{}", Uuid::new_v4().simple());
        let fresh = Wallet::new(user_id, currency, address);
        let result = self.wallets.transaction(|wt: &TransactionalTree| {
            if let Some(bytes) = wt.get(key.as_bytes())? {
                return tx_try(decode::<Wallet>(&bytes));
            }
            wt.insert(key.as_bytes(), tx_try(encode(&fresh))?)?;
            Ok(fresh.clone())
        });
        let wallet = unwrap_txn(result)?;
        self.flush()?;
        Ok(wallet)
    }

    /// Fetch a wallet or fail with `NotFound`.
    pub fn wallet(&self, user_id: &str, currency: &Currency) -> EngineResult<Wallet> {
        self.wallet_opt(user_id, currency)?.ok_or_else(|| {
            EngineError::NotFound(format!("wallet {}", wallet_key(user_id, currency)))
        })
    }

    /// Fetch a wallet if it exists.
    pub fn wallet_opt(&self, user_id: &str, currency: &Currency) -> EngineResult<Option<Wallet>> {
        match self.wallets.get(wallet_key(user_id, currency).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All wallets in the ledger. Used by status reporting and the
    /// conservation checks in tests.
    pub fn all_wallets(&self) -> EngineResult<Vec<Wallet>> {
        let mut out = Vec::new();
        for item in self.wallets.iter() {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }

    /// Activate or deactivate a wallet. Wallets are never deleted.
    pub fn set_wallet_active(
        &self,
        user_id: &str,
        currency: &Currency,
        active: bool,
    ) -> EngineResult<Wallet> {
        let key = wallet_key(user_id, currency);
        let result = self.wallets.transaction(|wt: &TransactionalTree| {
            let bytes = wt
                .get(key.as_bytes())?
                .ok_or_else(|| ConflictableTransactionError::Abort(EngineError::NotFound(
                    format!("wallet {key}"),
                )))?;
            let mut wallet: Wallet = tx_try(decode(&bytes))?;
            wallet.active = active;
            wallet.updated_at = Utc::now();
            wt.insert(key.as_bytes(), tx_try(encode(&wallet))?)?;
            Ok(wallet)
        });
        let wallet = unwrap_txn(result)?;
        self.flush()?;
        Ok(wallet)
    }

    /// Number of wallets.
    pub fn wallet_count(&self) -> usize {
        self.wallets.len()
    }

    // -- Transaction operations ----------------------------------------------

    /// Insert-once by id: re-inserting an existing id is a no-op that
    /// returns the stored record, which makes externally supplied ids
    /// safe to retry.
    pub fn record_transaction(&self, tx: &Transaction) -> EngineResult<Transaction> {
        let key = tx_key(&tx.id);
        let bytes = encode(tx)?;
        match self
            .records
            .compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))?
        {
            Ok(()) => {
                self.flush()?;
                Ok(tx.clone())
            }
            Err(cas) => {
                let stored = cas
                    .current
                    .ok_or_else(|| EngineError::internal("insert-once race lost both ways"))?;
                decode(&stored)
            }
        }
    }

    /// Fetch a transaction or fail with `NotFound`.
    pub fn transaction(&self, id: &str) -> EngineResult<Transaction> {
        self.transaction_opt(id)?
            .ok_or_else(|| EngineError::NotFound(format!("transaction {id}")))
    }

    /// Fetch a transaction if it exists.
    pub fn transaction_opt(&self, id: &str) -> EngineResult<Option<Transaction>> {
        match self.records.get(tx_key(id).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// A user's transactions, most recent first, at most `limit`.
    pub fn transactions_for_user(&self, user_id: &str, limit: usize) -> EngineResult<Vec<Transaction>> {
        let mut out: Vec<Transaction> = Vec::new();
        for item in self.records.scan_prefix(TX_PREFIX.as_bytes()) {
            let (_, bytes) = item?;
            let tx: Transaction = decode(&bytes)?;
            let involved = tx.from_user.as_deref() == Some(user_id)
                || tx.to_user.as_deref() == Some(user_id);
            if involved {
                out.push(tx);
            }
        }
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit);
        Ok(out)
    }

    /// Transition a transaction's status outside a wider atomic unit.
    /// Only legal transitions per kind are accepted.
    pub fn update_transaction_status(&self, change: &StatusChange) -> EngineResult<Transaction> {
        let key = tx_key(&change.tx_id);
        let now = Utc::now();
        let result = self.records.transaction(|rt: &TransactionalTree| {
            let bytes = rt
                .get(key.as_bytes())?
                .ok_or_else(|| ConflictableTransactionError::Abort(EngineError::NotFound(
                    format!("transaction {}", change.tx_id),
                )))?;
            let mut tx: Transaction = tx_try(decode(&bytes))?;
            tx_try(tx.apply_change(change, now))?;
            rt.insert(key.as_bytes(), tx_try(encode(&tx))?)?;
            Ok(tx)
        });
        let tx = unwrap_txn(result)?;
        self.flush()?;
        Ok(tx)
    }

    /// Number of transactions.
    pub fn transaction_count(&self) -> usize {
        self.records.scan_prefix(TX_PREFIX.as_bytes()).count()
    }

    /// Non-terminal transactions created before `cutoff`. The stale
    /// sweep drives these to a terminal status.
    pub fn stale_pending(&self, cutoff: DateTime<Utc>) -> EngineResult<Vec<Transaction>> {
        let mut out = Vec::new();
        for item in self.records.scan_prefix(TX_PREFIX.as_bytes()) {
            let (_, bytes) = item?;
            let tx: Transaction = decode(&bytes)?;
            if !tx.status.is_terminal() && tx.created_at < cutoff {
                out.push(tx);
            }
        }
        Ok(out)
    }

    // -- Staking positions ---------------------------------------------------

    /// Fetch a staking position or fail with `NotFound`.
    pub fn position(&self, id: &str) -> EngineResult<StakingPosition> {
        match self.records.get(pos_key(id).as_bytes())? {
            Some(bytes) => decode(&bytes),
            None => Err(EngineError::NotFound(format!("staking position {id}"))),
        }
    }

    /// All positions belonging to a user.
    pub fn positions_for_user(&self, user_id: &str) -> EngineResult<Vec<StakingPosition>> {
        let mut out = Vec::new();
        for item in self.records.scan_prefix(POS_PREFIX.as_bytes()) {
            let (_, bytes) = item?;
            let pos: StakingPosition = decode(&bytes)?;
            if pos.user_id == user_id {
                out.push(pos);
            }
        }
        out.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        Ok(out)
    }

    // -- Finalize jobs -------------------------------------------------------

    /// All outstanding finalize jobs, oldest first. Drained by the
    /// worker at startup recovery.
    pub fn pending_jobs(&self) -> EngineResult<Vec<FinalizeJob>> {
        let mut out: Vec<FinalizeJob> = Vec::new();
        for item in self.records.scan_prefix(JOB_PREFIX.as_bytes()) {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        out.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        Ok(out)
    }

    /// The finalize job for a transaction, if one is outstanding.
    pub fn job(&self, tx_id: &str) -> EngineResult<Option<FinalizeJob>> {
        match self.records.get(job_key(tx_id).as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Overwrite a job record (attempt bumps on retriable failures).
    pub fn update_job(&self, job: &FinalizeJob) -> EngineResult<()> {
        self.records
            .insert(job_key(&job.tx_id).as_bytes(), encode(job)?)?;
        self.flush()
    }

    /// Drop a job whose transaction is already terminal.
    pub fn remove_job(&self, tx_id: &str) -> EngineResult<()> {
        self.records.remove(job_key(tx_id).as_bytes())?;
        self.flush()
    }

    /// Number of outstanding finalize jobs.
    pub fn job_count(&self) -> usize {
        self.records.scan_prefix(JOB_PREFIX.as_bytes()).count()
    }

    // -- The atomic unit -----------------------------------------------------

    /// Execute a [`LedgerUpdate`] atomically: every wallet effect, record
    /// insert, status transition, and job change lands together or not
    /// at all. Concurrent updates touching the same keys serialize via
    /// sled's optimistic transaction retry.
    pub fn apply(&self, update: &LedgerUpdate) -> EngineResult<()> {
        let now = Utc::now();
        let result = (&self.wallets, &self.records).transaction(|(wt, rt)| {
            // Wallet effects: load each touched wallet once, apply the
            // effects in order, write back.
            let mut touched: BTreeMap<String, Wallet> = BTreeMap::new();
            for (wref, effect) in &update.wallet_ops {
                let key = wallet_key(&wref.user_id, &wref.currency);
                if !touched.contains_key(&key) {
                    let bytes = wt.get(key.as_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(EngineError::NotFound(format!(
                            "wallet {key}"
                        )))
                    })?;
                    touched.insert(key.clone(), tx_try(decode(&bytes))?);
                }
                let wallet = touched.get_mut(&key).expect("just inserted");
                tx_try(apply_effect(wallet, effect))?;
            }
            for (key, wallet) in &mut touched {
                wallet.updated_at = now;
                wt.insert(key.as_bytes(), tx_try(encode(wallet))?)?;
            }

            // New transaction records: insert-once.
            for tx in &update.insert_txs {
                let key = tx_key(&tx.id);
                if rt.get(key.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(EngineError::Conflict(
                        format!("transaction {} already exists", tx.id),
                    )));
                }
                rt.insert(key.as_bytes(), tx_try(encode(tx))?)?;
            }

            // Status transitions.
            for change in &update.status_changes {
                let key = tx_key(&change.tx_id);
                let bytes = rt.get(key.as_bytes())?.ok_or_else(|| {
                    ConflictableTransactionError::Abort(EngineError::NotFound(format!(
                        "transaction {}",
                        change.tx_id
                    )))
                })?;
                let mut tx: Transaction = tx_try(decode(&bytes))?;
                tx_try(tx.apply_change(change, now))?;
                rt.insert(key.as_bytes(), tx_try(encode(&tx))?)?;
            }

            // Staking positions.
            for pos in &update.insert_positions {
                let key = pos_key(&pos.id);
                if rt.get(key.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(EngineError::Conflict(
                        format!("staking position {} already exists", pos.id),
                    )));
                }
                rt.insert(key.as_bytes(), tx_try(encode(pos))?)?;
            }
            for pos in &update.update_positions {
                rt.insert(pos_key(&pos.id).as_bytes(), tx_try(encode(pos))?)?;
            }

            // Finalize jobs.
            for job in &update.enqueue_jobs {
                rt.insert(job_key(&job.tx_id).as_bytes(), tx_try(encode(job))?)?;
            }
            for tx_id in &update.remove_jobs {
                rt.remove(job_key(tx_id).as_bytes())?;
            }

            Ok(())
        });
        unwrap_txn(result)?;
        self.flush()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::transaction::{TransactionKind, TransactionStatus};

    fn store_with_wallet(balance: u64) -> LedgerStore {
        let store = LedgerStore::open_temporary().unwrap();
        store.ensure_wallet("alice", Currency::Kel).unwrap();
        if balance > 0 {
            store
                .apply(&LedgerUpdate::new().wallet(
                    WalletRef::kel("alice"),
                    WalletEffect::Credit { amount: balance },
                ))
                .unwrap();
        }
        store
    }

    #[test]
    fn ensure_wallet_is_idempotent() {
        let store = LedgerStore::open_temporary().unwrap();
        let first = store.ensure_wallet("alice", Currency::Kel).unwrap();
        let second = store.ensure_wallet("alice", Currency::Kel).unwrap();
        assert_eq!(first.address, second.address);
        assert_eq!(store.wallet_count(), 1);
    }

    #[test]
    fn wallet_not_found() {
        let store = LedgerStore::open_temporary().unwrap();
        let err = store.wallet("nobody", &Currency::Kel).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn apply_reserves_and_records_atomically() {
        let store = store_with_wallet(1000_00);
        let tx = Transaction::withdrawal("w1".into(), "alice", 200_00, 2_00, "addr");
        store
            .apply(
                &LedgerUpdate::new()
                    .wallet(
                        WalletRef::kel("alice"),
                        WalletEffect::Reserve {
                            amount: 200_00,
                            fee: 0,
                        },
                    )
                    .wallet(WalletRef::kel("alice"), WalletEffect::Charge { amount: 2_00 })
                    .insert_tx(tx)
                    .enqueue(FinalizeJob::new("w1", FinalizeKind::Withdrawal)),
            )
            .unwrap();

        let wallet = store.wallet("alice", &Currency::Kel).unwrap();
        assert_eq!(wallet.balance, 798_00);
        assert_eq!(wallet.frozen_balance, 200_00);
        assert_eq!(store.transaction_count(), 1);
        assert_eq!(store.job_count(), 1);
    }

    #[test]
    fn apply_rolls_back_on_insufficient_funds() {
        let store = store_with_wallet(100_00);
        let tx = Transaction::withdrawal("w1".into(), "alice", 500_00, 5_00, "addr");
        let err = store
            .apply(
                &LedgerUpdate::new()
                    .wallet(
                        WalletRef::kel("alice"),
                        WalletEffect::Reserve {
                            amount: 500_00,
                            fee: 0,
                        },
                    )
                    .insert_tx(tx),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        // Nothing landed: no transaction record, wallet untouched.
        assert_eq!(store.transaction_count(), 0);
        let wallet = store.wallet("alice", &Currency::Kel).unwrap();
        assert_eq!(wallet.balance, 100_00);
        assert_eq!(wallet.frozen_balance, 0);
    }

    #[test]
    fn apply_rejects_duplicate_transaction_id() {
        let store = store_with_wallet(0);
        let tx = Transaction::deposit("d1".into(), "alice", 100_00, "acct");
        store
            .apply(&LedgerUpdate::new().insert_tx(tx.clone()))
            .unwrap();
        let err = store
            .apply(&LedgerUpdate::new().insert_tx(tx))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));
    }

    #[test]
    fn record_transaction_is_insert_once() {
        let store = LedgerStore::open_temporary().unwrap();
        let tx = Transaction::deposit("d1".into(), "alice", 100_00, "acct");
        store.record_transaction(&tx).unwrap();

        // Re-inserting with different content returns the original.
        let mut replay = tx.clone();
        replay.amount = 999_99;
        let stored = store.record_transaction(&replay).unwrap();
        assert_eq!(stored.amount, 100_00);
        assert_eq!(store.transaction_count(), 1);
    }

    #[test]
    fn status_update_enforces_transitions() {
        let store = store_with_wallet(0);
        let tx = Transaction::deposit("d1".into(), "alice", 100_00, "acct");
        store.record_transaction(&tx).unwrap();

        let updated = store
            .update_transaction_status(&StatusChange::to("d1", TransactionStatus::Completed))
            .unwrap();
        assert_eq!(updated.status, TransactionStatus::Completed);
        assert!(updated.confirmed_at.is_some());

        // Terminal -> other terminal is a conflict.
        let err = store
            .update_transaction_status(&StatusChange::to("d1", TransactionStatus::Cancelled))
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // Terminal -> same terminal is a no-op.
        store
            .update_transaction_status(&StatusChange::to("d1", TransactionStatus::Completed))
            .unwrap();
    }

    #[test]
    fn stale_pending_scan_skips_terminal() {
        let store = store_with_wallet(0);
        store
            .record_transaction(&Transaction::deposit("d1".into(), "alice", 100_00, "acct"))
            .unwrap();
        store
            .record_transaction(&Transaction::settled(
                "f1".into(),
                TransactionKind::Fee,
                Some("alice"),
                None,
                1_00,
                0,
                None,
            ))
            .unwrap();

        let future = Utc::now() + chrono::Duration::seconds(5);
        let stale = store.stale_pending(future).unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, "d1");
    }

    #[test]
    fn jobs_roundtrip() {
        let store = store_with_wallet(0);
        store
            .apply(&LedgerUpdate::new().enqueue(FinalizeJob::new("w1", FinalizeKind::Withdrawal)))
            .unwrap();
        assert_eq!(store.job_count(), 1);

        let mut job = store.job("w1").unwrap().expect("job exists");
        job.attempts += 1;
        store.update_job(&job).unwrap();
        assert_eq!(store.job("w1").unwrap().unwrap().attempts, 1);

        store.remove_job("w1").unwrap();
        assert_eq!(store.job_count(), 0);
    }

    #[test]
    fn transfer_touches_both_wallets_atomically() {
        let store = store_with_wallet(1000_00);
        store.ensure_wallet("bob", Currency::Kel).unwrap();

        store
            .apply(
                &LedgerUpdate::new()
                    .wallet(
                        WalletRef::kel("alice"),
                        WalletEffect::Reserve {
                            amount: 300_00,
                            fee: 1_00,
                        },
                    )
                    .wallet(WalletRef::kel("bob"), WalletEffect::Credit { amount: 300_00 }),
            )
            .unwrap();

        let alice = store.wallet("alice", &Currency::Kel).unwrap();
        let bob = store.wallet("bob", &Currency::Kel).unwrap();
        assert_eq!(alice.balance, 699_00);
        assert_eq!(alice.frozen_balance, 301_00);
        assert_eq!(bob.balance, 300_00);
    }

    #[test]
    fn persistent_reopen_preserves_ledger() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = LedgerStore::open(dir.path()).unwrap();
            store.ensure_wallet("alice", Currency::Kel).unwrap();
            store
                .apply(&LedgerUpdate::new().wallet(
                    WalletRef::kel("alice"),
                    WalletEffect::Credit { amount: 42_00 },
                ))
                .unwrap();
        }
        let store = LedgerStore::open(dir.path()).unwrap();
        let wallet = store.wallet("alice", &Currency::Kel).unwrap();
        assert_eq!(wallet.balance, 42_00);
    }

    #[test]
    fn transactions_for_user_sorted_and_bounded() {
        let store = store_with_wallet(0);
        for i in 0..5 {
            store
                .record_transaction(&Transaction::deposit(
                    format!("d{i}"),
                    "alice",
                    100_00 + i,
                    "acct",
                ))
                .unwrap();
        }
        let recent = store.transactions_for_user("alice", 3).unwrap();
        assert_eq!(recent.len(), 3);
        // Most recent first.
        assert!(recent[0].created_at >= recent[1].created_at);
        assert!(recent[1].created_at >= recent[2].created_at);
    }
}
