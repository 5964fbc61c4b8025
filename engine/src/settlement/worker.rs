//! # Finalize Worker
//!
//! The background task that drives reservations to their terminal
//! status. It outlives the requests that created the work: a caller who
//! disconnects right after `initiate_withdrawal` still gets settled or
//! refunded.
//!
//! Work arrives two ways:
//!
//! - **Live**: the engine pushes each new job's transaction id over an
//!   in-process channel right after the reservation commits.
//! - **Recovery**: at startup the worker replays every durable job left
//!   in the store — jobs are written in the same atomic unit as their
//!   reservation, so a crash between reserve and finalize leaves exactly
//!   the record needed to resume.
//!
//! Processing is idempotent (a terminal transaction is a cleanup no-op),
//! so the same id arriving via both paths, or twice via the sweep, is
//! harmless. Retriable failures stay in the store with a bumped attempt
//! counter and surface again through the stale sweep.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::engine::SettlementEngine;

/// Owns the receive side of the finalize queue.
pub struct FinalizeWorker {
    engine: Arc<SettlementEngine>,
    rx: mpsc::UnboundedReceiver<String>,
}

impl FinalizeWorker {
    pub(crate) fn new(engine: Arc<SettlementEngine>, rx: mpsc::UnboundedReceiver<String>) -> Self {
        Self { engine, rx }
    }

    /// Spawns the worker onto the runtime. The task ends when the
    /// engine shuts down its sender and the queue drains.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Recovery pass, then the live loop.
    pub async fn run(mut self) {
        match self.engine.pending_finalize_ids() {
            Ok(ids) => {
                if !ids.is_empty() {
                    tracing::info!(count = ids.len(), "recovering unfinished finalize jobs");
                }
                for tx_id in ids {
                    self.process(&tx_id).await;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to scan finalize jobs at startup");
            }
        }

        while let Some(tx_id) = self.rx.recv().await {
            self.process(&tx_id).await;
        }
        tracing::info!("finalize worker drained and stopped");
    }

    async fn process(&self, tx_id: &str) {
        if let Err(e) = self.engine.finalize(tx_id).await {
            // The job record is still in the store; the stale sweep
            // re-enqueues it. Nothing is dropped.
            tracing::error!(tx_id, error = %e, "finalize attempt failed, job retained");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::ledger::{Currency, LedgerStore, LedgerUpdate, TransactionStatus, WalletEffect, WalletRef};
    use crate::settlement::rail::DirectRail;

    async fn settled_engine() -> (Arc<SettlementEngine>, JoinHandle<()>) {
        let store = Arc::new(LedgerStore::open_temporary().unwrap());
        let config = Arc::new(ConfigStore::new(store.open_tree("config").unwrap()));
        let (engine, worker) = SettlementEngine::new(store, config, Arc::new(DirectRail));
        let handle = worker.spawn();
        (engine, handle)
    }

    #[tokio::test]
    async fn worker_drains_and_exits_on_shutdown() {
        let (engine, handle) = settled_engine().await;

        engine.store().ensure_wallet("alice", Currency::Kel).unwrap();
        engine
            .store()
            .apply(&LedgerUpdate::new().wallet(
                WalletRef::kel("alice"),
                WalletEffect::Credit { amount: 1_000_00 },
            ))
            .unwrap();
        let initiation = engine
            .initiate_withdrawal("alice", 200_00, "addr", false)
            .unwrap();

        engine.shutdown();
        handle.await.expect("worker exits cleanly");

        let tx = engine.transaction_status(&initiation.withdrawal_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(engine.store().job_count(), 0);
    }

    #[tokio::test]
    async fn recovery_processes_jobs_left_in_store() {
        // Reserve without a running worker, then start one: the durable
        // job record alone must be enough to finish the withdrawal.
        let store = Arc::new(LedgerStore::open_temporary().unwrap());
        let config = Arc::new(ConfigStore::new(store.open_tree("config").unwrap()));
        let (engine, _unspawned) =
            SettlementEngine::new(Arc::clone(&store), Arc::clone(&config), Arc::new(DirectRail));

        engine.store().ensure_wallet("alice", Currency::Kel).unwrap();
        engine
            .store()
            .apply(&LedgerUpdate::new().wallet(
                WalletRef::kel("alice"),
                WalletEffect::Credit { amount: 1_000_00 },
            ))
            .unwrap();
        let initiation = engine
            .initiate_withdrawal("alice", 200_00, "addr", false)
            .unwrap();
        assert_eq!(engine.store().job_count(), 1);

        // "Restart": fresh engine + worker over the same store.
        let (engine2, worker2) = SettlementEngine::new(store, config, Arc::new(DirectRail));
        let handle = worker2.spawn();
        engine2.shutdown();
        handle.await.unwrap();

        let tx = engine2.transaction_status(&initiation.withdrawal_id).unwrap();
        assert_eq!(tx.status, TransactionStatus::Completed);
        assert_eq!(engine2.store().job_count(), 0);
    }
}
