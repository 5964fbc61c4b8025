//! The external payout-rail boundary.
//!
//! Withdrawals leave the system through a settlement rail the engine
//! does not own. The engine's contract with it is deliberately thin: one
//! call, one deterministic answer. `Accepted` means the rail took the
//! payout and the reservation settles; `Rejected` means it definitively
//! did not and the reservation is compensated. A transport-level error
//! means *neither* — the finalize job stays queued and is retried,
//! because guessing an outcome here is how money gets lost.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::error::{EngineError, EngineResult};
use crate::ledger::Currency;

/// A payout the engine wants executed.
#[derive(Debug, Clone)]
pub struct PayoutRequest {
    /// The withdrawal transaction id. Rails are expected to deduplicate
    /// on it, which keeps retried submissions safe.
    pub reference: String,
    /// Destination address on the rail.
    pub destination: String,
    /// Net amount to pay out, in minor units.
    pub amount: u64,
    /// Denomination of `amount`.
    pub currency: Currency,
}

/// The rail's definitive answer for a payout.
#[derive(Debug, Clone)]
pub enum PayoutOutcome {
    /// The rail accepted the payout; funds have left the system.
    Accepted {
        /// The rail's own reference for reconciliation.
        rail_reference: String,
    },
    /// The rail rejected the payout; no funds moved.
    Rejected {
        /// Why, verbatim from the rail.
        reason: String,
    },
}

/// A settlement rail client.
#[async_trait]
pub trait PayoutRail: Send + Sync {
    /// Submit a payout and report its outcome. `Err` means the outcome
    /// is unknown (rail unreachable) and the caller must retry.
    async fn submit_payout(&self, request: &PayoutRequest) -> EngineResult<PayoutOutcome>;
}

// ---------------------------------------------------------------------------
// DirectRail
// ---------------------------------------------------------------------------

/// A rail that accepts every payout. Devnet wiring: exercises the full
/// settle path without an external dependency.
#[derive(Debug, Default)]
pub struct DirectRail;

#[async_trait]
impl PayoutRail for DirectRail {
    async fn submit_payout(&self, request: &PayoutRequest) -> EngineResult<PayoutOutcome> {
        Ok(PayoutOutcome::Accepted {
            rail_reference: format!("direct-{}", request.reference),
        })
    }
}

// ---------------------------------------------------------------------------
// MockRail
// ---------------------------------------------------------------------------

/// A rail with scripted outcomes, consumed in order. Once the script is
/// exhausted it accepts everything. For tests that need a rejection or a
/// transient outage at a precise point.
#[derive(Default)]
pub struct MockRail {
    script: Mutex<VecDeque<EngineResult<PayoutOutcome>>>,
}

impl MockRail {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next outcome.
    pub fn push(&self, outcome: EngineResult<PayoutOutcome>) {
        self.script.lock().push_back(outcome);
    }

    /// Queue a rejection with the given reason.
    pub fn push_rejection(&self, reason: &str) {
        self.push(Ok(PayoutOutcome::Rejected {
            reason: reason.to_string(),
        }));
    }

    /// Queue a transport failure (outcome unknown, caller retries).
    pub fn push_outage(&self) {
        self.push(Err(EngineError::internal("rail unreachable")));
    }
}

#[async_trait]
impl PayoutRail for MockRail {
    async fn submit_payout(&self, request: &PayoutRequest) -> EngineResult<PayoutOutcome> {
        match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => Ok(PayoutOutcome::Accepted {
                rail_reference: format!("mock-{}", request.reference),
            }),
        }
    }
}
