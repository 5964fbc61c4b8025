// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # KEEL — Wallet Ledger & Settlement Engine
//!
//! The custody core of the KEEL wallet: every balance, every reservation,
//! every settlement in one place. Users hold KEL (the internal unit),
//! fund it from fiat rails, move it to each other, push it out through a
//! crypto payout rail, and stake it for yield. This crate is the only
//! component allowed to touch a balance.
//!
//! The money rules are blunt on purpose: funds are never created,
//! destroyed, or duplicated, and any operation that fails after reserving
//! funds compensates before it reports the failure. Everything else in
//! the product (bots, web, webhooks) is a client of the operation
//! contracts exposed by [`settlement::SettlementEngine`].
//!
//! ## Architecture
//!
//! - **ledger** — Wallets, transactions, staking positions, and the
//!   sled-backed store that mutates them atomically.
//! - **policy** — Pure fee and staking-rate arithmetic. No side effects,
//!   no clock, no storage. If it computes money, it lives here.
//! - **allocator** — Picks which receiving bank account absorbs an
//!   incoming fiat deposit, under per-account daily caps.
//! - **limiter** — Fixed-window request limiting per caller. Fails open;
//!   it is a traffic control, not a correctness control.
//! - **settlement** — The engine: reserve → finalize (or reserve →
//!   compensate) state machines, the payout-rail boundary, and the
//!   durable finalize worker.
//! - **config** — Versioned runtime configuration records (rates and the
//!   receiving-account pool), mutated read-modify-write only.
//!
//! ## Design Philosophy
//!
//! 1. Integer money. Balances, fees, and rewards are `u64` minor units;
//!    rates are basis points. Floats appear only in allocator scoring.
//! 2. One atomic unit per mutation. A reservation and its transaction
//!    record land together or not at all.
//! 3. Idempotency instead of distributed transactions. Everything
//!    retriable is keyed by a stable transaction ID.
//! 4. If it touches money, it has tests. Plural.

pub mod allocator;
pub mod config;
pub mod error;
pub mod ledger;
pub mod limiter;
pub mod policy;
pub mod settlement;

pub use error::{EngineError, EngineResult};
