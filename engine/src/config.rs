//! # Runtime Configuration
//!
//! Every tunable number in the engine lives here, in two independently
//! versioned records:
//!
//! - [`RateConfig`] — commissions, fee tiers, the staking APY ladder,
//!   the exchange rate, and rate-limit policies.
//! - [`AccountPool`] — the receiving bank accounts fiat deposits are
//!   routed across, including their live daily totals.
//!
//! Splitting the two keeps deposit routing (which increments a daily
//! total on *every* deposit) from contending with rate updates (which
//! happen a few times a year, ideally).
//!
//! Both records are mutated exclusively through [`ConfigStore`]
//! read-modify-write operations: take the record's lock, load, mutate,
//! bump the version, persist. Readers get cheap snapshots. The fallback
//! defaults below apply whenever a record has never been stored, so a
//! fresh deployment behaves sensibly before any admin touches it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{EngineError, EngineResult};
use crate::limiter::{OperationClass, RateLimitPolicy};

// ---------------------------------------------------------------------------
// Scales
// ---------------------------------------------------------------------------

/// Basis-point denominator: 10_000 bps = 100%.
pub const BPS_SCALE: u64 = 10_000;

/// Fixed-point scale for exchange rates. A stored rate of `1_000` with
/// this scale means 0.1 THB per whole KEL.
pub const RATE_SCALE: u64 = 10_000;

/// Minor units per whole KEL (two decimal places).
pub const MINOR_PER_KEL: u64 = 100;

// ---------------------------------------------------------------------------
// Fee schedule types
// ---------------------------------------------------------------------------

/// One step of the tiered withdrawal fee: a flat fee for any amount up
/// to (and including) the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeTier {
    /// Upper bound of the tier, in KEL minor units.
    pub up_to: u64,
    /// Flat fee for the tier, in KEL minor units.
    pub fee: u64,
}

/// Proportional fees for the internal operation kinds, in basis points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFeeTable {
    pub transfer_bps: u32,
    pub exchange_bps: u32,
    pub stake_bps: u32,
    pub unstake_bps: u32,
}

/// One band of the staking APY ladder: positions of at least `min_days`
/// earn `apy_bps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApyBand {
    pub min_days: u32,
    pub apy_bps: u32,
}

/// Per-class rate-limit policies. `None` disables limiting for that
/// class (the limiter fails open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub deposit: Option<RateLimitPolicy>,
    pub withdrawal: Option<RateLimitPolicy>,
    pub transfer: Option<RateLimitPolicy>,
    pub staking: Option<RateLimitPolicy>,
    pub query: Option<RateLimitPolicy>,
}

impl RateLimits {
    /// Policy lookup by operation class.
    pub fn policy_for(&self, class: OperationClass) -> Option<&RateLimitPolicy> {
        match class {
            OperationClass::Deposit => self.deposit.as_ref(),
            OperationClass::Withdrawal => self.withdrawal.as_ref(),
            OperationClass::Transfer => self.transfer.as_ref(),
            OperationClass::Staking => self.staking.as_ref(),
            OperationClass::Query => self.query.as_ref(),
        }
    }
}

// ---------------------------------------------------------------------------
// RateConfig
// ---------------------------------------------------------------------------

/// The rates record: everything the fee policy and limiter read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateConfig {
    /// Monotonic version, bumped on every update.
    pub version: u64,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
    /// Deposit commission in basis points.
    pub deposit_commission_bps: u32,
    /// Tiered withdrawal fee, ascending by threshold.
    pub withdrawal_tiers: Vec<FeeTier>,
    /// Proportional fee (bps) for withdrawals above the last tier.
    pub withdrawal_over_bps: u32,
    /// Flat protocol fee (bps) added on the quick-withdraw path.
    pub quick_withdraw_bps: u32,
    /// Proportional transfer-family fees.
    pub transfer_fees: TransferFeeTable,
    /// Minimum transfer-family fee, in KEL minor units.
    pub transfer_fee_floor: u64,
    /// Staking APY ladder, descending by `min_days`.
    pub apy_schedule: Vec<ApyBand>,
    /// Early-exit penalty on unstaking before maturity, in basis points
    /// of the principal.
    pub early_exit_penalty_bps: u32,
    /// THB per whole KEL, scaled by [`RATE_SCALE`].
    pub thb_per_kel: u64,
    /// Rate-limit policies per operation class.
    pub limits: RateLimits,
}

impl Default for RateConfig {
    /// The documented fallback defaults: 1% deposit commission, the
    /// 1/2/5-unit withdrawal tiers with a 0.1% over-tier, 0.1%
    /// quick-withdraw fee, a 0.01-KEL transfer-fee floor, the
    /// 4/6/8/10/12% APY ladder, a 5% early-exit penalty, and 0.1 THB
    /// per KEL.
    fn default() -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
            deposit_commission_bps: 100,
            withdrawal_tiers: vec![
                FeeTier {
                    up_to: 100 * MINOR_PER_KEL,
                    fee: MINOR_PER_KEL,
                },
                FeeTier {
                    up_to: 1_000 * MINOR_PER_KEL,
                    fee: 2 * MINOR_PER_KEL,
                },
                FeeTier {
                    up_to: 10_000 * MINOR_PER_KEL,
                    fee: 5 * MINOR_PER_KEL,
                },
            ],
            withdrawal_over_bps: 10,
            quick_withdraw_bps: 10,
            transfer_fees: TransferFeeTable {
                transfer_bps: 10,
                exchange_bps: 50,
                stake_bps: 0,
                unstake_bps: 0,
            },
            transfer_fee_floor: 1,
            apy_schedule: vec![
                ApyBand {
                    min_days: 365,
                    apy_bps: 1_200,
                },
                ApyBand {
                    min_days: 180,
                    apy_bps: 1_000,
                },
                ApyBand {
                    min_days: 90,
                    apy_bps: 800,
                },
                ApyBand {
                    min_days: 30,
                    apy_bps: 600,
                },
                ApyBand {
                    min_days: 0,
                    apy_bps: 400,
                },
            ],
            early_exit_penalty_bps: 500,
            thb_per_kel: 1_000,
            limits: RateLimits {
                deposit: Some(RateLimitPolicy::new(10, 60)),
                withdrawal: Some(RateLimitPolicy::new(5, 60)),
                transfer: Some(RateLimitPolicy::new(20, 60)),
                staking: Some(RateLimitPolicy::new(10, 60)),
                query: None,
            },
        }
    }
}

/// A partial admin update to [`RateConfig`]. `None` fields are left
/// untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateUpdate {
    pub deposit_commission_bps: Option<u32>,
    pub withdrawal_over_bps: Option<u32>,
    pub quick_withdraw_bps: Option<u32>,
    pub transfer_fees: Option<TransferFeeTable>,
    pub transfer_fee_floor: Option<u64>,
    pub early_exit_penalty_bps: Option<u32>,
    pub thb_per_kel: Option<u64>,
}

impl RateUpdate {
    /// Sanity-checks the patch before it is applied. Commissions above
    /// 100% and a zero exchange rate are configuration mistakes, not
    /// policies.
    pub fn validate(&self) -> EngineResult<()> {
        for (name, bps) in [
            ("deposit_commission_bps", self.deposit_commission_bps),
            ("withdrawal_over_bps", self.withdrawal_over_bps),
            ("quick_withdraw_bps", self.quick_withdraw_bps),
            ("early_exit_penalty_bps", self.early_exit_penalty_bps),
        ] {
            if let Some(v) = bps {
                if u64::from(v) > BPS_SCALE {
                    return Err(EngineError::validation(format!(
                        "{name} {v} exceeds 100%"
                    )));
                }
            }
        }
        if self.thb_per_kel == Some(0) {
            return Err(EngineError::validation("exchange rate must be positive"));
        }
        Ok(())
    }

    fn apply_to(&self, cfg: &mut RateConfig) {
        if let Some(v) = self.deposit_commission_bps {
            cfg.deposit_commission_bps = v;
        }
        if let Some(v) = self.withdrawal_over_bps {
            cfg.withdrawal_over_bps = v;
        }
        if let Some(v) = self.quick_withdraw_bps {
            cfg.quick_withdraw_bps = v;
        }
        if let Some(v) = self.transfer_fees {
            cfg.transfer_fees = v;
        }
        if let Some(v) = self.transfer_fee_floor {
            cfg.transfer_fee_floor = v;
        }
        if let Some(v) = self.early_exit_penalty_bps {
            cfg.early_exit_penalty_bps = v;
        }
        if let Some(v) = self.thb_per_kel {
            cfg.thb_per_kel = v;
        }
    }
}

// ---------------------------------------------------------------------------
// Receiving accounts
// ---------------------------------------------------------------------------

/// Whether a receiving account participates in deposit routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Active,
    Inactive,
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
        }
    }
}

/// A fiat bank account usable as a deposit destination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceivingAccount {
    /// Stable identifier shown in payment instructions.
    pub account_id: String,
    /// Maximum fiat (THB minor units) this account may absorb per day.
    pub daily_limit: u64,
    /// Fiat routed to this account since the last daily reset.
    /// Invariant: never exceeds `daily_limit` for accounts the
    /// allocator considers.
    pub current_daily_total: u64,
    /// Routing preference; higher wins, all else equal.
    pub priority: u32,
    /// Deposits confirmed against this account.
    pub success_count: u64,
    /// Deposits routed here that were cancelled unpaid.
    pub failure_count: u64,
    /// Participation status.
    pub status: AccountStatus,
}

impl ReceivingAccount {
    pub fn new(account_id: &str, daily_limit: u64, priority: u32) -> Self {
        Self {
            account_id: account_id.to_string(),
            daily_limit,
            current_daily_total: 0,
            priority,
            success_count: 0,
            failure_count: 0,
            status: AccountStatus::Active,
        }
    }
}

/// The receiving-account pool record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountPool {
    /// Monotonic version, bumped on every update (including allocator
    /// capacity increments).
    pub version: u64,
    /// When this version was written.
    pub updated_at: DateTime<Utc>,
    /// The accounts, in stable insertion order — the allocator's tie
    /// break depends on this ordering being deterministic.
    pub accounts: Vec<ReceivingAccount>,
    /// Date of the last daily reset, for observability.
    pub last_reset_on: Option<chrono::NaiveDate>,
}

impl Default for AccountPool {
    fn default() -> Self {
        Self {
            version: 0,
            updated_at: Utc::now(),
            accounts: Vec::new(),
            last_reset_on: None,
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

const RATES_KEY: &[u8] = b"rates";
const POOL_KEY: &[u8] = b"accounts";

/// Versioned configuration persistence with per-record serialization.
///
/// Each record has its own mutex; writers hold it across load → mutate →
/// persist, so concurrent admin updates, daily resets, and allocator
/// increments never interleave on the same record. Reads don't take the
/// lock — they see the latest persisted version.
pub struct ConfigStore {
    tree: sled::Tree,
    rates_lock: Mutex<()>,
    pool_lock: Mutex<()>,
}

impl ConfigStore {
    /// Wrap a sled tree (usually `LedgerStore::open_tree("config")`).
    pub fn new(tree: sled::Tree) -> Self {
        Self {
            tree,
            rates_lock: Mutex::new(()),
            pool_lock: Mutex::new(()),
        }
    }

    /// Snapshot of the rates record (defaults if never stored).
    pub fn rates(&self) -> RateConfig {
        self.load(RATES_KEY).unwrap_or_default()
    }

    /// Snapshot of the account pool (empty if never stored).
    pub fn pool(&self) -> AccountPool {
        self.load(POOL_KEY).unwrap_or_default()
    }

    /// Apply an admin patch to the rates record.
    pub fn update_rates(&self, patch: &RateUpdate) -> EngineResult<RateConfig> {
        patch.validate()?;
        let _guard = self.rates_lock.lock();
        let mut cfg = self.rates();
        patch.apply_to(&mut cfg);
        cfg.version += 1;
        cfg.updated_at = Utc::now();
        self.persist(RATES_KEY, &cfg)?;
        Ok(cfg)
    }

    /// Read-modify-write on the account pool. The closure's error aborts
    /// the update without persisting; its success value is returned
    /// after the new version is durable.
    pub fn update_pool<T>(
        &self,
        f: impl FnOnce(&mut AccountPool) -> EngineResult<T>,
    ) -> EngineResult<T> {
        let _guard = self.pool_lock.lock();
        let mut pool = self.pool();
        let out = f(&mut pool)?;
        pool.version += 1;
        pool.updated_at = Utc::now();
        self.persist(POOL_KEY, &pool)?;
        Ok(out)
    }

    /// Persist both records as they currently stand (seeding defaults on
    /// a fresh data directory).
    pub fn seed_defaults(&self) -> EngineResult<()> {
        let _rates = self.rates_lock.lock();
        if self.load::<RateConfig>(RATES_KEY).is_none() {
            self.persist(RATES_KEY, &RateConfig::default())?;
        }
        drop(_rates);
        let _pool = self.pool_lock.lock();
        if self.load::<AccountPool>(POOL_KEY).is_none() {
            self.persist(POOL_KEY, &AccountPool::default())?;
        }
        Ok(())
    }

    fn load<T: DeserializeOwned>(&self, key: &[u8]) -> Option<T> {
        let bytes = self.tree.get(key).ok()??;
        bincode::deserialize(&bytes).ok()
    }

    fn persist<T: Serialize>(&self, key: &[u8], value: &T) -> EngineResult<()> {
        let bytes = bincode::serialize(value).map_err(EngineError::from)?;
        self.tree.insert(key, bytes)?;
        self.tree.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store() -> ConfigStore {
        let db = sled::Config::new().temporary(true).open().unwrap();
        ConfigStore::new(db.open_tree("config").unwrap())
    }

    #[test]
    fn defaults_match_documented_fallbacks() {
        let cfg = RateConfig::default();
        assert_eq!(cfg.deposit_commission_bps, 100);
        assert_eq!(cfg.withdrawal_tiers.len(), 3);
        assert_eq!(cfg.withdrawal_tiers[0].fee, 1_00);
        assert_eq!(cfg.early_exit_penalty_bps, 500);
        assert_eq!(cfg.thb_per_kel, 1_000);
        assert_eq!(cfg.apy_schedule.first().unwrap().apy_bps, 1_200);
        assert_eq!(cfg.apy_schedule.last().unwrap().apy_bps, 400);
    }

    #[test]
    fn fresh_store_serves_defaults() {
        let store = temp_store();
        assert_eq!(store.rates().version, 0);
        assert!(store.pool().accounts.is_empty());
    }

    #[test]
    fn update_rates_bumps_version() {
        let store = temp_store();
        let patch = RateUpdate {
            deposit_commission_bps: Some(250),
            ..Default::default()
        };
        let updated = store.update_rates(&patch).unwrap();
        assert_eq!(updated.version, 1);
        assert_eq!(updated.deposit_commission_bps, 250);

        // Untouched fields survive.
        assert_eq!(updated.thb_per_kel, 1_000);
        assert_eq!(store.rates().version, 1);
    }

    #[test]
    fn update_rates_rejects_nonsense() {
        let store = temp_store();
        let patch = RateUpdate {
            deposit_commission_bps: Some(20_000),
            ..Default::default()
        };
        assert!(matches!(
            store.update_rates(&patch).unwrap_err(),
            EngineError::Validation(_)
        ));
        assert_eq!(store.rates().version, 0);

        let patch = RateUpdate {
            thb_per_kel: Some(0),
            ..Default::default()
        };
        assert!(store.update_rates(&patch).is_err());
    }

    #[test]
    fn update_pool_aborts_without_persisting_on_error() {
        let store = temp_store();
        store
            .update_pool(|pool| {
                pool.accounts.push(ReceivingAccount::new("a1", 1_000_00, 1));
                Ok(())
            })
            .unwrap();
        assert_eq!(store.pool().version, 1);

        let err = store
            .update_pool(|pool| {
                pool.accounts.clear();
                Err::<(), _>(EngineError::Conflict("nope".into()))
            })
            .unwrap_err();
        assert!(matches!(err, EngineError::Conflict(_)));

        // The failed closure's mutation never landed.
        let pool = store.pool();
        assert_eq!(pool.version, 1);
        assert_eq!(pool.accounts.len(), 1);
    }

    #[test]
    fn seed_defaults_is_idempotent() {
        let store = temp_store();
        store.seed_defaults().unwrap();
        store
            .update_rates(&RateUpdate {
                thb_per_kel: Some(2_000),
                ..Default::default()
            })
            .unwrap();

        // Re-seeding must not clobber live records.
        store.seed_defaults().unwrap();
        assert_eq!(store.rates().thb_per_kel, 2_000);
    }

    #[test]
    fn limits_lookup_by_class() {
        let cfg = RateConfig::default();
        assert!(cfg.limits.policy_for(OperationClass::Withdrawal).is_some());
        assert!(cfg.limits.policy_for(OperationClass::Query).is_none());
    }
}
