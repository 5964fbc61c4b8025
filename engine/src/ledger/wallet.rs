//! Wallet records and balance mutations.
//!
//! One [`Wallet`] exists per (user, currency). Two numbers matter:
//! `balance` and `frozen_balance`. A reservation debits `balance` and
//! records the in-flight portion in `frozen_balance`; settlement clears
//! the frozen marker (the debit already happened), and compensation
//! restores both. `available = balance - frozen_balance` is what new
//! reservations may spend.
//!
//! All mutations use checked arithmetic and fail without partial effect.
//! The store applies them inside a serializable transaction, so a failed
//! check here aborts the whole atomic unit.
//!
//! Wallets are never deleted — deactivation (`active = false`) is the
//! only way out, so history stays resolvable forever.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::transaction::Currency;
use crate::error::{EngineError, EngineResult};

/// A single user's holdings in a single currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    /// Owning user.
    pub user_id: String,
    /// Denomination of both balances.
    pub currency: Currency,
    /// Total balance in minor units, net of in-flight debits.
    pub balance: u64,
    /// Minor units reserved by in-flight operations. Already deducted
    /// from `balance`; cleared on settle, restored on refund.
    pub frozen_balance: u64,
    /// Deposit address shown to the user.
    pub address: String,
    /// Deactivated wallets reject outgoing operations and transfers in.
    pub active: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Timestamp of the last balance-affecting mutation.
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Creates an empty, active wallet.
    pub fn new(user_id: &str, currency: Currency, address: String) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.to_string(),
            currency,
            balance: 0,
            frozen_balance: 0,
            address,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    /// Spendable balance: what new reservations may draw on.
    pub fn available(&self) -> u64 {
        self.balance.saturating_sub(self.frozen_balance)
    }

    /// Reserves `amount + fee`: debits the balance and marks the same
    /// total as frozen. Fails with `InsufficientFunds` if the available
    /// balance cannot cover it.
    pub fn reserve(&mut self, amount: u64, fee: u64) -> EngineResult<()> {
        let total = amount
            .checked_add(fee)
            .ok_or_else(|| EngineError::internal("reservation amount overflow"))?;
        if self.available() < total {
            return Err(EngineError::InsufficientFunds {
                available: self.available(),
                requested: total,
            });
        }
        self.balance -= total;
        self.frozen_balance = self
            .frozen_balance
            .checked_add(total)
            .ok_or_else(|| EngineError::internal("frozen balance overflow"))?;
        Ok(())
    }

    /// Clears a frozen reservation whose funds are consumed without any
    /// further credit to this wallet (transfer principal handed to the
    /// recipient). The balance debit already happened at reserve time.
    pub fn release(&mut self, amount: u64) -> EngineResult<()> {
        self.unfreeze(amount)
    }

    /// Clears a frozen reservation whose funds left the system
    /// permanently (payout settled on the external rail). Identical
    /// arithmetic to [`release`](Self::release); kept separate because
    /// the intent differs and call sites read better for it.
    pub fn settle(&mut self, amount: u64) -> EngineResult<()> {
        self.unfreeze(amount)
    }

    /// Compensation: restores a reservation exactly, adding the amount
    /// back to the balance and clearing the frozen marker.
    pub fn refund(&mut self, amount: u64) -> EngineResult<()> {
        self.unfreeze(amount)?;
        self.credit(amount)
    }

    /// Credits inbound funds (confirmed deposit, transfer receipt,
    /// staking reward, fee reversal).
    pub fn credit(&mut self, amount: u64) -> EngineResult<()> {
        self.balance = self
            .balance
            .checked_add(amount)
            .ok_or_else(|| EngineError::internal("balance overflow on credit"))?;
        Ok(())
    }

    /// Debits a fee directly from the balance with no frozen component.
    /// Used when a fee is realized at initiation time, alongside (not
    /// inside) the principal reservation.
    pub fn charge(&mut self, amount: u64) -> EngineResult<()> {
        if self.available() < amount {
            return Err(EngineError::InsufficientFunds {
                available: self.available(),
                requested: amount,
            });
        }
        self.balance -= amount;
        Ok(())
    }

    fn unfreeze(&mut self, amount: u64) -> EngineResult<()> {
        self.frozen_balance = self.frozen_balance.checked_sub(amount).ok_or_else(|| {
            EngineError::internal(format!(
                "frozen balance underflow for {}: frozen {}, clearing {}",
                self.user_id, self.frozen_balance, amount
            ))
        })?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn funded(balance: u64) -> Wallet {
        let mut w = Wallet::new("alice", Currency::Kel, "kel:test".into());
        w.credit(balance).unwrap();
        w
    }

    #[test]
    fn reserve_debits_and_freezes() {
        let mut w = funded(1000_00);
        w.reserve(200_00, 2_00).unwrap();
        assert_eq!(w.balance, 798_00);
        assert_eq!(w.frozen_balance, 202_00);
        assert_eq!(w.available(), 596_00);
    }

    #[test]
    fn reserve_rejects_overdraw() {
        let mut w = funded(100_00);
        let err = w.reserve(100_00, 1_00).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientFunds {
                available: 100_00,
                requested: 101_00
            }
        ));
        // No partial effect.
        assert_eq!(w.balance, 100_00);
        assert_eq!(w.frozen_balance, 0);
    }

    #[test]
    fn settle_clears_frozen_only() {
        let mut w = funded(1000_00);
        w.reserve(200_00, 0).unwrap();
        w.settle(200_00).unwrap();
        assert_eq!(w.balance, 800_00);
        assert_eq!(w.frozen_balance, 0);
    }

    #[test]
    fn refund_restores_exactly() {
        let mut w = funded(1000_00);
        w.reserve(200_00, 0).unwrap();
        w.refund(200_00).unwrap();
        assert_eq!(w.balance, 1000_00);
        assert_eq!(w.frozen_balance, 0);
    }

    #[test]
    fn charge_debits_without_freezing() {
        let mut w = funded(1000_00);
        w.charge(2_00).unwrap();
        assert_eq!(w.balance, 998_00);
        assert_eq!(w.frozen_balance, 0);
    }

    #[test]
    fn charge_respects_available_not_balance() {
        let mut w = funded(100_00);
        w.reserve(90_00, 0).unwrap();
        // balance is 10_00, frozen 90_00, available 0: nothing to charge.
        let err = w.charge(1_00).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));
    }

    #[test]
    fn unfreeze_underflow_is_internal() {
        let mut w = funded(100_00);
        let err = w.settle(1).unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }

    #[test]
    fn withdrawal_initiation_shape() {
        // Scenario from the settlement contract: withdraw 200 with fee 2
        // from a balance of 1000. Principal reserved, fee charged flat.
        let mut w = funded(1000_00);
        w.reserve(200_00, 0).unwrap();
        w.charge(2_00).unwrap();
        assert_eq!(w.balance, 798_00);
        assert_eq!(w.frozen_balance, 200_00);

        // Payout settles: frozen clears, balance untouched.
        w.settle(200_00).unwrap();
        assert_eq!(w.balance, 798_00);
        assert_eq!(w.frozen_balance, 0);
    }

    #[test]
    fn withdrawal_compensation_shape() {
        let mut w = funded(1000_00);
        w.reserve(200_00, 0).unwrap();
        w.charge(2_00).unwrap();

        // Rail rejected: refund principal, reverse the fee.
        w.refund(200_00).unwrap();
        w.credit(2_00).unwrap();
        assert_eq!(w.balance, 1000_00);
        assert_eq!(w.frozen_balance, 0);
    }
}
