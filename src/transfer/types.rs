//! Transfer request and receipt

use serde::{Deserialize, Serialize};

use super::error::InvalidTransfer;
use crate::core_types::{AccountId, Amount};

/// A request to move `amount` from one account to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
}

impl TransferRequest {
    pub fn new(from: AccountId, to: AccountId, amount: Amount) -> Self {
        Self { from, to, amount }
    }

    /// Check the request shape. Needs no store access.
    pub fn validate(&self) -> Result<(), InvalidTransfer> {
        if self.amount <= 0 {
            return Err(InvalidTransfer::NonPositiveAmount(self.amount));
        }
        if self.from == self.to {
            return Err(InvalidTransfer::SameAccount(self.from));
        }
        Ok(())
    }
}

/// Outcome of a committed transfer
///
/// Balances are the post-transfer values observed under lock inside the
/// committing transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Amount,
    pub from_balance: Amount,
    pub to_balance: Amount,
}
