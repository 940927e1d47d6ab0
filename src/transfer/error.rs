//! Transfer Error Types
//!
//! Every failed transfer returns exactly one of these. A failed call never
//! leaves a partial mutation behind: the transaction is rolled back before
//! the error reaches the caller.

use std::fmt;

use thiserror::Error;

use crate::core_types::{AccountId, Amount};
use crate::store::StoreError;

/// Why a request was rejected before touching the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidTransfer {
    /// Amount is zero or negative
    NonPositiveAmount(Amount),
    /// Source and destination are the same account
    SameAccount(AccountId),
}

impl fmt::Display for InvalidTransfer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidTransfer::NonPositiveAmount(amount) => {
                write!(f, "amount must be greater than zero, got {amount}")
            }
            InvalidTransfer::SameAccount(account_id) => {
                write!(f, "source and destination are both account {account_id}")
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    /// Rejected before any store access; no transaction was opened
    #[error("Invalid amount: {0}")]
    InvalidAmount(InvalidTransfer),

    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    #[error(
        "Insufficient funds in account {account_id}: balance {balance}, requested {requested}"
    )]
    InsufficientFunds {
        account_id: AccountId,
        balance: Amount,
        requested: Amount,
    },

    /// Store-level failure, rolled back where still possible
    #[error("Store failure: {0}")]
    StoreFailure(#[from] StoreError),
}

impl TransferError {
    /// Stable error code for callers and logs
    pub fn code(&self) -> &'static str {
        match self {
            TransferError::InvalidAmount(_) => "INVALID_AMOUNT",
            TransferError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            TransferError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            TransferError::StoreFailure(_) => "STORE_FAILURE",
        }
    }

    /// A caller-side retry of the same request could succeed.
    ///
    /// The engine never retries on its own.
    pub fn is_transient(&self) -> bool {
        match self {
            TransferError::StoreFailure(e) => {
                e.is_lock_timeout() || e.is_deadlock() || e.is_connectivity()
            }
            _ => false,
        }
    }

    /// The underlying store error, if this is a store failure
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            TransferError::StoreFailure(e) => Some(e),
            _ => None,
        }
    }
}
