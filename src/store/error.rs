//! Store Error Types
//!
//! Failures raised by an account store backend. The transfer engine wraps
//! these verbatim; classification helpers let callers decide whether a
//! retry on their side could succeed.

use thiserror::Error;

use crate::core_types::AccountId;

/// PostgreSQL SQLSTATE: deadlock_detected
const SQLSTATE_DEADLOCK: &str = "40P01";
/// PostgreSQL SQLSTATE: lock_not_available (raised by `lock_timeout`)
const SQLSTATE_LOCK_NOT_AVAILABLE: &str = "55P03";
/// PostgreSQL SQLSTATE: query_canceled (raised by `statement_timeout`)
const SQLSTATE_QUERY_CANCELED: &str = "57014";
/// PostgreSQL SQLSTATE: check_violation (`CHECK (balance >= 0)`)
const SQLSTATE_CHECK_VIOLATION: &str = "23514";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Lock wait on account {account_id} timed out after {waited_ms}ms")]
    LockTimeout { account_id: AccountId, waited_ms: u64 },

    #[error("Account {0} has no row to update")]
    RowMissing(AccountId),

    #[error("Constraint violation on account {account_id}: {detail}")]
    ConstraintViolation {
        account_id: AccountId,
        detail: String,
    },

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// SQLSTATE of the underlying database error, if any
    pub fn sqlstate(&self) -> Option<String> {
        match self {
            StoreError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().map(|c| c.into_owned())
            }
            _ => None,
        }
    }

    /// Lock wait exceeded the store's timeout
    pub fn is_lock_timeout(&self) -> bool {
        match self {
            StoreError::LockTimeout { .. } => true,
            StoreError::Database(_) => matches!(
                self.sqlstate().as_deref(),
                Some(SQLSTATE_LOCK_NOT_AVAILABLE) | Some(SQLSTATE_QUERY_CANCELED)
            ),
            _ => false,
        }
    }

    /// The store aborted this transaction to break a wait-for cycle
    pub fn is_deadlock(&self) -> bool {
        self.sqlstate().as_deref() == Some(SQLSTATE_DEADLOCK)
    }

    pub fn is_constraint_violation(&self) -> bool {
        match self {
            StoreError::ConstraintViolation { .. } | StoreError::RowMissing(_) => true,
            StoreError::Database(_) => {
                self.sqlstate().as_deref() == Some(SQLSTATE_CHECK_VIOLATION)
            }
            _ => false,
        }
    }

    /// Connection-level failure (network, pool exhausted, store down)
    pub fn is_connectivity(&self) -> bool {
        match self {
            StoreError::Unavailable(_) => true,
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}
