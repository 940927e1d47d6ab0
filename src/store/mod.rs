//! Account Store Adapters
//!
//! Transaction-scoped access to account rows. A backend provides:
//! - `begin` - open a transaction
//! - `lock_row_for_update` - exclusive row lock, blocking until granted
//! - `adjust_balance` - apply a signed delta inside the transaction
//! - `commit` / `rollback` - close the transaction and release every lock
//!
//! Dropping a transaction handle without committing rolls it back, so locks
//! are released on every exit path.

pub mod error;
pub mod memory;
pub mod postgres;

pub use error::StoreError;
pub use memory::{InMemoryAccountStore, InMemoryTx, LockEvent};
pub use postgres::{PgAccountStore, PgAccountTx};

use async_trait::async_trait;

use crate::core_types::{AccountId, Amount};

/// Transactional account store
#[async_trait]
pub trait AccountStore: Send + Sync {
    type Tx: AccountTx;

    /// Backend name for logging
    fn name(&self) -> &'static str;

    /// Open a new transaction
    async fn begin(&self) -> Result<Self::Tx, StoreError>;
}

/// One open transaction against an [`AccountStore`]
#[async_trait]
pub trait AccountTx: Send {
    /// Acquire an exclusive lock on the account row and read its balance.
    ///
    /// Blocks until any conflicting lock held by another transaction is
    /// released, or the store's lock-wait timeout fires. Returns `None` if
    /// the row does not exist. Locking a row this transaction already holds
    /// returns immediately with the balance as seen by this transaction.
    async fn lock_row_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<Amount>, StoreError>;

    /// Add `delta` (negative for a debit) to the account balance.
    async fn adjust_balance(&mut self, account_id: AccountId, delta: Amount)
    -> Result<(), StoreError>;

    /// Make every mutation durable and release all locks
    async fn commit(self) -> Result<(), StoreError>;

    /// Discard every mutation and release all locks
    async fn rollback(self) -> Result<(), StoreError>;
}
