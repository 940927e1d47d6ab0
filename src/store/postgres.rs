//! PostgreSQL Account Store
//!
//! Row locks are `SELECT ... FOR UPDATE` on `accounts`. Lock waits are bounded
//! by `lock_timeout`, applied with `SET LOCAL` so it only lives as long as the
//! transaction.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::debug;

use super::{AccountStore, AccountTx, StoreError};
use crate::core_types::{AccountId, Amount};

/// PostgreSQL-backed account store
#[derive(Clone)]
pub struct PgAccountStore {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl PgAccountStore {
    /// Create a store over an existing pool, using the server's lock timeout
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_timeout: None,
        }
    }

    /// Bound every row-lock wait in transactions opened by this store
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = Some(lock_timeout);
        self
    }
}

#[async_trait]
impl AccountStore for PgAccountStore {
    type Tx = PgAccountTx;

    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> Result<PgAccountTx, StoreError> {
        let mut tx = self.pool.begin().await?;

        if let Some(lock_timeout) = self.lock_timeout {
            // SET does not take bind parameters; the value is an integer.
            let stmt = format!("SET LOCAL lock_timeout = '{}ms'", lock_timeout.as_millis());
            sqlx::query(&stmt).execute(&mut *tx).await?;
        }

        Ok(PgAccountTx { tx })
    }
}

/// Open PostgreSQL transaction
///
/// Rolled back by sqlx when dropped without `commit`.
pub struct PgAccountTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountTx for PgAccountTx {
    async fn lock_row_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<Amount>, StoreError> {
        let balance: Option<i64> =
            sqlx::query_scalar("SELECT balance FROM accounts WHERE id = $1 FOR UPDATE")
                .bind(account_id)
                .fetch_optional(&mut *self.tx)
                .await?;

        debug!(account_id, found = balance.is_some(), "Row locked");
        Ok(balance)
    }

    async fn adjust_balance(
        &mut self,
        account_id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE accounts SET balance = balance + $1 WHERE id = $2")
            .bind(delta)
            .bind(account_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RowMissing(account_id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await?;
        Ok(())
    }
}
