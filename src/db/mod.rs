//! Database connection management
//!
//! Pool setup for the PostgreSQL account store, plus the provisioning helpers
//! tests and the stress harness use to reset and inspect `accounts`. The
//! transfer engine itself never calls the provisioning helpers.

use std::collections::BTreeMap;
use std::time::Duration;

use sqlx::Executor;
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::DatabaseConfig;
use crate::core_types::{AccountId, Amount};
use crate::store::PgAccountStore;

/// Drops and recreates `accounts`
const SCHEMA_SQL: &str = include_str!("../../sql/schema.sql");

/// PostgreSQL database connection pool
pub struct Database {
    pool: PgPool,
    lock_timeout: Option<Duration>,
}

impl Database {
    /// Create a new database connection pool
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, sqlx::Error> {
        let deadlock_timeout_ms = config.deadlock_timeout_ms;

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout())
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if let Some(ms) = deadlock_timeout_ms {
                        let stmt = format!("SET deadlock_timeout = '{}ms'", ms);
                        conn.execute(stmt.as_str()).await?;
                    }
                    Ok(())
                })
            })
            .connect(&config.url)
            .await?;

        tracing::info!(
            max_connections = config.max_connections,
            lock_timeout_ms = ?config.lock_timeout_ms,
            "PostgreSQL connection pool established"
        );
        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout(),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Account store over this pool, with the configured lock timeout
    pub fn account_store(&self) -> PgAccountStore {
        let store = PgAccountStore::new(self.pool.clone());
        match self.lock_timeout {
            Some(lock_timeout) => store.with_lock_timeout(lock_timeout),
            None => store,
        }
    }

    /// Check database health
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Drop and recreate the `accounts` table
    pub async fn reset_schema(&self) -> Result<(), sqlx::Error> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Insert accounts, overwriting the balance of existing ids
    pub async fn seed_accounts(&self, accounts: &[(AccountId, Amount)]) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        for &(account_id, balance) in accounts {
            sqlx::query(
                "INSERT INTO accounts (id, balance) VALUES ($1, $2)
                 ON CONFLICT (id) DO UPDATE SET balance = EXCLUDED.balance",
            )
            .bind(account_id)
            .bind(balance)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Fresh schema seeded with `accounts`
    pub async fn reset_accounts(&self, accounts: &[(AccountId, Amount)]) -> Result<(), sqlx::Error> {
        self.reset_schema().await?;
        self.seed_accounts(accounts).await
    }

    /// Committed balances keyed by account id
    pub async fn balances(&self) -> Result<BTreeMap<AccountId, Amount>, sqlx::Error> {
        let rows: Vec<(i64, i64)> = sqlx::query_as("SELECT id, balance FROM accounts ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    /// Sum of all committed balances
    pub async fn total_balance(&self) -> Result<i128, sqlx::Error> {
        Ok(self
            .balances()
            .await?
            .values()
            .map(|&balance| balance as i128)
            .sum())
    }
}
