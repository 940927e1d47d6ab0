//! In-Memory Account Store
//!
//! Row-locking store held in process memory. Each account row sits behind
//! its own async mutex; a transaction keeps the owned guards of every row it
//! touched until commit, rollback or drop. Mutations are staged in the
//! transaction and written through the guards only at commit, so an aborted
//! transaction leaves nothing behind.
//!
//! Behaves like `SELECT ... FOR UPDATE` with a `lock_timeout`: a conflicting
//! lock request waits, and gives up with [`StoreError::LockTimeout`] once the
//! configured timeout elapses. There is no deadlock detector; a wait-for
//! cycle only ends when one side times out.
//!
//! Supports fault injection, and can record the order of row-lock
//! acquisitions (off unless enabled with
//! [`InMemoryAccountStore::with_lock_trace`]) to audit the transfer engine.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex as RowLock, OwnedMutexGuard};

use super::{AccountStore, AccountTx, StoreError};
use crate::core_types::{AccountId, Amount};

/// Matches the lock_timeout the PostgreSQL harness runs with
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

/// One row-lock grant: transaction `tx_id` acquired `account_id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockEvent {
    pub tx_id: u64,
    pub account_id: AccountId,
}

struct Shared {
    rows: DashMap<AccountId, Arc<RowLock<Amount>>>,
    lock_timeout: Duration,
    next_tx_id: AtomicU64,
    trace_locks: AtomicBool,
    lock_trace: Mutex<Vec<LockEvent>>,
    // Fault injection
    unavailable: AtomicBool,
    fail_next_commit: AtomicBool,
    fail_adjust_on: Mutex<Option<AccountId>>,
}

impl Shared {
    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection lost".to_string()));
        }
        Ok(())
    }

    fn record_lock(&self, event: LockEvent) {
        if !self.trace_locks.load(Ordering::Relaxed) {
            return;
        }
        self.lock_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }

    fn adjust_fails_for(&self, account_id: AccountId) -> bool {
        *self
            .fail_adjust_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            == Some(account_id)
    }
}

/// In-process account store with per-row exclusive locks
#[derive(Clone)]
pub struct InMemoryAccountStore {
    shared: Arc<Shared>,
}

impl InMemoryAccountStore {
    /// Create an empty store
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                rows: DashMap::new(),
                lock_timeout,
                next_tx_id: AtomicU64::new(1),
                trace_locks: AtomicBool::new(false),
                lock_trace: Mutex::new(Vec::new()),
                unavailable: AtomicBool::new(false),
                fail_next_commit: AtomicBool::new(false),
                fail_adjust_on: Mutex::new(None),
            }),
        }
    }

    /// Create a store seeded with `(account_id, balance)` rows
    pub fn with_accounts<I>(accounts: I, lock_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = (AccountId, Amount)>,
    {
        let store = Self::new(lock_timeout);
        for (account_id, balance) in accounts {
            store.insert_account(account_id, balance);
        }
        store
    }

    /// Enable or disable recording of row-lock grants
    pub fn with_lock_trace(self, enabled: bool) -> Self {
        self.shared.trace_locks.store(enabled, Ordering::Relaxed);
        self
    }

    /// Insert or replace an account row
    ///
    /// A replaced row gets a fresh lock; transactions still holding the old
    /// row's lock keep writing to the detached row.
    pub fn insert_account(&self, account_id: AccountId, balance: Amount) {
        self.shared
            .rows
            .insert(account_id, Arc::new(RowLock::new(balance)));
    }

    /// Drop every row and the lock trace, then seed new rows
    pub fn reset<I>(&self, accounts: I)
    where
        I: IntoIterator<Item = (AccountId, Amount)>,
    {
        self.shared.rows.clear();
        self.clear_lock_trace();
        for (account_id, balance) in accounts {
            self.insert_account(account_id, balance);
        }
    }

    /// Committed balance of one account, waiting for any in-flight lock
    pub async fn balance(&self, account_id: AccountId) -> Option<Amount> {
        let row = self.shared.rows.get(&account_id).map(|r| r.value().clone())?;
        let balance = *row.lock().await;
        Some(balance)
    }

    /// Committed balances of every account, keyed by id
    pub async fn balances(&self) -> BTreeMap<AccountId, Amount> {
        let mut rows: Vec<(AccountId, Arc<RowLock<Amount>>)> = self
            .shared
            .rows
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        rows.sort_unstable_by_key(|(account_id, _)| *account_id);

        let mut balances = BTreeMap::new();
        for (account_id, row) in rows {
            balances.insert(account_id, *row.lock().await);
        }
        balances
    }

    /// Sum of all committed balances
    pub async fn total_balance(&self) -> i128 {
        self.balances()
            .await
            .values()
            .map(|&balance| balance as i128)
            .sum()
    }

    /// Every recorded row-lock grant, in grant order
    pub fn lock_trace(&self) -> Vec<LockEvent> {
        self.shared
            .lock_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Row-lock grants grouped by transaction, each in acquisition order
    pub fn locks_by_tx(&self) -> BTreeMap<u64, Vec<AccountId>> {
        let mut grouped: BTreeMap<u64, Vec<AccountId>> = BTreeMap::new();
        for event in self.lock_trace() {
            grouped.entry(event.tx_id).or_default().push(event.account_id);
        }
        grouped
    }

    pub fn clear_lock_trace(&self) {
        self.shared
            .lock_trace
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Simulate losing the connection: every store call fails until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make the next commit fail; its transaction is discarded
    pub fn fail_next_commit(&self) {
        self.shared.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Make every balance mutation of `account_id` fail (`None` clears)
    pub fn fail_adjust_on(&self, account_id: Option<AccountId>) {
        *self
            .shared
            .fail_adjust_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = account_id;
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

#[async_trait]
impl AccountStore for InMemoryAccountStore {
    type Tx = InMemoryTx;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        self.shared.check_available()?;
        Ok(InMemoryTx {
            id: self.shared.next_tx_id.fetch_add(1, Ordering::SeqCst),
            shared: self.shared.clone(),
            held: BTreeMap::new(),
            staged: BTreeMap::new(),
        })
    }
}

/// Open in-memory transaction
pub struct InMemoryTx {
    id: u64,
    shared: Arc<Shared>,
    held: BTreeMap<AccountId, OwnedMutexGuard<Amount>>,
    staged: BTreeMap<AccountId, Amount>,
}

impl InMemoryTx {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Balance as seen by this transaction, if the row is already held
    fn visible_balance(&self, account_id: AccountId) -> Option<Amount> {
        self.staged
            .get(&account_id)
            .copied()
            .or_else(|| self.held.get(&account_id).map(|guard| **guard))
    }

    async fn acquire(&mut self, account_id: AccountId) -> Result<Option<Amount>, StoreError> {
        if let Some(balance) = self.visible_balance(account_id) {
            return Ok(Some(balance));
        }

        let row = match self.shared.rows.get(&account_id) {
            Some(entry) => entry.value().clone(),
            None => return Ok(None),
        };

        let lock_timeout = self.shared.lock_timeout;
        let guard = tokio::time::timeout(lock_timeout, row.lock_owned())
            .await
            .map_err(|_| StoreError::LockTimeout {
                account_id,
                waited_ms: lock_timeout.as_millis() as u64,
            })?;

        self.shared.record_lock(LockEvent {
            tx_id: self.id,
            account_id,
        });

        let balance = *guard;
        self.held.insert(account_id, guard);
        Ok(Some(balance))
    }
}

impl fmt::Debug for InMemoryTx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTx")
            .field("id", &self.id)
            .field("held", &self.held.keys().collect::<Vec<_>>())
            .field("staged", &self.staged)
            .finish()
    }
}

#[async_trait]
impl AccountTx for InMemoryTx {
    async fn lock_row_for_update(
        &mut self,
        account_id: AccountId,
    ) -> Result<Option<Amount>, StoreError> {
        self.shared.check_available()?;
        self.acquire(account_id).await
    }

    async fn adjust_balance(
        &mut self,
        account_id: AccountId,
        delta: Amount,
    ) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if self.shared.adjust_fails_for(account_id) {
            return Err(StoreError::Unavailable(format!(
                "injected failure updating account {account_id}"
            )));
        }

        // Like UPDATE, mutating an unlocked row takes its lock first.
        let current = self
            .acquire(account_id)
            .await?
            .ok_or(StoreError::RowMissing(account_id))?;

        let next = current
            .checked_add(delta)
            .ok_or_else(|| StoreError::ConstraintViolation {
                account_id,
                detail: "balance overflow".to_string(),
            })?;
        if next < 0 {
            return Err(StoreError::ConstraintViolation {
                account_id,
                detail: format!("balance would become {next}"),
            });
        }

        self.staged.insert(account_id, next);
        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.shared.check_available()?;
        if self.shared.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "injected commit failure".to_string(),
            ));
        }

        let staged = std::mem::take(&mut self.staged);
        for (account_id, balance) in staged {
            if let Some(guard) = self.held.get_mut(&account_id) {
                **guard = balance;
            }
        }
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}
