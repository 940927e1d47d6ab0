//! Transfer Engine
//!
//! Owns the transaction boundary of a single transfer:
//!
//! ```text
//! validate ─▶ BEGIN ─▶ lock first ─▶ lock second ─▶ check funds ─▶ debit/credit ─▶ COMMIT
//!                          │              │               │              │
//!                          └──────────────┴───────────────┴──────────────┴──▶ ROLLBACK
//! ```
//!
//! `first`/`second` come from [`LockOrder`], never from the transfer
//! direction. Both rows are held before the source balance is checked, so
//! the check and the debit see the same value.

use std::sync::Arc;

use tracing::{debug, warn};

use super::error::TransferError;
use super::types::{TransferReceipt, TransferRequest};
use crate::core_types::{AccountId, Amount};
use crate::ordering::LockOrder;
use crate::store::{AccountStore, AccountTx};

/// Concurrent transfer engine over an [`AccountStore`]
///
/// Holds no state between calls; cloning shares the store.
pub struct TransferEngine<S> {
    store: Arc<S>,
}

impl<S> Clone for TransferEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: AccountStore> TransferEngine<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Move `amount` from `from` to `to` atomically
    pub async fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Amount,
    ) -> Result<TransferReceipt, TransferError> {
        self.execute(&TransferRequest::new(from, to, amount)).await
    }

    /// Execute a transfer request
    ///
    /// Any error means no balance changed.
    pub async fn execute(&self, req: &TransferRequest) -> Result<TransferReceipt, TransferError> {
        if let Err(reason) = req.validate() {
            warn!(from = req.from, to = req.to, amount = req.amount, %reason, "Transfer rejected");
            return Err(TransferError::InvalidAmount(reason));
        }

        let backend = self.store.name();
        let mut tx = self.store.begin().await.inspect_err(|e| {
            warn!(backend, from = req.from, to = req.to, error = %e, "Begin failed");
        })?;

        match Self::apply(&mut tx, req).await {
            Ok(receipt) => {
                tx.commit().await.inspect_err(|e| {
                    warn!(backend, from = req.from, to = req.to, error = %e, "Commit failed");
                })?;
                debug!(
                    backend,
                    from = req.from,
                    to = req.to,
                    amount = req.amount,
                    from_balance = receipt.from_balance,
                    to_balance = receipt.to_balance,
                    "Transfer committed"
                );
                Ok(receipt)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(
                        backend,
                        from = req.from,
                        to = req.to,
                        error = %rollback_err,
                        "Rollback failed; store discards the transaction"
                    );
                }
                warn!(
                    backend,
                    from = req.from,
                    to = req.to,
                    amount = req.amount,
                    code = e.code(),
                    error = %e,
                    "Transfer failed"
                );
                Err(e)
            }
        }
    }

    /// Lock, check and mutate inside an open transaction
    async fn apply(
        tx: &mut S::Tx,
        req: &TransferRequest,
    ) -> Result<TransferReceipt, TransferError> {
        let order = LockOrder::pair(req.from, req.to);

        let mut from_balance = 0;
        let mut to_balance = 0;
        for account_id in &order {
            let balance = tx
                .lock_row_for_update(account_id)
                .await?
                .ok_or(TransferError::AccountNotFound(account_id))?;

            if account_id == req.from {
                from_balance = balance;
            } else {
                to_balance = balance;
            }
        }
        debug!(from = req.from, to = req.to, order = ?order.as_slice(), "Rows locked");

        if from_balance < req.amount {
            return Err(TransferError::InsufficientFunds {
                account_id: req.from,
                balance: from_balance,
                requested: req.amount,
            });
        }

        tx.adjust_balance(req.from, -req.amount).await?;
        tx.adjust_balance(req.to, req.amount).await?;

        Ok(TransferReceipt {
            from: req.from,
            to: req.to,
            amount: req.amount,
            from_balance: from_balance - req.amount,
            to_balance: to_balance + req.amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tokio::sync::Barrier;

    use super::*;
    use crate::store::{InMemoryAccountStore, StoreError};
    use crate::transfer::error::InvalidTransfer;

    const SCENARIO: [(AccountId, AccountId, Amount); 5] =
        [(1, 2, 300), (2, 1, 200), (2, 3, 400), (3, 2, 150), (1, 3, 100)];

    fn engine_with(lock_timeout: Duration) -> TransferEngine<InMemoryAccountStore> {
        TransferEngine::new(
            InMemoryAccountStore::with_accounts([(1, 1000), (2, 1000), (3, 1000)], lock_timeout)
                .with_lock_trace(true),
        )
    }

    fn engine() -> TransferEngine<InMemoryAccountStore> {
        engine_with(Duration::from_secs(2))
    }

    fn expected_final() -> BTreeMap<AccountId, Amount> {
        BTreeMap::from([(1, 800), (2, 850), (3, 1350)])
    }

    // ========================================================================
    // Scenarios
    // ========================================================================

    #[tokio::test]
    async fn test_sequential_scenario_final_balances() {
        let engine = engine();
        for (from, to, amount) in SCENARIO {
            engine.transfer(from, to, amount).await.unwrap();
        }
        assert_eq!(engine.store().balances().await, expected_final());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 5)]
    async fn test_concurrent_scenario_matches_sequential() {
        let engine = engine();
        let barrier = Arc::new(Barrier::new(SCENARIO.len()));

        let handles: Vec<_> = SCENARIO
            .into_iter()
            .map(|(from, to, amount)| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    engine.transfer(from, to, amount).await
                })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap();
            assert!(result.is_ok(), "transfer failed: {:?}", result);
        }
        assert_eq!(engine.store().balances().await, expected_final());
    }

    #[tokio::test]
    async fn test_receipt_reports_post_transfer_balances() {
        let engine = engine();
        let receipt = engine.transfer(3, 1, 250).await.unwrap();
        assert_eq!(
            receipt,
            TransferReceipt {
                from: 3,
                to: 1,
                amount: 250,
                from_balance: 750,
                to_balance: 1250,
            }
        );
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balances_unchanged() {
        let engine = engine();
        let before = engine.store().balances().await;

        let err = engine.transfer(1, 2, 10_000).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::InsufficientFunds {
                account_id: 1,
                balance: 1000,
                requested: 10_000
            }
        ));
        assert_eq!(engine.store().balances().await, before);
    }

    #[tokio::test]
    async fn test_exact_balance_drains_to_zero() {
        let engine = engine();
        let receipt = engine.transfer(2, 3, 1000).await.unwrap();
        assert_eq!(receipt.from_balance, 0);
        assert_eq!(engine.store().balance(2).await, Some(0));
    }

    #[tokio::test]
    async fn test_same_account_rejected_before_store_access() {
        let engine = engine();
        // Even an unreachable store must not be touched
        engine.store().set_unavailable(true);

        let err = engine.transfer(1, 1, 50).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidAmount(InvalidTransfer::SameAccount(1))
        ));
        assert!(engine.store().lock_trace().is_empty());

        engine.store().set_unavailable(false);
        assert_eq!(engine.store().balance(1).await, Some(1000));
    }

    #[tokio::test]
    async fn test_non_positive_amount_rejected() {
        let engine = engine();
        for amount in [0, -1, Amount::MIN] {
            let err = engine.transfer(1, 2, amount).await.unwrap_err();
            assert!(matches!(
                err,
                TransferError::InvalidAmount(InvalidTransfer::NonPositiveAmount(a)) if a == amount
            ));
        }
        assert!(engine.store().lock_trace().is_empty());
    }

    #[tokio::test]
    async fn test_missing_account_leaves_balances_unchanged() {
        let engine = engine();
        let before = engine.store().balances().await;

        // Missing destination, locked second
        let err = engine.transfer(1, 99, 10).await.unwrap_err();
        assert!(matches!(err, TransferError::AccountNotFound(99)));

        // Missing source, locked first
        let err = engine.transfer(0, 2, 10).await.unwrap_err();
        assert!(matches!(err, TransferError::AccountNotFound(0)));

        assert_eq!(engine.store().balances().await, before);
    }

    #[tokio::test]
    async fn test_missing_first_account_stops_before_second_lock() {
        let engine = engine();
        engine.transfer(3, -7, 10).await.unwrap_err();

        let locks: Vec<AccountId> = engine
            .store()
            .lock_trace()
            .iter()
            .map(|e| e.account_id)
            .collect();
        assert!(locks.is_empty(), "nothing to lock before the missing row");
    }

    // ========================================================================
    // Lock ordering
    // ========================================================================

    #[tokio::test]
    async fn test_locks_taken_in_ascending_order_regardless_of_direction() {
        let engine = engine();
        engine.transfer(3, 1, 10).await.unwrap();
        engine.transfer(1, 3, 10).await.unwrap();
        engine.transfer(2, 1, 10).await.unwrap();

        let by_tx = engine.store().locks_by_tx();
        assert_eq!(by_tx.len(), 3);
        for (tx_id, locks) in by_tx {
            let mut sorted = locks.clone();
            sorted.sort_unstable();
            assert_eq!(locks, sorted, "tx {tx_id} locked out of order");
            assert_eq!(locks.len(), 2);
        }
    }

    /// Locking in caller order (from, then to) lets opposing transfers wait
    /// on each other until the lock timeout fires.
    #[tokio::test]
    async fn test_caller_order_locking_deadlocks_without_canonical_order() {
        let store = InMemoryAccountStore::with_accounts(
            [(1, 1000), (2, 1000)],
            Duration::from_millis(100),
        );

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        a.lock_row_for_update(1).await.unwrap();
        b.lock_row_for_update(2).await.unwrap();

        let (ra, rb) = tokio::join!(a.lock_row_for_update(2), b.lock_row_for_update(1));
        let timeouts = [ra, rb]
            .into_iter()
            .filter(|r| matches!(r, Err(e) if e.is_lock_timeout()))
            .count();
        assert!(timeouts >= 1);
    }

    // ========================================================================
    // Atomicity under store faults
    // ========================================================================

    #[tokio::test]
    async fn test_failed_credit_rolls_back_debit() {
        let engine = engine();
        let before = engine.store().balances().await;
        engine.store().fail_adjust_on(Some(2));

        let err = engine.transfer(1, 2, 100).await.unwrap_err();
        assert!(matches!(err, TransferError::StoreFailure(_)));

        engine.store().fail_adjust_on(None);
        assert_eq!(engine.store().balances().await, before);
    }

    #[tokio::test]
    async fn test_failed_commit_changes_nothing() {
        let engine = engine();
        let before = engine.store().balances().await;
        engine.store().fail_next_commit();

        let err = engine.transfer(2, 3, 100).await.unwrap_err();
        assert_eq!(err.code(), "STORE_FAILURE");
        assert_eq!(engine.store().balances().await, before);

        // Nothing stays locked after the failure
        engine.transfer(2, 3, 100).await.unwrap();
        assert_eq!(engine.store().balance(3).await, Some(1100));
    }

    #[tokio::test]
    async fn test_unavailable_store_surfaces_transient_failure() {
        let engine = engine();
        engine.store().set_unavailable(true);

        let err = engine.transfer(1, 2, 1).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            err.store_error(),
            Some(StoreError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces_as_store_failure() {
        let engine = engine_with(Duration::from_millis(50));

        let mut holder = engine.store().begin().await.unwrap();
        holder.lock_row_for_update(2).await.unwrap();

        let err = engine.transfer(1, 2, 10).await.unwrap_err();
        assert!(err.store_error().is_some_and(|e| e.is_lock_timeout()));
        holder.rollback().await.unwrap();

        assert_eq!(engine.store().balance(1).await, Some(1000));
    }

    // ========================================================================
    // Concurrency properties
    // ========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_opposing_transfers_never_deadlock_and_conserve_total() {
        const ACCOUNTS: AccountId = 4;
        const WORKERS: u64 = 8;
        const PER_WORKER: usize = 50;

        let store = InMemoryAccountStore::with_accounts(
            (1..=ACCOUNTS).map(|id| (id, 500)),
            Duration::from_secs(2),
        );
        let engine = TransferEngine::new(store);
        let total_before = engine.store().total_balance().await;
        let barrier = Arc::new(Barrier::new(WORKERS as usize));

        let handles: Vec<_> = (0..WORKERS)
            .map(|worker| {
                let engine = engine.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    let mut rng = StdRng::seed_from_u64(worker);
                    let mut store_failures = 0;
                    barrier.wait().await;
                    for _ in 0..PER_WORKER {
                        let from = rng.gen_range(1..=ACCOUNTS);
                        let mut to = rng.gen_range(1..=ACCOUNTS);
                        if to == from {
                            to = from % ACCOUNTS + 1;
                        }
                        let amount = rng.gen_range(1..=200);
                        match engine.transfer(from, to, amount).await {
                            Ok(receipt) => assert!(receipt.from_balance >= 0),
                            Err(TransferError::InsufficientFunds { .. }) => {}
                            Err(e) => {
                                assert_eq!(e.code(), "STORE_FAILURE");
                                store_failures += 1;
                            }
                        }
                    }
                    store_failures
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 0, "no lock wait may time out");
        }

        let balances = engine.store().balances().await;
        assert!(balances.values().all(|&b| b >= 0));
        assert_eq!(engine.store().total_balance().await, total_before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_drain_never_goes_negative() {
        let store =
            InMemoryAccountStore::with_accounts([(1, 100), (2, 0), (3, 0)], Duration::from_secs(2));
        let engine = TransferEngine::new(store);
        let barrier = Arc::new(Barrier::new(2));

        let spawn_drain = |to: AccountId| {
            let engine = engine.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                engine.transfer(1, to, 80).await
            })
        };
        let a = spawn_drain(2);
        let b = spawn_drain(3);

        let results = [a.await.unwrap(), b.await.unwrap()];
        let ok = results.iter().filter(|r| r.is_ok()).count();
        let insufficient = results
            .iter()
            .filter(|r| matches!(r, Err(TransferError::InsufficientFunds { .. })))
            .count();
        assert_eq!((ok, insufficient), (1, 1));

        assert_eq!(engine.store().balance(1).await, Some(20));
        assert_eq!(engine.store().total_balance().await, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_same_account_rejected_under_concurrent_activity() {
        let engine = engine();
        let background: Vec<_> = (0..4)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let (from, to) = if i % 2 == 0 { (1, 2) } else { (2, 1) };
                    for _ in 0..20 {
                        let _ = engine.transfer(from, to, 5).await;
                    }
                })
            })
            .collect();

        for _ in 0..20 {
            let err = engine.transfer(2, 2, 1).await.unwrap_err();
            assert!(matches!(err, TransferError::InvalidAmount(_)));
        }
        for handle in background {
            handle.await.unwrap();
        }
        assert_eq!(engine.store().total_balance().await, 3000);
    }
}
