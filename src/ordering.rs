//! Lock Ordering Protocol
//!
//! Every transaction that touches more than one account row acquires its
//! row locks in ascending [`AccountId`] order. The order depends on the ids
//! alone, never on transfer direction or arrival time, so two transactions
//! competing for the same rows always queue on the lowest id first and a
//! wait-for cycle cannot form.
//!
//! ```text
//! transfer(2 -> 1)   locks 1, then 2
//! transfer(1 -> 2)   locks 1, then 2     (same sequence, no circular wait)
//! ```

use crate::core_types::AccountId;

/// Order two distinct account ids for lock acquisition.
///
/// Callers must reject `x == y` before reaching this point; a same-account
/// transfer is not a transfer.
#[inline]
pub fn canonical_pair(x: AccountId, y: AccountId) -> (AccountId, AccountId) {
    debug_assert_ne!(x, y, "same-account pair reached the lock ordering");
    if x < y { (x, y) } else { (y, x) }
}

/// Acquisition sequence for a set of row locks held by one transaction.
///
/// Ids are sorted ascending and de-duplicated: a row is locked at most once
/// per transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOrder {
    ids: Vec<AccountId>,
}

impl LockOrder {
    /// Lock order for a two-account transfer
    pub fn pair(x: AccountId, y: AccountId) -> Self {
        let (first, second) = canonical_pair(x, y);
        Self {
            ids: vec![first, second],
        }
    }

    /// Lock order for an arbitrary set of accounts
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = AccountId>,
    {
        let mut ids: Vec<AccountId> = ids.into_iter().collect();
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    pub fn first(&self) -> Option<AccountId> {
        self.ids.first().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = AccountId> + '_ {
        self.ids.iter().copied()
    }

    pub fn as_slice(&self) -> &[AccountId] {
        &self.ids
    }
}

impl<'a> IntoIterator for &'a LockOrder {
    type Item = AccountId;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, AccountId>>;

    fn into_iter(self) -> Self::IntoIter {
        self.ids.iter().copied()
    }
}
