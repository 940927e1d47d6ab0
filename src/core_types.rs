//! Core types used throughout the system
//!
//! These are fundamental type aliases used by all modules.

/// Account ID - globally unique, immutable after assignment.
///
/// # Constraints:
/// - **Stable**: Never changes for the lifetime of the account
/// - **Totally ordered**: Natural integer order is the canonical lock order
///
/// Signed to map 1:1 onto PostgreSQL `BIGINT` without casts.
pub type AccountId = i64;

/// Amount in minor currency units (e.g. cents).
///
/// Balances are never negative after a committed transfer; the signed type
/// lets the same value express a debit delta.
pub type Amount = i64;
