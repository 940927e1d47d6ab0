//! ordered_transfer - Deadlock-free concurrent funds transfers
//!
//! Moves value between accounts in a shared row-locking store while many
//! transfers run at once, touching the same accounts in opposing directions.
//!
//! # Modules
//!
//! - [`core_types`] - Core type definitions (AccountId, Amount)
//! - [`ordering`] - Canonical row-lock acquisition order
//! - [`store`] - Transaction-scoped account store adapters (PostgreSQL, in-memory)
//! - [`transfer`] - Transfer engine and error taxonomy
//! - [`db`] - PostgreSQL pool and provisioning helpers
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing subscriber setup
//! - [`stress`] - Concurrent workload harness and invariant checks

// Core types - must be first!
pub mod core_types;

pub mod ordering;
pub mod store;
pub mod transfer;

// Runtime plumbing
pub mod config;
pub mod db;
pub mod logging;
pub mod stress;

// Convenient re-exports at crate root
pub use core_types::{AccountId, Amount};
pub use ordering::{LockOrder, canonical_pair};
pub use store::{
    AccountStore, AccountTx, InMemoryAccountStore, PgAccountStore, StoreError,
};
pub use transfer::{
    InvalidTransfer, TransferEngine, TransferError, TransferReceipt, TransferRequest,
};
