//! Funds Transfer
//!
//! Moves value between two accounts inside one store transaction.
//!
//! # Safety Invariants
//!
//! 1. **Canonical Lock Order**: Rows are locked in ascending id order, never in
//!    transfer direction, so opposing transfers cannot deadlock
//! 2. **Lock-Before-Check**: Both rows are held before the source balance is read
//! 3. **Single Commit Point**: Debit and credit become durable together or not at all
//! 4. **Reject-Before-Begin**: Malformed requests never open a transaction

pub mod engine;
pub mod error;
pub mod types;

pub use engine::TransferEngine;
pub use error::{InvalidTransfer, TransferError};
pub use types::{TransferReceipt, TransferRequest};
