//! Transaction machinery for Sonata
//!
//! This crate provides the pieces a transaction is built from:
//! - [`LockRegistry`] / [`TxnLock`]: shared/exclusive two-phase locks with
//!   wait-for-graph deadlock detection
//! - [`OpList`] / [`Op`]: the logical operation log of one transaction,
//!   rolled back by running inverse operations in reverse order

pub mod lock;
pub mod oplist;

pub use lock::{LockMode, LockRegistry, TxnId, TxnLock};
pub use oplist::{Op, OpList};
