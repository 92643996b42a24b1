//! The Sonata database engine
//!
//! Ties the store, the lock registry and the durability layer together into
//! the public database API: [`Database`] handles, [`Transaction`]s, the
//! condition/fetch query model and [`ResultSet`]s.

pub mod condition;
pub mod database;
pub mod fetchspec;
mod query;
mod recovery;
pub mod resultset;
mod sync;
pub mod transaction;

pub use condition::{CombinerKind, CondFlags, Condition, FilterKind};
pub use database::{Database, OpenFlags};
pub use fetchspec::{FetchFlags, FetchSpec};
pub use resultset::{Direction, Order, ResultNode, ResultRow, ResultSet};
pub use transaction::{TransFlags, Transaction};
