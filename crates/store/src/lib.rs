//! The in-memory entry store
//!
//! Entries are records identified by a `(key, value)` pair, each holding a
//! sorted multiset of `(key, value, source)` attribute tuples. An a-index
//! per entry key maps entry values to entries; optional b-indices map
//! attribute values to the entries carrying them. All strings and values
//! pass through the per-database constant pool first, so pointer equality is
//! value equality everywhere inside the store.

pub mod entry;
pub mod index;
pub mod intern;
pub mod store;

pub use entry::{group_range, Entry, Tuple};
pub use index::Index;
pub use intern::ConstPool;
pub use store::{EntryStore, Loader};
