//! Core types for Sonata
//!
//! This crate defines the foundational types used throughout the system:
//! - Value: tagged scalar (integer or string) with cached comparison keys
//! - SharedStr: shared string with lazy casefold/collation keys
//! - CmpMode: the three comparison modes (binary, casefold, collate)
//! - Pattern: glob-like patterns over strings and integers
//! - SourcePref: source-preference ranking from glob pattern lists
//! - Error / ErrorKind: the error taxonomy plus the thread-local errno slot

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod collate;
pub mod error;
pub mod pattern;
pub mod sourcepref;
pub mod value;

pub use error::{errno, set_errno, Error, ErrorKind, Result};
pub use pattern::Pattern;
pub use sourcepref::SourcePref;
pub use value::{CmpMode, SharedStr, Value};
