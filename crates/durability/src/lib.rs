//! Durability layer for Sonata
//!
//! Two on-disk artifacts keep a database recoverable:
//! - a circular write-ahead [`log`] that commits append to, and
//! - a full [`snapshot`] written by the background checkpoint, whose header
//!   records the highest log sequence number it subsumes.
//!
//! Recovery reads the snapshot, then replays the log from the recorded
//! sequence number up to the first torn record.

pub mod log;
pub mod snapshot;

pub use log::{LogFile, LogOp, RecordKind, ReplayOp, DEFAULT_LOG_CAPACITY};
pub use snapshot::{SnapshotHeader, SnapshotReader, SnapshotWriter, SNAPSHOT_VERSION};
