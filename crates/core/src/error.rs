//! Error types for Sonata
//!
//! One `Error` enum covers the whole taxonomy: structural errors that refuse
//! to open a database, I/O errors surfaced from `open`, operational errors
//! raised while a transaction runs, and the concurrency `Deadlock` verdict.
//!
//! Alongside the `Result`-based API, the last failure kind is recorded in a
//! thread-local slot readable through [`errno`], mirroring how callers of the
//! original C API inspect failures after a `false` return.

use std::cell::Cell;
use std::io;
use thiserror::Error;

/// Result type alias for Sonata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Discriminant-only view of [`Error`], stored in the thread-local errno slot
/// and in a failed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Opened with `NEW`, but the file already exists
    Exists,
    /// Opened with `EXISTS`, but the file is absent
    NoEnt,
    /// Opening the database file failed
    Open,
    /// The file does not start with the database magic
    Magic,
    /// The file carries an unsupported format version
    Version,
    /// The database content failed a consistency check
    Inconsistent,
    /// Opening the log file failed
    LogOpen,
    /// Replaying the log failed
    LogRedo,
    /// The log has no room for the commit
    LogFull,
    /// Write attempted in a read-only transaction
    ReadOnly,
    /// An add/del failed logically
    Execute,
    /// The transaction was chosen as the deadlock victim
    Deadlock,
}

/// Error type for the Sonata database
#[derive(Debug, Error)]
pub enum Error {
    /// Tried to create a new database over an existing file
    #[error("database file already exists")]
    Exists,

    /// Tried to open an existing database that is absent
    #[error("database file does not exist")]
    NoEnt,

    /// Opening the database file failed
    #[error("could not open database file: {0}")]
    Open(#[source] io::Error),

    /// The file is not a Sonata database
    #[error("bad magic number, not a sonata database")]
    Magic,

    /// The database was written by an incompatible version
    #[error("unsupported database version {0}")]
    Version(i32),

    /// The database content is damaged
    #[error("database is inconsistent: {0}")]
    Inconsistent(String),

    /// Opening the write-ahead log failed
    #[error("could not open log file: {0}")]
    LogOpen(#[source] io::Error),

    /// Reading back or writing the write-ahead log failed
    #[error("log i/o failed: {0}")]
    LogRedo(String),

    /// A commit could not be persisted because the log is out of room
    #[error("log file is full")]
    LogFull,

    /// A mutation was attempted in a read-only transaction
    #[error("transaction is read-only")]
    ReadOnly,

    /// An add or del failed logically (e.g. deleting an absent tuple)
    #[error("operation could not be executed")]
    Execute,

    /// The transaction would have completed a wait-for cycle
    #[error("transaction aborted to break a deadlock")]
    Deadlock,
}

impl Error {
    /// The kind of this error, with payloads stripped.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Exists => ErrorKind::Exists,
            Error::NoEnt => ErrorKind::NoEnt,
            Error::Open(_) => ErrorKind::Open,
            Error::Magic => ErrorKind::Magic,
            Error::Version(_) => ErrorKind::Version,
            Error::Inconsistent(_) => ErrorKind::Inconsistent,
            Error::LogOpen(_) => ErrorKind::LogOpen,
            Error::LogRedo(_) => ErrorKind::LogRedo,
            Error::LogFull => ErrorKind::LogFull,
            Error::ReadOnly => ErrorKind::ReadOnly,
            Error::Execute => ErrorKind::Execute,
            Error::Deadlock => ErrorKind::Deadlock,
        }
    }

    /// Whether retrying the failed operation can succeed.
    ///
    /// `Deadlock` transactions are meant to be re-run; `LogFull` clears once
    /// the background sync has checkpointed the log.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Deadlock | Error::LogFull)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Exists => Error::Exists,
            ErrorKind::NoEnt => Error::NoEnt,
            ErrorKind::Open => Error::Open(io::Error::from(io::ErrorKind::Other)),
            ErrorKind::Magic => Error::Magic,
            ErrorKind::Version => Error::Version(-1),
            ErrorKind::Inconsistent => Error::Inconsistent(String::new()),
            ErrorKind::LogOpen => Error::LogOpen(io::Error::from(io::ErrorKind::Other)),
            ErrorKind::LogRedo => Error::LogRedo(String::new()),
            ErrorKind::LogFull => Error::LogFull,
            ErrorKind::ReadOnly => Error::ReadOnly,
            ErrorKind::Execute => Error::Execute,
            ErrorKind::Deadlock => Error::Deadlock,
        }
    }
}

thread_local! {
    static ERRNO: Cell<Option<ErrorKind>> = const { Cell::new(None) };
}

/// Returns the last error kind recorded on this thread, if any.
///
/// Error kinds recorded on one thread are not visible from another.
pub fn errno() -> Option<ErrorKind> {
    ERRNO.with(|e| e.get())
}

/// Records an error kind in the calling thread's errno slot.
pub fn set_errno(kind: ErrorKind) {
    ERRNO.with(|e| e.set(Some(kind)));
}
