//! Database handles
//!
//! A [`Database`] owns everything: the constant pool, the entry store, the
//! lock registry, the write-ahead log, and the background checkpoint
//! thread. File-backed databases recover their state on open (snapshot +
//! log replay); memory-only databases skip persistence entirely.

use bitflags::bitflags;
use parking_lot::{Mutex, RwLock};
use sonata_concurrency::LockRegistry;
use sonata_core::{set_errno, Error, Result};
use sonata_durability::{LogFile, DEFAULT_LOG_CAPACITY};
use sonata_store::{ConstPool, EntryStore};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

use crate::recovery;
use crate::sync::{self, SyncState};
use crate::transaction::{TransFlags, Transaction};

bitflags! {
    /// Flags for [`Database::open`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        /// Fail with `Exists` when the file is already there
        const NEW = 1 << 0;
        /// Fail with `NoEnt` when the file is absent
        const EXISTS = 1 << 1;
        /// Memory-only database: nothing is read or written
        const MEMORY = 1 << 2;
        /// Verify store consistency after recovery
        const VERIFY = 1 << 3;
        /// Keep what can be read from damaged files instead of refusing
        const RECOVER = 1 << 4;
        /// Run the background sync thread (always on for file-backed
        /// databases; accepted for compatibility)
        const SYNC_THREAD = 1 << 5;
    }
}

pub(crate) struct DbPaths {
    /// The snapshot file (and the database's on-disk identity).
    pub db: PathBuf,
    /// Temporary checkpoint target, renamed over `db`.
    pub tmp: PathBuf,
    /// The circular write-ahead log.
    pub log: PathBuf,
}

pub(crate) struct DbInner {
    pub flags: OpenFlags,
    pub pool: ConstPool,
    pub registry: Arc<LockRegistry>,
    pub store: EntryStore,
    /// Transactions hold this for read; the checkpoint takes it for write.
    pub barrier: RwLock<()>,
    pub uuid: [u8; 16],
    pub paths: Option<DbPaths>,
    pub log: Option<Mutex<LogFile>>,
    pub sync: Arc<SyncState>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
}

/// An open Sonata database.
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens a database.
    ///
    /// `indices` declares the attribute keys to maintain b-indices for;
    /// queries filtering on those keys avoid full scans. With
    /// [`OpenFlags::MEMORY`] the path is ignored and nothing persists.
    ///
    /// On-disk layout: `<path>` is the current snapshot, `<path>.log` the
    /// write-ahead log, `<path>.chkpnt` the checkpoint scratch file.
    pub fn open(path: impl AsRef<Path>, indices: &[&str], flags: OpenFlags) -> Result<Database> {
        Self::open_impl(path.as_ref(), indices, flags).map_err(|e| {
            set_errno(e.kind());
            e
        })
    }

    fn open_impl(path: &Path, indices: &[&str], flags: OpenFlags) -> Result<Database> {
        let registry = Arc::new(LockRegistry::new());
        let pool = ConstPool::new();
        let store = EntryStore::new(Arc::clone(&registry));
        for key in indices {
            store.declare_b_index(key);
        }

        if flags.contains(OpenFlags::MEMORY) {
            info!("opened memory-only database");
            return Ok(Database {
                inner: Arc::new(DbInner {
                    flags,
                    pool,
                    registry,
                    store,
                    barrier: RwLock::new(()),
                    uuid: new_uuid(),
                    paths: None,
                    log: None,
                    sync: Arc::new(SyncState::new(false)),
                    sync_thread: Mutex::new(None),
                }),
            });
        }

        let paths = DbPaths {
            db: path.to_path_buf(),
            tmp: suffixed(path, ".chkpnt"),
            log: suffixed(path, ".log"),
        };

        let file_exists = paths.db.exists();
        if flags.contains(OpenFlags::NEW) && file_exists {
            return Err(Error::Exists);
        }
        if flags.contains(OpenFlags::EXISTS) && !file_exists {
            return Err(Error::NoEnt);
        }

        let loaded = match recovery::load_snapshot(&pool, &store, &paths.db) {
            Ok(loaded) => loaded,
            Err(e) if flags.contains(OpenFlags::RECOVER) && e.kind() != sonata_core::ErrorKind::Open => {
                warn!(error = %e, "snapshot damaged, continuing with what was readable");
                None
            }
            Err(e) => return Err(e),
        };

        let (uuid, last_checkpoint) = match &loaded {
            Some(info) => (info.uuid, info.last_checkpoint),
            None => (new_uuid(), 0),
        };

        let mut log = LogFile::open(&paths.log, DEFAULT_LOG_CAPACITY, last_checkpoint)?;
        match recovery::replay_log(&pool, &store, &mut log) {
            Ok(()) => {}
            Err(e) if flags.contains(OpenFlags::RECOVER) => {
                warn!(error = %e, "log replay stopped early, keeping the replayed prefix");
            }
            Err(e) => return Err(e),
        }

        if flags.contains(OpenFlags::VERIFY) {
            store.verify()?;
        }

        let inner = Arc::new(DbInner {
            flags,
            pool,
            registry,
            store,
            barrier: RwLock::new(()),
            uuid,
            paths: Some(paths),
            log: Some(Mutex::new(log)),
            sync: Arc::new(SyncState::new(true)),
            sync_thread: Mutex::new(None),
        });

        *inner.sync_thread.lock() = Some(sync::spawn(&inner));
        // Persist right away: the file may be brand new, or the log may
        // have carried changes the snapshot did not.
        inner.sync.solicit();

        info!(path = %path.display(), uuid = %uuid_string(&inner.uuid), "database opened");
        Ok(Database { inner })
    }

    /// Starts a transaction.
    pub fn begin(&self, flags: TransFlags) -> Transaction<'_> {
        Transaction::begin(self.inner(), flags)
    }

    /// Forces a checkpoint and waits for it to complete. A no-op on
    /// memory-only databases.
    pub fn sync(&self) {
        self.inner.sync.sync_blocking();
    }

    /// Checks the consistency of the in-memory store.
    pub fn verify(&self) -> Result<()> {
        self.inner.store.verify()
    }

    /// The database UUID.
    pub fn uuid(&self) -> [u8; 16] {
        self.inner.uuid
    }

    /// The database UUID in hyphenated form.
    pub fn uuid_string(&self) -> String {
        uuid_string(&self.inner.uuid)
    }

    /// Closes the database: stops the sync thread and releases everything.
    /// Changes are already durable through the log; the next open replays
    /// or checkpoints them.
    pub fn close(self) {
        self.shutdown();
    }

    fn shutdown(&self) {
        self.inner.sync.stop();
        if let Some(handle) = self.inner.sync_thread.lock().take() {
            if handle.join().is_err() {
                warn!("sync thread panicked during shutdown");
            }
        }
    }

    pub(crate) fn inner(&self) -> &DbInner {
        &self.inner
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("uuid", &self.uuid_string())
            .field("flags", &self.inner.flags)
            .field("memory", &self.inner.paths.is_none())
            .finish()
    }
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

fn new_uuid() -> [u8; 16] {
    *uuid::Uuid::new_v4().as_bytes()
}

fn uuid_string(bytes: &[u8; 16]) -> String {
    uuid::Uuid::from_bytes(*bytes).hyphenated().to_string()
}
