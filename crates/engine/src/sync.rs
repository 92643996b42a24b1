//! Background checkpointing
//!
//! One thread per file-backed database waits on a condvar and writes a full
//! snapshot when signalled: by a commit that filled half the log, by a
//! commit that found the log full, or by an explicit [`Database::sync`].
//!
//! The checkpoint takes the database-level write barrier (pausing new
//! transactions and waiting out live ones), walks the whole store through an
//! `Exists` query, writes `<db>.chkpnt` and renames it over the database
//! file. Only then is the log space before the captured sequence number
//! considered reclaimable.

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use sonata_core::{CmpMode, Error, Result, SharedStr, Value};
use sonata_durability::snapshot::{IntPair, SnapshotWriter};
use std::fs::File;
use std::io::BufWriter;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

use crate::condition::{CondFlags, Condition, FilterKind};
use crate::database::DbInner;
use crate::fetchspec::{FetchFlags, FetchSpec};
use crate::transaction::Transaction;

struct SyncShared {
    run: bool,
    requested: bool,
    generation: u64,
}

/// Signalling state between committers, [`Database::sync`] callers and the
/// checkpoint thread.
pub(crate) struct SyncState {
    shared: Mutex<SyncShared>,
    work: Condvar,
    done: Condvar,
}

impl SyncState {
    pub(crate) fn new(run: bool) -> SyncState {
        SyncState {
            shared: Mutex::new(SyncShared {
                run,
                requested: false,
                generation: 0,
            }),
            work: Condvar::new(),
            done: Condvar::new(),
        }
    }

    /// Asks for a checkpoint without waiting for it.
    pub(crate) fn solicit(&self) {
        let mut st = self.shared.lock();
        st.requested = true;
        self.work.notify_one();
    }

    /// Asks for a checkpoint and waits until one completes.
    pub(crate) fn sync_blocking(&self) {
        let mut st = self.shared.lock();
        if !st.run {
            return;
        }
        st.requested = true;
        let gen = st.generation;
        self.work.notify_one();
        while st.run && st.generation == gen {
            self.done.wait(&mut st);
        }
    }

    /// Stops the checkpoint thread.
    pub(crate) fn stop(&self) {
        let mut st = self.shared.lock();
        st.run = false;
        self.work.notify_all();
        self.done.notify_all();
    }
}

/// Spawns the checkpoint thread. It holds only a weak reference to the
/// database so an unclosed handle can still be torn down.
pub(crate) fn spawn(inner: &Arc<DbInner>) -> JoinHandle<()> {
    let weak: Weak<DbInner> = Arc::downgrade(inner);
    let sync = Arc::clone(&inner.sync);

    std::thread::Builder::new()
        .name("sonata-sync".to_string())
        .spawn(move || loop {
            {
                let mut st = sync.shared.lock();
                while st.run && !st.requested {
                    sync.work.wait(&mut st);
                }
                if !st.run {
                    break;
                }
                st.requested = false;
            }

            match weak.upgrade() {
                Some(db) => {
                    if let Err(e) = checkpoint(&db) {
                        warn!(error = %e, "checkpoint failed");
                    }
                }
                None => break,
            }

            let mut st = sync.shared.lock();
            st.generation += 1;
            sync.done.notify_all();
        })
        .expect("failed to spawn sonata-sync thread")
}

/// Writes a full snapshot and advances the log checkpoint.
pub(crate) fn checkpoint(db: &DbInner) -> Result<()> {
    let (paths, log) = match (&db.paths, &db.log) {
        (Some(paths), Some(log)) => (paths, log),
        _ => return Ok(()),
    };

    // Mutations pause here until the snapshot is on disk.
    let _barrier = db.barrier.write();
    let synced = log.lock().mark_synced();
    debug!(synced, "checkpoint started");

    // Walk the whole store: parent pair in column 0, every tuple in
    // column 1. This runs through a barrier-exempt transaction whose op
    // list gets the `Writing` marker before commit, so everything the
    // snapshot captured is skipped by the log writer.
    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    fs.add(None, None, FetchFlags::DATA);
    let cond = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );

    let mut txn = Transaction::begin_exempt(db);
    let set = txn.query(&fs, &cond);
    txn.mark_writing();
    txn.commit()?;

    let mut dict = Dictionary::default();
    let mut pairs: Vec<IntPair> = Vec::new();

    for row in set.iter() {
        let parent = match row.col(0) {
            Some(parent) => parent,
            None => continue,
        };
        let ka = dict.id_of(parent.key_shared());
        let (ka, va) = encode_value(ka, parent.value(), &mut dict);

        if let Some(first) = row.col(1) {
            for node in first.iter() {
                let kb = dict.id_of(node.key_shared());
                let (kb, vb) = encode_value(kb, node.value(), &mut dict);
                let src = match node.src_shared() {
                    Some(src) => dict.id_of(src),
                    None => continue,
                };
                pairs.push([ka, va, kb, vb, src]);
            }
        }
    }

    let file = File::create(&paths.tmp).map_err(Error::Open)?;
    let mut writer =
        SnapshotWriter::new(BufWriter::new(file), db.uuid, synced).map_err(Error::Open)?;
    for (id, s) in dict.entries() {
        writer.write_string(id, s).map_err(Error::Open)?;
    }
    writer.finish_strings().map_err(Error::Open)?;
    for pair in &pairs {
        writer.write_relation(*pair).map_err(Error::Open)?;
    }
    let out = writer.finish().map_err(Error::Open)?;
    let file = out.into_inner().map_err(|e| Error::Open(e.into_error()))?;
    file.sync_all().map_err(Error::Open)?;
    std::fs::rename(&paths.tmp, &paths.db).map_err(Error::Open)?;

    log.lock().checkpoint_done();
    info!(
        relations = pairs.len(),
        strings = dict.len(),
        synced,
        "checkpoint complete"
    );
    Ok(())
}

/// Maps interned strings to snapshot dictionary ids.
#[derive(Default)]
struct Dictionary {
    ids: FxHashMap<usize, i32>,
    entries: Vec<(i32, SharedStr)>,
}

impl Dictionary {
    fn id_of(&mut self, s: &SharedStr) -> i32 {
        if let Some(id) = self.ids.get(&s.addr()) {
            return *id;
        }
        let id = self.entries.len() as i32 + 1;
        self.ids.insert(s.addr(), id);
        self.entries.push((id, s.clone()));
        id
    }

    fn entries(&self) -> impl Iterator<Item = (i32, &str)> {
        self.entries.iter().map(|(id, s)| (*id, s.as_str()))
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Encodes a value field: integers go inline with a negated key id, strings
/// become dictionary ids.
fn encode_value(key_id: i32, value: &Value, dict: &mut Dictionary) -> (i32, i32) {
    match value {
        Value::Int(i) => (-key_id, *i),
        Value::Str(s) => (key_id, dict.id_of(s)),
    }
}
