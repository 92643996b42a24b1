//! Startup recovery
//!
//! Opening a file-backed database runs two loads: the snapshot (if one
//! exists) streams its dictionary and packed relations into the store, then
//! the log replays everything committed after the snapshot's sequence
//! number. Both go through the lock-free [`Loader`] path.

use rustc_hash::FxHashMap;
use sonata_core::{Error, Result, Value};
use sonata_durability::{LogFile, RecordKind, SnapshotReader};
use sonata_store::{ConstPool, EntryStore, Loader};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::debug;

/// Snapshot identity carried into the opened database.
pub(crate) struct SnapshotInfo {
    pub uuid: [u8; 16],
    pub last_checkpoint: u32,
}

/// Loads the snapshot at `path` into the store. `Ok(None)` when the file
/// does not exist.
pub(crate) fn load_snapshot(
    pool: &ConstPool,
    store: &EntryStore,
    path: &Path,
) -> Result<Option<SnapshotInfo>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::Open(e)),
    };

    let mut reader = SnapshotReader::new(BufReader::new(file))?;
    let header = reader.header();
    let strings = reader.read_strings()?;

    let resolve = |id: i32| -> Result<&String> {
        strings
            .get(&id.abs())
            .ok_or_else(|| Error::Inconsistent(format!("snapshot references unknown string {id}")))
    };

    let mut loader = Loader::new(store);
    let mut relations = 0usize;
    reader.read_relations(|rec| {
        if rec[0] == 0 || rec[2] == 0 {
            return Err(Error::Inconsistent("snapshot relation with zero key id".into()));
        }
        let key_a = pool.intern_str(resolve(rec[0])?);
        let val_a = decode_value(pool, rec[0], rec[1], &strings)?;
        let key_b = pool.intern_str(resolve(rec[2])?);
        let val_b = decode_value(pool, rec[2], rec[3], &strings)?;
        let src = pool.intern_str(resolve(rec[4])?);

        loader.add(&key_a, &val_a, &key_b, &val_b, &src);
        relations += 1;
        Ok(())
    })?;

    debug!(relations, strings = strings.len(), "snapshot loaded");
    Ok(Some(SnapshotInfo {
        uuid: header.uuid,
        last_checkpoint: header.last_checkpoint,
    }))
}

fn decode_value(
    pool: &ConstPool,
    key_id: i32,
    val_field: i32,
    strings: &FxHashMap<i32, String>,
) -> Result<Value> {
    if key_id < 0 {
        return Ok(Value::int(val_field));
    }
    let s = strings
        .get(&val_field)
        .ok_or_else(|| Error::Inconsistent(format!("snapshot references unknown string {val_field}")))?;
    Ok(pool.intern_str_value(s))
}

/// Replays the log into the store through the normal relation paths.
pub(crate) fn replay_log(pool: &ConstPool, store: &EntryStore, log: &mut LogFile) -> Result<()> {
    let mut loader = Loader::new(store);
    let mut replayed = 0usize;
    log.replay(|op| {
        let key_a = pool.intern_str(&op.key_a);
        let val_a = pool.intern_value(&op.val_a);
        let key_b = pool.intern_str(&op.key_b);
        let val_b = pool.intern_value(&op.val_b);
        let src = pool.intern_str(&op.src);
        match op.kind {
            RecordKind::Add => {
                loader.add(&key_a, &val_a, &key_b, &val_b, &src);
            }
            RecordKind::Del => {
                loader.del(&key_a, &val_a, &key_b, &val_b, &src);
            }
        }
        replayed += 1;
    })?;
    debug!(replayed, "log replayed");
    Ok(())
}
