//! Circular write-ahead log
//!
//! The log is a file of fixed capacity `C`. Records append sequentially;
//! when a record would run past the end, a `Wrap` record terminates the
//! round and writing continues at offset 0. Every record carries a sequence
//! number `offset + round * C`, strictly increasing (modulo u32) across
//! wraps, which lets replay detect the torn tail: the first header whose
//! sequence number is not the expected one ends the round trip.
//!
//! A batch append first sizes the whole batch. If its end would overrun the
//! oldest unreclaimed record (`end - last_checkpoint > C`) nothing is
//! written and the commit fails with `LogFull`; the caller solicits a
//! checkpoint and retries later. After a successful append the caller is
//! told to wake the sync thread once more than half the capacity has
//! accumulated since the last checkpoint.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use sonata_core::{Error, Result, Value};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::{debug, warn};

/// Default log capacity: 2 MiB.
pub const DEFAULT_LOG_CAPACITY: u32 = 2 * 1024 * 1024;

/// Bytes in a record header: seven little-endian 32-bit words.
const HEADER_LEN: u32 = 28;

const TYPE_ADD: i32 = 0xADDADD;
const TYPE_DEL: i32 = 0xDE1E7E;
const TYPE_WRAP: i32 = 0x123123;

/// Whether a record adds or deletes a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// The relation was added
    Add,
    /// The relation was deleted
    Del,
}

/// A borrowed record to append.
#[derive(Debug, Clone, Copy)]
pub struct LogOp<'a> {
    /// Add or delete
    pub kind: RecordKind,
    /// Entry key
    pub key_a: &'a str,
    /// Entry value
    pub val_a: &'a Value,
    /// Attribute key
    pub key_b: &'a str,
    /// Attribute value
    pub val_b: &'a Value,
    /// Asserting source
    pub src: &'a str,
}

/// An owned record read back during replay.
#[derive(Debug, Clone)]
pub struct ReplayOp {
    /// Add or delete
    pub kind: RecordKind,
    /// Entry key
    pub key_a: String,
    /// Entry value
    pub val_a: Value,
    /// Attribute key
    pub key_b: String,
    /// Attribute value
    pub val_b: Value,
    /// Asserting source
    pub src: String,
}

/// The open log file of one database.
pub struct LogFile {
    file: File,
    capacity: u32,
    /// Byte offset where the next record goes.
    head: u32,
    /// How many times the log has wrapped.
    round: u32,
    /// Sequence number reclaimable space ends at (covered by the on-disk
    /// snapshot).
    last_checkpoint: u32,
    /// Sequence number captured by the most recent checkpoint pass.
    last_synced: u32,
}

impl LogFile {
    /// Opens (or creates) the log at `path`. `last_checkpoint` comes from
    /// the snapshot header, zero for a fresh database. Replay is a separate
    /// step so the caller can route records into the store.
    pub fn open(path: &Path, capacity: u32, last_checkpoint: u32) -> Result<LogFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .map_err(Error::LogOpen)?;

        Ok(LogFile {
            file,
            capacity,
            head: last_checkpoint % capacity,
            round: last_checkpoint / capacity,
            last_checkpoint,
            last_synced: last_checkpoint,
        })
    }

    /// The sequence number the next record will carry.
    pub fn next_seq(&self) -> u32 {
        self.head.wrapping_add(self.round.wrapping_mul(self.capacity))
    }

    /// The sequence number up to which the on-disk snapshot is current.
    pub fn last_checkpoint(&self) -> u32 {
        self.last_checkpoint
    }

    /// Called when a checkpoint pass starts (under the database barrier):
    /// everything logged so far will be captured by the snapshot. Returns
    /// the sequence number to put in the snapshot header.
    pub fn mark_synced(&mut self) -> u32 {
        self.last_synced = self.next_seq();
        self.last_synced
    }

    /// Called after the snapshot was renamed into place: the space before
    /// the captured sequence number is reclaimable.
    pub fn checkpoint_done(&mut self) {
        self.last_checkpoint = self.last_synced;
        debug!(last_checkpoint = self.last_checkpoint, "log checkpoint advanced");
    }

    /// Replays records from `last_checkpoint` to the torn tail, handing
    /// each to `apply`. Leaves the write position at the end of the replayed
    /// run.
    pub fn replay(&mut self, mut apply: impl FnMut(ReplayOp)) -> Result<()> {
        let mut pos = self.last_checkpoint % self.capacity;
        let mut round = self.last_checkpoint / self.capacity;

        self.file
            .seek(SeekFrom::Start(u64::from(pos)))
            .map_err(|e| Error::LogRedo(e.to_string()))?;

        loop {
            let mut header = [0u8; HEADER_LEN as usize];
            if self.file.read_exact(&mut header).is_err() {
                break;
            }
            let mut words = &header[..];
            let rec_type = words.read_i32::<LittleEndian>().unwrap_or(0);
            let seq = words.read_u32::<LittleEndian>().unwrap_or(0);

            let expected = pos.wrapping_add(round.wrapping_mul(self.capacity));
            if seq != expected {
                debug!(seq, expected, "log tail reached (stale sequence number)");
                break;
            }

            match rec_type {
                TYPE_WRAP => {
                    round = round.wrapping_add(1);
                    pos = 0;
                    self.file
                        .seek(SeekFrom::Start(0))
                        .map_err(|e| Error::LogRedo(e.to_string()))?;
                }
                TYPE_ADD | TYPE_DEL => {
                    let lens = [
                        (&header[8..]).read_i32::<LittleEndian>().unwrap_or(-2),
                        (&header[12..]).read_i32::<LittleEndian>().unwrap_or(-2),
                        (&header[16..]).read_i32::<LittleEndian>().unwrap_or(-2),
                        (&header[20..]).read_i32::<LittleEndian>().unwrap_or(-2),
                        (&header[24..]).read_i32::<LittleEndian>().unwrap_or(-2),
                    ];
                    let op = match self.read_payload(rec_type, lens) {
                        Some(op) => op,
                        None => {
                            warn!(seq, "torn log record payload, stopping replay");
                            break;
                        }
                    };
                    apply(op);
                    pos = pos
                        .wrapping_add(HEADER_LEN)
                        .wrapping_add(payload_len(lens));
                }
                other => {
                    warn!(record_type = other, seq, "unknown log record type, stopping replay");
                    break;
                }
            }
        }

        self.head = pos;
        self.round = round;
        self.file
            .seek(SeekFrom::Start(u64::from(pos)))
            .map_err(|e| Error::LogRedo(e.to_string()))?;
        Ok(())
    }

    fn read_payload(&mut self, rec_type: i32, lens: [i32; 5]) -> Option<ReplayOp> {
        let [ka_len, va_len, kb_len, vb_len, src_len] = lens;
        let key_a = self.read_str(ka_len)?;
        let val_a = self.read_val(va_len)?;
        let key_b = self.read_str(kb_len)?;
        let val_b = self.read_val(vb_len)?;
        let src = self.read_str(src_len)?;

        Some(ReplayOp {
            kind: if rec_type == TYPE_ADD {
                RecordKind::Add
            } else {
                RecordKind::Del
            },
            key_a,
            val_a,
            key_b,
            val_b,
            src,
        })
    }

    fn read_str(&mut self, len: i32) -> Option<String> {
        if len < 0 || len as u32 > self.capacity {
            return None;
        }
        let mut buf = vec![0u8; len as usize];
        self.file.read_exact(&mut buf).ok()?;
        String::from_utf8(buf).ok()
    }

    fn read_val(&mut self, len: i32) -> Option<Value> {
        if len == -1 {
            let i = self.file.read_i32::<LittleEndian>().ok()?;
            Some(Value::int(i))
        } else {
            Some(Value::string(&self.read_str(len)?))
        }
    }

    /// Appends a batch of records atomically: either every record fits
    /// without overrunning unreclaimed space, or nothing is written and the
    /// append fails with `LogFull`.
    ///
    /// Returns true when the caller should wake the background sync thread
    /// (more than half the capacity written since the last checkpoint).
    pub fn append(&mut self, ops: &[LogOp<'_>]) -> Result<bool> {
        // Pass one: walk the batch to find where it would end.
        let mut pos = self.head;
        let mut round = self.round;
        for op in ops {
            let size = record_size(op);
            if size > self.capacity - HEADER_LEN {
                return Err(Error::LogFull);
            }
            if pos + size > self.capacity - HEADER_LEN {
                pos = 0;
                round = round.wrapping_add(1);
            }
            pos += size;
        }
        let end_seq = pos.wrapping_add(round.wrapping_mul(self.capacity));
        if end_seq.wrapping_sub(self.last_checkpoint) > self.capacity {
            return Err(Error::LogFull);
        }

        // Pass two: write for real.
        let io = |e: std::io::Error| Error::LogRedo(e.to_string());
        self.file
            .seek(SeekFrom::Start(u64::from(self.head)))
            .map_err(io)?;
        let mut out = BufWriter::new(&mut self.file);
        for op in ops {
            let size = record_size(op);
            if self.head + size > self.capacity - HEADER_LEN {
                let seq = self.head.wrapping_add(self.round.wrapping_mul(self.capacity));
                write_header(&mut out, TYPE_WRAP, seq, [0, 0, 0, 0, 0]).map_err(io)?;
                out.flush().map_err(io)?;
                out.seek(SeekFrom::Start(0)).map_err(io)?;
                self.head = 0;
                self.round = self.round.wrapping_add(1);
            }

            let seq = self.head.wrapping_add(self.round.wrapping_mul(self.capacity));
            write_header(
                &mut out,
                match op.kind {
                    RecordKind::Add => TYPE_ADD,
                    RecordKind::Del => TYPE_DEL,
                },
                seq,
                [
                    op.key_a.len() as i32,
                    val_len(op.val_a),
                    op.key_b.len() as i32,
                    val_len(op.val_b),
                    op.src.len() as i32,
                ],
            )
            .map_err(io)?;
            out.write_all(op.key_a.as_bytes()).map_err(io)?;
            write_val(&mut out, op.val_a).map_err(io)?;
            out.write_all(op.key_b.as_bytes()).map_err(io)?;
            write_val(&mut out, op.val_b).map_err(io)?;
            out.write_all(op.src.as_bytes()).map_err(io)?;

            self.head += size;
        }
        out.flush().map_err(io)?;
        drop(out);
        self.file.sync_data().map_err(io)?;

        let since_sync = self.next_seq().wrapping_sub(self.last_synced);
        Ok(since_sync > self.capacity / 2)
    }
}

fn val_len(val: &Value) -> i32 {
    match val.as_str() {
        Some(s) => s.len() as i32,
        None => -1,
    }
}

fn record_size(op: &LogOp<'_>) -> u32 {
    let val_size = |v: &Value| match v.as_str() {
        Some(s) => s.len() as u32,
        None => 4,
    };
    HEADER_LEN
        + op.key_a.len() as u32
        + val_size(op.val_a)
        + op.key_b.len() as u32
        + val_size(op.val_b)
        + op.src.len() as u32
}

fn write_header<W: Write>(out: &mut W, rec_type: i32, seq: u32, lens: [i32; 5]) -> std::io::Result<()> {
    out.write_i32::<LittleEndian>(rec_type)?;
    out.write_u32::<LittleEndian>(seq)?;
    for len in lens {
        out.write_i32::<LittleEndian>(len)?;
    }
    Ok(())
}

fn write_val<W: Write>(out: &mut W, val: &Value) -> std::io::Result<()> {
    match val {
        Value::Str(s) => out.write_all(s.as_str().as_bytes()),
        Value::Int(i) => out.write_i32::<LittleEndian>(*i),
    }
}

fn payload_len(lens: [i32; 5]) -> u32 {
    lens.iter()
        .map(|&l| if l == -1 { 4 } else { l.max(0) as u32 })
        .sum()
}
