//! Snapshot files
//!
//! A snapshot is a full serialization of the store, written by the
//! checkpoint thread to `<db>.chkpnt` and renamed over the database file.
//! Layout:
//!
//! ```text
//! magic "s4db" | version: i32 | uuid: 16 bytes | last_checkpoint: u32
//! { id: i32, len: i32, bytes } ...   string dictionary, until id == -1
//! { key_a, val_a, key_b, val_b, src: i32 } ...   packed relations to EOF
//! ```
//!
//! A negative key id marks the paired value field as an inline integer; a
//! positive key id marks it as a string dictionary id.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use rustc_hash::FxHashMap;
use sonata_core::{Error, Result};
use std::io::{Read, Write};

/// File magic. Four bytes at offset zero.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"s4db";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: i32 = 1;

/// The fixed-size snapshot header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotHeader {
    /// Format version
    pub version: i32,
    /// Database identity
    pub uuid: [u8; 16],
    /// Highest log sequence number this snapshot subsumes
    pub last_checkpoint: u32,
}

/// One packed relation record: `(key_a, val_a, key_b, val_b, src)`.
pub type IntPair = [i32; 5];

/// Writes a snapshot: header, then dictionary, then relations.
pub struct SnapshotWriter<W: Write> {
    out: W,
}

impl<W: Write> SnapshotWriter<W> {
    /// Starts a snapshot by writing the header.
    pub fn new(mut out: W, uuid: [u8; 16], last_checkpoint: u32) -> std::io::Result<Self> {
        out.write_all(&SNAPSHOT_MAGIC)?;
        out.write_i32::<LittleEndian>(SNAPSHOT_VERSION)?;
        out.write_all(&uuid)?;
        out.write_u32::<LittleEndian>(last_checkpoint)?;
        Ok(SnapshotWriter { out })
    }

    /// Writes one dictionary entry. Ids must be positive.
    pub fn write_string(&mut self, id: i32, s: &str) -> std::io::Result<()> {
        self.out.write_i32::<LittleEndian>(id)?;
        self.out.write_i32::<LittleEndian>(s.len() as i32)?;
        self.out.write_all(s.as_bytes())
    }

    /// Terminates the dictionary.
    pub fn finish_strings(&mut self) -> std::io::Result<()> {
        self.out.write_i32::<LittleEndian>(-1)
    }

    /// Writes one packed relation.
    pub fn write_relation(&mut self, rec: IntPair) -> std::io::Result<()> {
        for word in rec {
            self.out.write_i32::<LittleEndian>(word)?;
        }
        Ok(())
    }

    /// Flushes and returns the underlying writer.
    pub fn finish(mut self) -> std::io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }
}

/// Reads a snapshot back.
pub struct SnapshotReader<R: Read> {
    input: R,
    header: SnapshotHeader,
}

impl<R: Read> SnapshotReader<R> {
    /// Opens a snapshot, validating magic and version.
    pub fn new(mut input: R) -> Result<Self> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic).map_err(|_| Error::Magic)?;
        if magic != SNAPSHOT_MAGIC {
            return Err(Error::Magic);
        }

        let version = input
            .read_i32::<LittleEndian>()
            .map_err(|_| Error::Magic)?;
        if version != SNAPSHOT_VERSION {
            return Err(Error::Version(version));
        }

        let mut uuid = [0u8; 16];
        input.read_exact(&mut uuid).map_err(|_| Error::Magic)?;
        let last_checkpoint = input
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::Magic)?;

        Ok(SnapshotReader {
            input,
            header: SnapshotHeader {
                version,
                uuid,
                last_checkpoint,
            },
        })
    }

    /// The validated header.
    pub fn header(&self) -> SnapshotHeader {
        self.header
    }

    /// Reads the string dictionary up to its `-1` terminator.
    pub fn read_strings(&mut self) -> Result<FxHashMap<i32, String>> {
        let damaged = |what: &str| Error::Inconsistent(format!("snapshot dictionary: {what}"));
        let mut strings = FxHashMap::default();

        loop {
            let id = self
                .input
                .read_i32::<LittleEndian>()
                .map_err(|_| damaged("truncated id"))?;
            if id == -1 {
                return Ok(strings);
            }
            if id <= 0 {
                return Err(damaged("non-positive id"));
            }
            let len = self
                .input
                .read_i32::<LittleEndian>()
                .map_err(|_| damaged("truncated length"))?;
            if len < 0 {
                return Err(damaged("negative length"));
            }
            let mut buf = vec![0u8; len as usize];
            self.input
                .read_exact(&mut buf)
                .map_err(|_| damaged("truncated string"))?;
            let s = String::from_utf8(buf).map_err(|_| damaged("invalid utf-8"))?;
            strings.insert(id, s);
        }
    }

    /// Streams packed relations to `f` until end of file. A trailing
    /// partial record counts as damage.
    pub fn read_relations(&mut self, mut f: impl FnMut(IntPair) -> Result<()>) -> Result<()> {
        loop {
            let mut rec = [0i32; 5];
            match self.input.read_i32::<LittleEndian>() {
                Ok(word) => rec[0] = word,
                Err(ref e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(_) => {
                    return Err(Error::Inconsistent("snapshot relations: read failed".into()))
                }
            }
            for slot in rec.iter_mut().skip(1) {
                *slot = self
                    .input
                    .read_i32::<LittleEndian>()
                    .map_err(|_| Error::Inconsistent("snapshot relations: torn record".into()))?;
            }
            f(rec)?;
        }
    }
}
