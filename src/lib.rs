//! # SonataDB
//!
//! An embedded, transactional, in-memory database for media-library
//! metadata: small records associating one key–value attribute of a media
//! item with another, tagged by the source that asserted the relation.
//!
//! Sonata is optimized for small-cardinality predicates, multi-valued
//! attributes, source-ranked conflict resolution, and queries of the form
//! "find entries satisfying a boolean condition, then project selected
//! attributes with per-column source preference". Durability comes from a
//! circular write-ahead log plus periodic full snapshots written by a
//! background thread.
//!
//! # Quick Start
//!
//! ```no_run
//! use sonatadb::{CmpMode, CondFlags, Condition, Database, FetchFlags, FetchSpec,
//!                FilterKind, OpenFlags, TransFlags, Value};
//!
//! fn main() -> sonatadb::Result<()> {
//!     let db = Database::open("media.sdb", &["album"], OpenFlags::empty())?;
//!
//!     // Attach an album to an artist, crediting the id3 tag reader.
//!     let mut t = db.begin(TransFlags::empty());
//!     t.add(
//!         "artist",
//!         &Value::string("Miles Davis"),
//!         "album",
//!         &Value::string("Kind of Blue"),
//!         "plugin/id3v2",
//!     );
//!     t.commit()?;
//!
//!     // Every album of that artist.
//!     let cond = Condition::filter(
//!         FilterKind::Equal,
//!         Some("artist"),
//!         Some(&Value::string("Miles Davis")),
//!         None,
//!         CmpMode::Casefold,
//!         CondFlags::PARENT,
//!     );
//!     let mut fs = FetchSpec::new();
//!     fs.add(Some("album"), None, FetchFlags::DATA);
//!
//!     let mut t = db.begin(TransFlags::READ_ONLY);
//!     let albums = t.query(&fs, &cond);
//!     t.commit()?;
//!     for row in albums.iter() {
//!         if let Some(cell) = row.col(0) {
//!             println!("{}", cell.value());
//!         }
//!     }
//!
//!     db.close();
//!     Ok(())
//! }
//! ```
//!
//! # Model
//!
//! | Concept | Meaning |
//! |---------|---------|
//! | **Entry** | Record identified by a `(key, value)` pair |
//! | **Attribute tuple** | `(key, value, source)` attached to an entry |
//! | **Source preference** | Glob-pattern ranking deciding between sources |
//! | **Condition** | Tree of filters and combiners selecting entries |
//! | **Fetch spec** | Per-column projection with source preference |
//!
//! The internal crates (store, concurrency, durability, engine) are not
//! part of the stable surface; use the re-exports below.

pub use sonata_core::{
    errno, CmpMode, Error, ErrorKind, Pattern, Result, SharedStr, SourcePref, Value,
};
pub use sonata_engine::{
    CombinerKind, CondFlags, Condition, Database, Direction, FetchFlags, FetchSpec, FilterKind,
    OpenFlags, Order, ResultNode, ResultRow, ResultSet, TransFlags, Transaction,
};
