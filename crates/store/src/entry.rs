//! Entries
//!
//! An entry is identified by its `(key, value)` pair and holds the attribute
//! tuples attached to it. Tuples are kept sorted by the allocation address
//! of their interned key, which groups equal keys contiguously — the order
//! the source-preference walk depends on. Within one key the order is
//! unspecified but consistent (insertion order at the group tail).
//!
//! The embedded [`TxnLock`] is the transaction-scoped lock; the inner
//! `RwLock` only guards the vector against torn reads while a registry
//! lock is legitimately held.

use parking_lot::RwLock;
use smallvec::SmallVec;
use sonata_concurrency::TxnLock;
use sonata_core::{SharedStr, Value};
use std::ops::Range;
use std::sync::Arc;

/// One `(key, value, source)` attribute of an entry.
#[derive(Debug, Clone)]
pub struct Tuple {
    /// Attribute key (interned)
    pub key: SharedStr,
    /// Attribute value (interned)
    pub val: Value,
    /// Asserting source (interned)
    pub src: SharedStr,
}

/// An entry of the store.
pub struct Entry {
    key: SharedStr,
    val: Value,
    lock: TxnLock,
    tuples: RwLock<SmallVec<[Tuple; 4]>>,
}

impl Entry {
    /// Creates an empty entry identified by `(key, val)`.
    pub fn new(key: SharedStr, val: Value, lock: TxnLock) -> Arc<Entry> {
        Arc::new(Entry {
            key,
            val,
            lock,
            tuples: RwLock::new(SmallVec::new()),
        })
    }

    /// The identifying key.
    pub fn key(&self) -> &SharedStr {
        &self.key
    }

    /// The identifying value.
    pub fn value(&self) -> &Value {
        &self.val
    }

    /// The transactional lock of this entry.
    pub fn lock(&self) -> &TxnLock {
        &self.lock
    }

    /// True when the entry carries no tuples.
    pub fn is_empty(&self) -> bool {
        self.tuples.read().is_empty()
    }

    /// Number of tuples.
    pub fn len(&self) -> usize {
        self.tuples.read().len()
    }

    /// Runs `f` over the tuple slice.
    pub fn with_tuples<R>(&self, f: impl FnOnce(&[Tuple]) -> R) -> R {
        f(&self.tuples.read())
    }

    /// Inserts a tuple, keeping the key grouping. Returns false when a
    /// binary-equal tuple from the same source is already present.
    pub fn insert(&self, key: SharedStr, val: Value, src: SharedStr) -> bool {
        let mut tuples = self.tuples.write();
        let range = group_range(&tuples, &key);
        for t in &tuples[range.clone()] {
            if t.src.ptr_eq(&src) && t.val.eq_binary(&val) {
                return false;
            }
        }
        tuples.insert(range.end, Tuple { key, val, src });
        true
    }

    /// Removes a tuple. Returns false when it is not present.
    pub fn remove(&self, key: &SharedStr, val: &Value, src: &SharedStr) -> bool {
        let mut tuples = self.tuples.write();
        let range = group_range(&tuples, key);
        let hit = tuples[range.clone()]
            .iter()
            .position(|t| t.src.ptr_eq(src) && t.val.eq_binary(val));
        match hit {
            Some(offset) => {
                tuples.remove(range.start + offset);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("val", &self.val)
            .field("tuples", &self.len())
            .finish()
    }
}

/// The index range of the tuples whose key is `key` (possibly empty, at the
/// position where the group would live).
pub fn group_range(tuples: &[Tuple], key: &SharedStr) -> Range<usize> {
    let addr = key.addr();
    let start = tuples.partition_point(|t| t.key.addr() < addr);
    let end = start + tuples[start..].partition_point(|t| t.key.addr() == addr);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonata_concurrency::LockRegistry;

    fn new_entry() -> Arc<Entry> {
        let reg = Arc::new(LockRegistry::new());
        Entry::new(
            SharedStr::new("artist"),
            Value::string("Miles"),
            reg.create_lock(),
        )
    }

    #[test]
    fn test_insert_groups_by_key() {
        let entry = new_entry();
        let album = SharedStr::new("album");
        let year = SharedStr::new("year");
        let src = SharedStr::new("src");

        assert!(entry.insert(album.clone(), Value::string("a1"), src.clone()));
        assert!(entry.insert(year.clone(), Value::int(1959), src.clone()));
        assert!(entry.insert(album.clone(), Value::string("a2"), src.clone()));

        entry.with_tuples(|tuples| {
            let albums = group_range(tuples, &album);
            assert_eq!(albums.len(), 2);
            let years = group_range(tuples, &year);
            assert_eq!(years.len(), 1);
            // Groups are contiguous and cover the whole vector.
            assert_eq!(albums.len() + years.len(), tuples.len());
        });
    }

    #[test]
    fn test_duplicate_tuple_rejected() {
        let entry = new_entry();
        let album = SharedStr::new("album");
        let src = SharedStr::new("src");

        assert!(entry.insert(album.clone(), Value::string("x"), src.clone()));
        assert!(!entry.insert(album.clone(), Value::string("x"), src.clone()));
        assert_eq!(entry.len(), 1);
    }

    #[test]
    fn test_same_value_different_source_coexists() {
        let entry = new_entry();
        let album = SharedStr::new("album");

        assert!(entry.insert(album.clone(), Value::string("x"), SharedStr::new("s1")));
        assert!(entry.insert(album.clone(), Value::string("x"), SharedStr::new("s2")));
        assert_eq!(entry.len(), 2);
    }

    #[test]
    fn test_case_differing_values_coexist() {
        // Tuple identity is binary, so case variants are distinct tuples.
        let entry = new_entry();
        let album = SharedStr::new("album");
        let src = SharedStr::new("src");

        assert!(entry.insert(album.clone(), Value::string("Hello"), src.clone()));
        assert!(entry.insert(album.clone(), Value::string("HELLO"), src.clone()));
        assert_eq!(entry.len(), 2);
    }

    #[test]
    fn test_remove() {
        let entry = new_entry();
        let album = SharedStr::new("album");
        let src = SharedStr::new("src");

        entry.insert(album.clone(), Value::string("x"), src.clone());
        assert!(!entry.remove(&album, &Value::string("y"), &src));
        assert!(entry.remove(&album, &Value::string("x"), &src));
        assert!(!entry.remove(&album, &Value::string("x"), &src));
        assert!(entry.is_empty());
    }
}
