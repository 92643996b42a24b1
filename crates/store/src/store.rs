//! The entry store
//!
//! Ties entries and indices together: an a-index per entry key (created on
//! first use) and a b-index per key the database was opened to index. The
//! transactional `add`/`del` paths take the fine-grained locks in the order
//! the two-phase protocol requires; the [`Loader`] path services snapshot
//! load and log replay without any locking.

use dashmap::DashMap;
use sonata_concurrency::{LockRegistry, TxnId};
use sonata_core::{CmpMode, Error, Result, SharedStr, Value};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

use crate::entry::{group_range, Entry};
use crate::index::Index;

/// Hashes an interned string by allocation address. Only valid for keys that
/// went through one database's constant pool.
#[derive(Clone)]
struct PtrKey(SharedStr);

impl PartialEq for PtrKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.ptr_eq(&other.0)
    }
}

impl Eq for PtrKey {}

impl Hash for PtrKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_usize(self.0.addr());
    }
}

/// The in-memory relation store of one database.
pub struct EntryStore {
    registry: Arc<LockRegistry>,
    a_indices: DashMap<PtrKey, Arc<Index>>,
    b_indices: DashMap<String, Arc<Index>>,
}

impl EntryStore {
    /// Creates an empty store using `registry` for every lock it allocates.
    pub fn new(registry: Arc<LockRegistry>) -> EntryStore {
        EntryStore {
            registry,
            a_indices: DashMap::new(),
            b_indices: DashMap::new(),
        }
    }

    /// Declares a b-index for `key`. Returns false when one already exists.
    /// Only meaningful before data is loaded.
    pub fn declare_b_index(&self, key: &str) -> bool {
        if self.b_indices.contains_key(key) {
            return false;
        }
        debug!(key, "declaring b-index");
        self.b_indices
            .insert(key.to_string(), Index::new(self.registry.create_lock()));
        true
    }

    /// The a-index for `key`, created on demand when `create` is set.
    pub fn a_index(&self, key: &SharedStr, create: bool) -> Option<Arc<Index>> {
        let map_key = PtrKey(key.clone());
        if let Some(index) = self.a_indices.get(&map_key) {
            return Some(Arc::clone(&index));
        }
        if !create {
            return None;
        }
        let index = self
            .a_indices
            .entry(map_key)
            .or_insert_with(|| Index::new(self.registry.create_lock()));
        Some(Arc::clone(&index))
    }

    /// The b-index for `key`, if one was declared.
    pub fn b_index(&self, key: &str) -> Option<Arc<Index>> {
        self.b_indices.get(key).map(|i| Arc::clone(&i))
    }

    /// Every a-index together with its key.
    pub fn all_a_indices(&self) -> Vec<(SharedStr, Arc<Index>)> {
        self.a_indices
            .iter()
            .map(|kv| (kv.key().0.clone(), Arc::clone(kv.value())))
            .collect()
    }

    /// Adds a relation under `txn`'s locks.
    ///
    /// Returns `Ok(false)` when the exact tuple already exists. Lock order:
    /// shared a-index for the lookup, exclusive a-index only when a new
    /// entry must be inserted, exclusive entry for the tuple, exclusive
    /// b-index for the secondary insert.
    pub fn add(
        &self,
        txn: TxnId,
        key_a: &SharedStr,
        val_a: &Value,
        key_b: &SharedStr,
        val_b: &Value,
        src: &SharedStr,
    ) -> Result<bool> {
        let index = match self.a_index(key_a, true) {
            Some(index) => index,
            None => return Err(Error::Execute),
        };
        index.lock().shared(txn)?;

        let entry = match index.find(val_a).into_iter().next() {
            Some(entry) => entry,
            None => {
                let entry = Entry::new(key_a.clone(), val_a.clone(), self.registry.create_lock());
                index.lock().exclusive(txn)?;
                index.insert(val_a, &entry);
                entry
            }
        };

        entry.lock().exclusive(txn)?;
        let added = entry.insert(key_b.clone(), val_b.clone(), src.clone());

        if added {
            if let Some(b_index) = self.b_index(key_b.as_str()) {
                b_index.lock().exclusive(txn)?;
                b_index.insert(val_b, &entry);
            }
        }

        Ok(added)
    }

    /// Deletes a relation under `txn`'s locks. `Ok(false)` when the entry or
    /// tuple is absent.
    pub fn del(
        &self,
        txn: TxnId,
        key_a: &SharedStr,
        val_a: &Value,
        key_b: &SharedStr,
        val_b: &Value,
        src: &SharedStr,
    ) -> Result<bool> {
        let index = match self.a_index(key_a, false) {
            Some(index) => index,
            None => return Ok(false),
        };
        index.lock().shared(txn)?;

        let entry = match index.find(val_a).into_iter().next() {
            Some(entry) => entry,
            None => return Ok(false),
        };

        entry.lock().exclusive(txn)?;
        let removed = entry.remove(key_b, val_b, src);

        if removed {
            if let Some(b_index) = self.b_index(key_b.as_str()) {
                b_index.lock().exclusive(txn)?;
                b_index.remove(val_b, &entry);
            }
        }

        Ok(removed)
    }

    /// Checks store consistency: index sort order, tuple grouping, duplicate
    /// tuples, entry/index key agreement, and b-index membership.
    pub fn verify(&self) -> Result<()> {
        for (key, index) in self.all_a_indices() {
            let mut prev: Option<Value> = None;
            index.for_each(|val, _entry| {
                if let Some(p) = &prev {
                    // for_each walks nodes in order; equal is fine within
                    // one node's entry list.
                    debug_assert_ne!(p.cmp_mode(val, CmpMode::Casefold), Ordering::Greater);
                }
                prev = Some(val.clone());
            });

            for entry in index.all_entries() {
                if !entry.key().ptr_eq(&key) {
                    return Err(Error::Inconsistent(format!(
                        "entry {:?} filed under a-index {:?}",
                        entry.key(),
                        key
                    )));
                }
                entry.with_tuples(|tuples| self.verify_tuples(tuples))?;
            }
        }

        for kv in self.b_indices.iter() {
            let key = kv.key().clone();
            let index = kv.value();
            let mut damaged = None;
            index.for_each(|val, entry| {
                let ok = entry.with_tuples(|tuples| {
                    tuples.iter().any(|t| {
                        t.key.as_str() == key
                            && t.val.cmp_mode(val, CmpMode::Casefold) == Ordering::Equal
                    })
                });
                if !ok && damaged.is_none() {
                    damaged = Some(format!(
                        "b-index {:?} records {:?} for an entry without such a tuple",
                        key, val
                    ));
                }
            });
            if let Some(msg) = damaged {
                return Err(Error::Inconsistent(msg));
            }
        }

        Ok(())
    }

    fn verify_tuples(&self, tuples: &[crate::entry::Tuple]) -> Result<()> {
        for pair in tuples.windows(2) {
            if pair[0].key.addr() > pair[1].key.addr() {
                return Err(Error::Inconsistent("tuples out of key order".into()));
            }
        }
        for (i, t) in tuples.iter().enumerate() {
            let range = group_range(tuples, &t.key);
            for other in &tuples[range.start..i] {
                if other.src.ptr_eq(&t.src) && other.val.eq_binary(&t.val) {
                    return Err(Error::Inconsistent("duplicate tuple".into()));
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for EntryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntryStore")
            .field("a_indices", &self.a_indices.len())
            .field("b_indices", &self.b_indices.len())
            .finish()
    }
}

/// Lock-free relation loader for snapshot load and log replay.
///
/// Relations for one entry are stored adjacently on disk, so the previous
/// entry is memoized and most loads skip the index search entirely.
pub struct Loader<'s> {
    store: &'s EntryStore,
    last: Option<(SharedStr, Value, Arc<Entry>)>,
}

impl<'s> Loader<'s> {
    /// Creates a loader over `store`.
    pub fn new(store: &'s EntryStore) -> Loader<'s> {
        Loader { store, last: None }
    }

    /// Adds a relation without taking transactional locks.
    pub fn add(
        &mut self,
        key_a: &SharedStr,
        val_a: &Value,
        key_b: &SharedStr,
        val_b: &Value,
        src: &SharedStr,
    ) -> bool {
        let entry = match &self.last {
            Some((k, v, e)) if k.ptr_eq(key_a) && value_ptr_eq(v, val_a) => Arc::clone(e),
            _ => {
                let index = match self.store.a_index(key_a, true) {
                    Some(index) => index,
                    None => return false,
                };
                let entry = match index.find(val_a).into_iter().next() {
                    Some(entry) => entry,
                    None => {
                        let entry = Entry::new(
                            key_a.clone(),
                            val_a.clone(),
                            self.store.registry.create_lock(),
                        );
                        index.insert(val_a, &entry);
                        entry
                    }
                };
                self.last = Some((key_a.clone(), val_a.clone(), Arc::clone(&entry)));
                entry
            }
        };

        let added = entry.insert(key_b.clone(), val_b.clone(), src.clone());
        if added {
            if let Some(b_index) = self.store.b_index(key_b.as_str()) {
                b_index.insert(val_b, &entry);
            }
        }
        added
    }

    /// Deletes a relation without taking transactional locks (log replay).
    pub fn del(
        &mut self,
        key_a: &SharedStr,
        val_a: &Value,
        key_b: &SharedStr,
        val_b: &Value,
        src: &SharedStr,
    ) -> bool {
        let index = match self.store.a_index(key_a, false) {
            Some(index) => index,
            None => return false,
        };
        let entry = match index.find(val_a).into_iter().next() {
            Some(entry) => entry,
            None => return false,
        };
        let removed = entry.remove(key_b, val_b, src);
        if removed {
            if let Some(b_index) = self.store.b_index(key_b.as_str()) {
                b_index.remove(val_b, &entry);
            }
        }
        removed
    }
}

/// Pointer identity for interned values: integers compare by value, strings
/// by allocation.
fn value_ptr_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x.ptr_eq(y),
        _ => false,
    }
}
