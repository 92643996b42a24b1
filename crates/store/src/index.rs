//! Value indices
//!
//! An index is a sorted vector of `(value, entries)` nodes compared with the
//! casefold mode, so binary-distinct but case-equal values share one node.
//! Entry lists are deduplicated by pointer and reference-counted: a b-index
//! may record the same entry once per tuple that carries the indexed value.
//!
//! Search takes an `Ordering`-valued probe — `Equal` means the node matches,
//! `Less` means the node value is too small. Monotonic probes use binary
//! search; everything else scans linearly.

use parking_lot::RwLock;
use rustc_hash::FxHashSet;
use smallvec::SmallVec;
use sonata_concurrency::TxnLock;
use sonata_core::{CmpMode, Value};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::entry::Entry;

struct Node {
    val: Value,
    entries: SmallVec<[(Arc<Entry>, u32); 1]>,
}

/// A value → entries index with a transactional lock.
pub struct Index {
    lock: TxnLock,
    nodes: RwLock<Vec<Node>>,
}

impl Index {
    /// Creates an empty index.
    pub fn new(lock: TxnLock) -> Arc<Index> {
        Arc::new(Index {
            lock,
            nodes: RwLock::new(Vec::new()),
        })
    }

    /// The transactional lock of this index.
    pub fn lock(&self) -> &TxnLock {
        &self.lock
    }

    /// Number of distinct (casefold) values.
    pub fn node_count(&self) -> usize {
        self.nodes.read().len()
    }

    /// Records `entry` under `val`, creating the node if needed. Repeated
    /// insertions of the same pair bump a reference count.
    pub fn insert(&self, val: &Value, entry: &Arc<Entry>) {
        let mut nodes = self.nodes.write();
        let pos = nodes.partition_point(|n| n.val.cmp_mode(val, CmpMode::Casefold) == Ordering::Less);

        let found = nodes
            .get(pos)
            .map_or(false, |n| n.val.cmp_mode(val, CmpMode::Casefold) == Ordering::Equal);
        if !found {
            nodes.insert(
                pos,
                Node {
                    val: val.clone(),
                    entries: SmallVec::new(),
                },
            );
        }
        let node = &mut nodes[pos];

        let addr = Arc::as_ptr(entry) as usize;
        match node
            .entries
            .iter_mut()
            .find(|(e, _)| Arc::as_ptr(e) as usize == addr)
        {
            Some((_, count)) => *count += 1,
            None => node.entries.push((Arc::clone(entry), 1)),
        }
    }

    /// Removes one reference of `entry` under `val`. The entry leaves the
    /// node when its count reaches zero; an empty node is dropped. Returns
    /// false when the pair is not present.
    pub fn remove(&self, val: &Value, entry: &Arc<Entry>) -> bool {
        let mut nodes = self.nodes.write();
        let pos = nodes.partition_point(|n| n.val.cmp_mode(val, CmpMode::Casefold) == Ordering::Less);

        let found = nodes
            .get(pos)
            .map_or(false, |n| n.val.cmp_mode(val, CmpMode::Casefold) == Ordering::Equal);
        if !found {
            return false;
        }
        let node = &mut nodes[pos];

        let addr = Arc::as_ptr(entry) as usize;
        let idx = match node
            .entries
            .iter()
            .position(|(e, _)| Arc::as_ptr(e) as usize == addr)
        {
            Some(idx) => idx,
            None => return false,
        };

        node.entries[idx].1 -= 1;
        if node.entries[idx].1 == 0 {
            node.entries.remove(idx);
        }
        if node.entries.is_empty() {
            nodes.remove(pos);
        }
        true
    }

    /// All entries stored under values casefold-equal to `val`.
    pub fn find(&self, val: &Value) -> Vec<Arc<Entry>> {
        self.search(|v| v.cmp_mode(val, CmpMode::Casefold))
    }

    /// Binary search with a monotonic probe; collects every entry of every
    /// matching node, deduplicated by entry pointer.
    pub fn search(&self, probe: impl Fn(&Value) -> Ordering) -> Vec<Arc<Entry>> {
        let nodes = self.nodes.read();
        // First node that is not too small.
        let lo = nodes.partition_point(|n| probe(&n.val) == Ordering::Less);

        let mut seen = FxHashSet::default();
        let mut found = Vec::new();
        for node in nodes[lo..]
            .iter()
            .take_while(|n| probe(&n.val) == Ordering::Equal)
        {
            collect(node, &mut seen, &mut found);
        }
        found
    }

    /// Linear scan for probes that do not preserve the index order.
    pub fn lsearch(&self, probe: impl Fn(&Value) -> Ordering) -> Vec<Arc<Entry>> {
        let nodes = self.nodes.read();
        let mut seen = FxHashSet::default();
        let mut found = Vec::new();
        for node in nodes.iter().filter(|n| probe(&n.val) == Ordering::Equal) {
            collect(node, &mut seen, &mut found);
        }
        found
    }

    /// Every entry in the index, deduplicated.
    pub fn all_entries(&self) -> Vec<Arc<Entry>> {
        self.lsearch(|_| Ordering::Equal)
    }

    /// Runs `f` over each `(value, entry)` pair, in value order.
    pub fn for_each(&self, mut f: impl FnMut(&Value, &Arc<Entry>)) {
        let nodes = self.nodes.read();
        for node in nodes.iter() {
            for (entry, _) in &node.entries {
                f(&node.val, entry);
            }
        }
    }
}

fn collect(node: &Node, seen: &mut FxHashSet<usize>, found: &mut Vec<Arc<Entry>>) {
    for (entry, _) in &node.entries {
        if seen.insert(Arc::as_ptr(entry) as usize) {
            found.push(Arc::clone(entry));
        }
    }
}

impl std::fmt::Debug for Index {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("nodes", &self.node_count())
            .finish()
    }
}
