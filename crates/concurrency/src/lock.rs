//! Entry and index locks
//!
//! Every entry and every index carries a [`TxnLock`]. Locks are two-phase:
//! a transaction acquires them as it touches objects and releases everything
//! at commit or abort. All lock state lives behind one registry mutex so the
//! deadlock detector can walk the complete wait-for graph atomically; each
//! lock has its own condvar for wakeups.
//!
//! A transaction that would block publishes the lock it waits for. Before
//! sleeping, the registry follows holder → waited-lock → holder chains; if
//! any chain leads back to the waiter, the waiter is the victim and the
//! acquisition fails with `Deadlock`.

use parking_lot::{Condvar, Mutex};
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;
use sonata_core::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Identifies a transaction within one database.
pub type TxnId = u64;

/// Lock acquisition mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// Multiple readers
    Shared,
    /// One writer
    Exclusive,
}

struct LockSlot {
    mode: LockMode,
    holders: SmallVec<[TxnId; 2]>,
    cond: Arc<Condvar>,
}

impl LockSlot {
    fn new() -> Self {
        LockSlot {
            mode: LockMode::Shared,
            holders: SmallVec::new(),
            cond: Arc::new(Condvar::new()),
        }
    }
}

#[derive(Default)]
struct RegistryState {
    next_lock_id: u64,
    next_txn_id: u64,
    locks: FxHashMap<u64, LockSlot>,
    /// Which lock each blocked transaction is waiting for.
    waiting: FxHashMap<TxnId, u64>,
    /// Locks acquired by each transaction, released together at the end.
    held: FxHashMap<TxnId, Vec<u64>>,
}

/// The per-database lock table.
pub struct LockRegistry {
    state: Mutex<RegistryState>,
}

impl LockRegistry {
    /// Creates an empty registry.
    pub fn new() -> LockRegistry {
        LockRegistry {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Allocates a transaction id.
    pub fn new_txn(&self) -> TxnId {
        let mut st = self.state.lock();
        st.next_txn_id += 1;
        st.next_txn_id
    }

    /// Creates a lock owned by this registry.
    pub fn create_lock(self: &Arc<Self>) -> TxnLock {
        let mut st = self.state.lock();
        st.next_lock_id += 1;
        let id = st.next_lock_id;
        st.locks.insert(id, LockSlot::new());
        TxnLock {
            id,
            registry: Arc::clone(self),
        }
    }

    /// Releases every lock held by `txn` and wakes all waiters.
    pub fn release_all(&self, txn: TxnId) {
        let mut st = self.state.lock();
        st.waiting.remove(&txn);
        if let Some(ids) = st.held.remove(&txn) {
            for id in ids {
                if let Some(slot) = st.locks.get_mut(&id) {
                    slot.holders.retain(|t| *t != txn);
                    slot.cond.notify_all();
                }
            }
        }
    }

    fn acquire(&self, lock_id: u64, txn: TxnId, mode: LockMode) -> Result<()> {
        let mut st = self.state.lock();
        loop {
            let slot = match st.locks.get_mut(&lock_id) {
                Some(slot) => slot,
                // The object vanished while we slept; nothing left to lock.
                None => return Ok(()),
            };

            let already_holds = slot.holders.contains(&txn);
            let granted = if already_holds {
                match mode {
                    LockMode::Shared => true,
                    LockMode::Exclusive => {
                        if slot.mode == LockMode::Exclusive {
                            true
                        } else if slot.holders.len() == 1 {
                            // Sole shared holder upgrades in place.
                            slot.mode = LockMode::Exclusive;
                            true
                        } else {
                            false
                        }
                    }
                }
            } else if slot.holders.is_empty() {
                slot.mode = mode;
                slot.holders.push(txn);
                true
            } else if slot.mode == LockMode::Shared && mode == LockMode::Shared {
                slot.holders.push(txn);
                true
            } else {
                false
            };

            if granted {
                if !already_holds {
                    st.held.entry(txn).or_default().push(lock_id);
                }
                return Ok(());
            }

            if would_deadlock(&st, lock_id, txn) {
                debug!(txn, lock_id, "lock wait would close a cycle, aborting waiter");
                return Err(Error::Deadlock);
            }

            let cond = st
                .locks
                .get(&lock_id)
                .map(|slot| Arc::clone(&slot.cond))
                .expect("slot checked above");
            st.waiting.insert(txn, lock_id);
            cond.wait(&mut st);
            st.waiting.remove(&txn);
        }
    }

    fn drop_lock(&self, lock_id: u64) {
        let mut st = self.state.lock();
        st.locks.remove(&lock_id);
    }

    #[cfg(test)]
    fn holder_count(&self, lock_id: u64) -> usize {
        self.state
            .lock()
            .locks
            .get(&lock_id)
            .map(|s| s.holders.len())
            .unwrap_or(0)
    }
}

impl Default for LockRegistry {
    fn default() -> Self {
        LockRegistry::new()
    }
}

/// Walks holder → waited-lock → holder chains from the holders of `lock_id`.
/// Returns true when a chain reaches `me`, i.e. sleeping here would complete
/// a wait-for cycle.
fn would_deadlock(st: &RegistryState, lock_id: u64, me: TxnId) -> bool {
    let mut stack: Vec<TxnId> = match st.locks.get(&lock_id) {
        Some(slot) => slot.holders.iter().copied().filter(|t| *t != me).collect(),
        None => return false,
    };
    let mut seen: FxHashSet<TxnId> = FxHashSet::default();

    while let Some(t) = stack.pop() {
        if t == me {
            return true;
        }
        if !seen.insert(t) {
            continue;
        }
        if let Some(waited) = st.waiting.get(&t) {
            if let Some(slot) = st.locks.get(waited) {
                stack.extend(slot.holders.iter().copied());
            }
        }
    }
    false
}

/// A shared/exclusive lock registered with a [`LockRegistry`].
///
/// Acquisitions block until compatible; release happens only through
/// [`LockRegistry::release_all`], giving two-phase locking.
pub struct TxnLock {
    id: u64,
    registry: Arc<LockRegistry>,
}

impl TxnLock {
    /// Acquires the lock in shared mode for `txn`.
    pub fn shared(&self, txn: TxnId) -> Result<()> {
        self.registry.acquire(self.id, txn, LockMode::Shared)
    }

    /// Acquires the lock in exclusive mode for `txn`, upgrading a shared
    /// hold when `txn` is the only holder.
    pub fn exclusive(&self, txn: TxnId) -> Result<()> {
        self.registry.acquire(self.id, txn, LockMode::Exclusive)
    }
}

impl Drop for TxnLock {
    fn drop(&mut self) {
        self.registry.drop_lock(self.id);
    }
}

impl std::fmt::Debug for TxnLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxnLock").field("id", &self.id).finish()
    }
}
