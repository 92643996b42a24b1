//! Transactions
//!
//! A transaction is the only way to touch a database: it carries the op
//! list, owns the fine-grained locks it acquires (two-phase), and holds the
//! file-level read lock that keeps the checkpoint barrier out until it
//! finishes.
//!
//! Failure is latched: once an operation fails, the transaction remembers
//! the error kind, later `add`/`del` calls are no-ops, `query` returns an
//! empty set, and `commit` rolls everything back and reports the stored
//! kind. A transaction dropped without `commit` or `abort` aborts.

use bitflags::bitflags;
use parking_lot::RwLockReadGuard;
use sonata_concurrency::{Op, OpList, TxnId};
use sonata_core::{set_errno, ErrorKind, Result, Value};
use sonata_durability::{LogOp, RecordKind};
use tracing::debug;

use crate::condition::Condition;
use crate::database::DbInner;
use crate::fetchspec::FetchSpec;
use crate::query;
use crate::resultset::ResultSet;

bitflags! {
    /// Transaction flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransFlags: u32 {
        /// The transaction may only query; writes fail with `ReadOnly`.
        const READ_ONLY = 1;
    }
}

/// An open transaction on a [`crate::Database`].
pub struct Transaction<'db> {
    inner: &'db DbInner,
    /// Keeps the checkpoint barrier out while the transaction lives.
    barrier: Option<RwLockReadGuard<'db, ()>>,
    txn: TxnId,
    ops: OpList,
    flags: TransFlags,
    failed: Option<ErrorKind>,
    restartable: bool,
    finished: bool,
}

impl<'db> Transaction<'db> {
    pub(crate) fn begin(inner: &'db DbInner, flags: TransFlags) -> Transaction<'db> {
        Self::new(inner, flags, true)
    }

    /// A transaction for the checkpoint itself. The caller already holds
    /// the write side of the barrier, so this one must not take the read
    /// side.
    pub(crate) fn begin_exempt(inner: &'db DbInner) -> Transaction<'db> {
        Self::new(inner, TransFlags::empty(), false)
    }

    fn new(inner: &'db DbInner, flags: TransFlags, take_barrier: bool) -> Transaction<'db> {
        Transaction {
            inner,
            barrier: take_barrier.then(|| inner.barrier.read()),
            txn: inner.registry.new_txn(),
            ops: OpList::new(),
            flags,
            failed: None,
            restartable: true,
            finished: false,
        }
    }

    /// Marks every op recorded so far as captured by a snapshot; the log
    /// writer skips them at commit.
    pub(crate) fn mark_writing(&mut self) {
        self.ops.push_writing();
    }

    /// Adds a relation. Returns false when the operation failed; adding an
    /// already-present tuple is a successful no-op.
    pub fn add(&mut self, key_a: &str, val_a: &Value, key_b: &str, val_b: &Value, src: &str) -> bool {
        if self.flags.contains(TransFlags::READ_ONLY) {
            self.fail(ErrorKind::ReadOnly);
            return false;
        }
        if self.failed.is_some() {
            return false;
        }

        let inner = self.inner;
        let ka = inner.pool.intern_str(key_a);
        let va = inner.pool.intern_value(val_a);
        let kb = inner.pool.intern_str(key_b);
        let vb = inner.pool.intern_value(val_b);
        let s = inner.pool.intern_str(src);

        match inner.store.add(self.txn, &ka, &va, &kb, &vb, &s) {
            Ok(true) => {
                self.ops.push_add(ka, va, kb, vb, s);
                true
            }
            // The exact tuple is already there; nothing to undo or log.
            Ok(false) => true,
            Err(e) => {
                self.fail(e.kind());
                false
            }
        }
    }

    /// Deletes a relation. Deleting an absent tuple is a failure.
    pub fn del(&mut self, key_a: &str, val_a: &Value, key_b: &str, val_b: &Value, src: &str) -> bool {
        if self.flags.contains(TransFlags::READ_ONLY) {
            self.fail(ErrorKind::ReadOnly);
            return false;
        }
        if self.failed.is_some() {
            return false;
        }

        let inner = self.inner;
        let ka = inner.pool.intern_str(key_a);
        let va = inner.pool.intern_value(val_a);
        let kb = inner.pool.intern_str(key_b);
        let vb = inner.pool.intern_value(val_b);
        let s = inner.pool.intern_str(src);

        match inner.store.del(self.txn, &ka, &va, &kb, &vb, &s) {
            Ok(true) => {
                self.ops.push_del(ka, va, kb, vb, s);
                true
            }
            Ok(false) => {
                self.fail(ErrorKind::Execute);
                false
            }
            Err(e) => {
                self.fail(e.kind());
                false
            }
        }
    }

    /// Runs a query. A failed transaction yields an empty result set. The
    /// transaction stops being restartable once it has observed data.
    pub fn query(&mut self, fs: &FetchSpec, cond: &Condition) -> ResultSet {
        self.restartable = false;
        if self.failed.is_some() {
            return ResultSet::new(0);
        }

        let inner = self.inner;
        match query::run(&inner.pool, &inner.store, self.txn, fs, cond) {
            Ok(set) => set,
            Err(e) => {
                self.fail(e.kind());
                ResultSet::new(0)
            }
        }
    }

    /// Commits the transaction: the op list is written to the log in one
    /// batch, then every lock is released. On failure (including a latched
    /// earlier failure) everything is rolled back and the error kind is
    /// reported, also through the thread-local errno.
    pub fn commit(mut self) -> Result<()> {
        if let Some(kind) = self.failed {
            return self.finish_failed(kind);
        }

        let inner = self.inner;
        if let Some(log) = &inner.log {
            let unlogged = self.ops.unlogged();
            if !unlogged.is_empty() {
                let records: Vec<LogOp<'_>> = unlogged.iter().filter_map(as_log_op).collect();
                let appended = log.lock().append(&records);
                match appended {
                    Ok(wake) => {
                        if wake {
                            inner.sync.solicit();
                        }
                    }
                    Err(e) => {
                        let kind = e.kind();
                        if kind == ErrorKind::LogFull {
                            // The background checkpoint will drain the log;
                            // the caller is expected to retry.
                            debug!("commit hit a full log, soliciting checkpoint");
                            inner.sync.solicit();
                        }
                        return self.finish_failed(kind);
                    }
                }
            }
        }

        self.release();
        Ok(())
    }

    /// Aborts the transaction; the database behaves as if it never
    /// happened.
    pub fn abort(mut self) {
        self.rollback();
        self.release();
    }

    /// Whether an operation has failed and latched the transaction.
    pub fn is_failed(&self) -> bool {
        self.failed.is_some()
    }

    /// The latched error kind, if any.
    pub fn error(&self) -> Option<ErrorKind> {
        self.failed
    }

    /// True while the transaction can be blindly re-run after a deadlock
    /// abort: it has not returned any data to the caller yet.
    pub fn is_restartable(&self) -> bool {
        self.restartable
    }

    fn fail(&mut self, kind: ErrorKind) {
        if self.failed.is_none() {
            debug!(?kind, "transaction failed");
            self.failed = Some(kind);
        }
    }

    fn finish_failed(&mut self, kind: ErrorKind) -> Result<()> {
        self.rollback();
        self.release();
        set_errno(kind);
        Err(kind.into())
    }

    /// Applies the inverse op list. All locks needed are already held, so
    /// rollback cannot block; individual failures are ignored.
    fn rollback(&mut self) {
        let inner = self.inner;
        for op in self.ops.rollback_ops() {
            match &op {
                Op::Add {
                    key_a,
                    val_a,
                    key_b,
                    val_b,
                    src,
                } => {
                    let _ = inner.store.add(self.txn, key_a, val_a, key_b, val_b, src);
                }
                Op::Del {
                    key_a,
                    val_a,
                    key_b,
                    val_b,
                    src,
                } => {
                    let _ = inner.store.del(self.txn, key_a, val_a, key_b, val_b, src);
                }
                Op::Writing => {}
            }
        }
    }

    fn release(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.inner.registry.release_all(self.txn);
        self.barrier = None;
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.rollback();
            self.release();
        }
    }
}

fn as_log_op(op: &Op) -> Option<LogOp<'_>> {
    match op {
        Op::Add {
            key_a,
            val_a,
            key_b,
            val_b,
            src,
        } => Some(LogOp {
            kind: RecordKind::Add,
            key_a: key_a.as_str(),
            val_a,
            key_b: key_b.as_str(),
            val_b,
            src: src.as_str(),
        }),
        Op::Del {
            key_a,
            val_a,
            key_b,
            val_b,
            src,
        } => Some(LogOp {
            kind: RecordKind::Del,
            key_a: key_a.as_str(),
            val_a,
            key_b: key_b.as_str(),
            val_b,
            src: src.as_str(),
        }),
        Op::Writing => None,
    }
}
