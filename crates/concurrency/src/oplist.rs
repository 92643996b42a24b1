//! Transaction operation log
//!
//! Every mutation of a transaction is recorded as an [`Op`] before it is
//! applied to the store. The list serves three masters: rollback (run the
//! inverse ops in reverse), the commit-time log write (serialize the ops
//! that a snapshot has not already captured), and recovery (re-execute ops
//! read back from the log).

use sonata_core::{SharedStr, Value};

/// One logical operation of a transaction.
#[derive(Debug, Clone)]
pub enum Op {
    /// A relation was added.
    Add {
        /// Entry key
        key_a: SharedStr,
        /// Entry value
        val_a: Value,
        /// Attribute key
        key_b: SharedStr,
        /// Attribute value
        val_b: Value,
        /// Asserting source
        src: SharedStr,
    },
    /// A relation was deleted.
    Del {
        /// Entry key
        key_a: SharedStr,
        /// Entry value
        val_a: Value,
        /// Attribute key
        key_b: SharedStr,
        /// Attribute value
        val_b: Value,
        /// Asserting source
        src: SharedStr,
    },
    /// Marker: every op before this one has been serialized into a snapshot
    /// and must not be written to the log again.
    Writing,
}

impl Op {
    /// The inverse operation, used for rollback. `Writing` has none.
    pub fn inverse(&self) -> Option<Op> {
        match self {
            Op::Add {
                key_a,
                val_a,
                key_b,
                val_b,
                src,
            } => Some(Op::Del {
                key_a: key_a.clone(),
                val_a: val_a.clone(),
                key_b: key_b.clone(),
                val_b: val_b.clone(),
                src: src.clone(),
            }),
            Op::Del {
                key_a,
                val_a,
                key_b,
                val_b,
                src,
            } => Some(Op::Add {
                key_a: key_a.clone(),
                val_a: val_a.clone(),
                key_b: key_b.clone(),
                val_b: val_b.clone(),
                src: src.clone(),
            }),
            Op::Writing => None,
        }
    }
}

/// The ordered operation log of one transaction.
#[derive(Debug, Default)]
pub struct OpList {
    ops: Vec<Op>,
}

impl OpList {
    /// Creates an empty list.
    pub fn new() -> OpList {
        OpList { ops: Vec::new() }
    }

    /// Records an add.
    pub fn push_add(
        &mut self,
        key_a: SharedStr,
        val_a: Value,
        key_b: SharedStr,
        val_b: Value,
        src: SharedStr,
    ) {
        self.ops.push(Op::Add {
            key_a,
            val_a,
            key_b,
            val_b,
            src,
        });
    }

    /// Records a delete.
    pub fn push_del(
        &mut self,
        key_a: SharedStr,
        val_a: Value,
        key_b: SharedStr,
        val_b: Value,
        src: SharedStr,
    ) {
        self.ops.push(Op::Del {
            key_a,
            val_a,
            key_b,
            val_b,
            src,
        });
    }

    /// Places the snapshot marker.
    pub fn push_writing(&mut self) {
        self.ops.push(Op::Writing);
    }

    /// True when no operation has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of recorded operations, markers included.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// All operations in issue order.
    pub fn iter(&self) -> std::slice::Iter<'_, Op> {
        self.ops.iter()
    }

    /// The operations the log writer still has to persist: everything after
    /// the last `Writing` marker.
    pub fn unlogged(&self) -> &[Op] {
        let cut = self
            .ops
            .iter()
            .rposition(|op| matches!(op, Op::Writing))
            .map(|i| i + 1)
            .unwrap_or(0);
        &self.ops[cut..]
    }

    /// Inverse operations in reverse issue order, for rollback.
    pub fn rollback_ops(&self) -> impl Iterator<Item = Op> + '_ {
        self.ops.iter().rev().filter_map(Op::inverse)
    }
}
