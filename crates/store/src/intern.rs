//! Per-database constant pool
//!
//! Interning canonicalizes strings so that one allocation backs every use of
//! a given string within a database: keys, sources and string values can
//! then be compared by pointer, and the lazily computed casefold/collation
//! keys are shared database-wide through the common allocation.

use dashmap::DashMap;
use sonata_core::{SharedStr, Value};

/// The per-database string pool.
pub struct ConstPool {
    strings: DashMap<Box<str>, SharedStr>,
}

impl ConstPool {
    /// Creates an empty pool.
    pub fn new() -> ConstPool {
        ConstPool {
            strings: DashMap::new(),
        }
    }

    /// Returns the canonical shared string for `s`, creating it on first
    /// sight. The same input always yields the same allocation.
    pub fn intern_str(&self, s: &str) -> SharedStr {
        if let Some(hit) = self.strings.get(s) {
            return hit.clone();
        }
        self.strings
            .entry(Box::from(s))
            .or_insert_with(|| SharedStr::new(s))
            .clone()
    }

    /// Returns the canonical string value for `s`.
    pub fn intern_str_value(&self, s: &str) -> Value {
        Value::Str(self.intern_str(s))
    }

    /// Returns the interned form of an integer value.
    ///
    /// Integers are inline in [`Value`], so there is nothing to share; the
    /// method exists for symmetry with [`ConstPool::intern_str_value`].
    pub fn intern_int(&self, i: i32) -> Value {
        Value::Int(i)
    }

    /// Returns the interned form of any value.
    pub fn intern_value(&self, v: &Value) -> Value {
        match v {
            Value::Int(i) => self.intern_int(*i),
            Value::Str(s) => self.intern_str_value(s.as_str()),
        }
    }

    /// Number of distinct interned strings.
    pub fn strings_len(&self) -> usize {
        self.strings.len()
    }
}

impl Default for ConstPool {
    fn default() -> Self {
        ConstPool::new()
    }
}
