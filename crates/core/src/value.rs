//! Value types
//!
//! A value is a tagged scalar: a 32-bit integer or a string. String values
//! carry two lazily computed derived keys (casefold and collation) used by
//! the non-binary comparison modes. Strings are shared through [`SharedStr`]
//! so that interned values — canonical instances handed out by a database's
//! constant pool — can be compared by pointer and share their derived keys
//! across the whole database.

use crate::collate;
use once_cell::sync::{Lazy, OnceCell};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// How two values are compared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpMode {
    /// Compare string bytes as-is
    Binary,
    /// Compare casefolded keys (Unicode case-insensitive)
    Casefold,
    /// Compare collation keys (case-insensitive, numbers order numerically)
    Collate,
}

struct StrData {
    raw: Box<str>,
    casefolded: OnceCell<Box<str>>,
    collated: OnceCell<Box<str>>,
}

/// A shared string with lazily computed casefold and collation keys.
///
/// Cloning is an `Arc` clone; the derived keys are computed once per shared
/// allocation. Two handles from the same interning pool compare equal by
/// pointer ([`SharedStr::ptr_eq`]) exactly when their strings are equal.
#[derive(Clone)]
pub struct SharedStr(Arc<StrData>);

impl SharedStr {
    /// Creates a new shared string owning a copy of `s`.
    pub fn new(s: &str) -> Self {
        SharedStr(Arc::new(StrData {
            raw: Box::from(s),
            casefolded: OnceCell::new(),
            collated: OnceCell::new(),
        }))
    }

    /// The raw string.
    pub fn as_str(&self) -> &str {
        &self.0.raw
    }

    /// The casefolded key, computed on first use.
    pub fn casefolded(&self) -> &str {
        self.0
            .casefolded
            .get_or_init(|| collate::casefold(&self.0.raw).into_boxed_str())
    }

    /// The collation key, computed on first use.
    pub fn collated(&self) -> &str {
        self.0
            .collated
            .get_or_init(|| collate::collate_key(&self.0.raw).into_boxed_str())
    }

    /// Whether `self` and `other` share one allocation.
    pub fn ptr_eq(&self, other: &SharedStr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// The allocation address, usable as a stable identity for interned
    /// strings within one database.
    pub fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

impl PartialEq for SharedStr {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.as_str() == other.as_str()
    }
}

impl Eq for SharedStr {}

impl std::hash::Hash for SharedStr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.as_str().hash(state);
    }
}

impl fmt::Debug for SharedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.as_str(), f)
    }
}

impl fmt::Display for SharedStr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged scalar value: integer or string.
#[derive(Clone)]
pub enum Value {
    /// 32-bit signed integer
    Int(i32),
    /// Shared string with cached derived keys
    Str(SharedStr),
}

/// Collation key of `"1"`, the bucket where integers land when collated
/// against non-numeric strings.
static COLLATED_ONE: Lazy<String> = Lazy::new(|| collate::collate_key("1"));

impl Value {
    /// Creates an integer value.
    pub fn int(i: i32) -> Value {
        Value::Int(i)
    }

    /// Creates an owning string value.
    pub fn string(s: &str) -> Value {
        Value::Str(SharedStr::new(s))
    }

    /// Produces an owning copy of this value.
    ///
    /// The copy does not share the original's allocation or derived-key
    /// caches.
    pub fn copy(&self) -> Value {
        match self {
            Value::Int(i) => Value::Int(*i),
            Value::Str(s) => Value::string(s.as_str()),
        }
    }

    /// Whether this is a string value.
    pub fn is_str(&self) -> bool {
        matches!(self, Value::Str(_))
    }

    /// Whether this is an integer value.
    pub fn is_int(&self) -> bool {
        matches!(self, Value::Int(_))
    }

    /// The integer, if this is an integer value.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Str(_) => None,
        }
    }

    /// The raw string, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            Value::Int(_) => None,
        }
    }

    /// The casefolded string, if this is a string value.
    pub fn casefolded(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.casefolded()),
            Value::Int(_) => None,
        }
    }

    /// The collation key, if this is a string value.
    pub fn collated(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.collated()),
            Value::Int(_) => None,
        }
    }

    /// The underlying shared string, if this is a string value.
    pub fn shared_str(&self) -> Option<&SharedStr> {
        match self {
            Value::Str(s) => Some(s),
            Value::Int(_) => None,
        }
    }

    /// Compares two values under the given mode.
    ///
    /// Integers compare numerically with each other in every mode. Strings
    /// compare by the mode's key. Mixed pairs are mode-dependent: under
    /// `Binary` and `Casefold`, integers order after strings — binary string
    /// order is not numeric (`"123" < "23"`) while integer order is, so the
    /// two domains must stay separate to keep the order antisymmetric. Under
    /// `Collate` a string with a leading integer compares numerically
    /// against the integer (ties broken by trailing text), and any other
    /// string compares against the collation key of `"1"`.
    pub fn cmp_mode(&self, other: &Value, mode: CmpMode) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => match mode {
                CmpMode::Binary => a.as_str().cmp(b.as_str()),
                CmpMode::Casefold => a.casefolded().cmp(b.casefolded()),
                CmpMode::Collate => a.collated().cmp(b.collated()),
            },
            (Value::Int(i), Value::Str(s)) => int_str_cmp(*i, s, mode),
            (Value::Str(s), Value::Int(i)) => int_str_cmp(*i, s, mode).reverse(),
        }
    }

    /// Binary equality (the mode used for tuple identity in the store).
    pub fn eq_binary(&self, other: &Value) -> bool {
        self.cmp_mode(other, CmpMode::Binary) == Ordering::Equal
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "Int({})", i),
            Value::Str(s) => write!(f, "Str({:?})", s.as_str()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => f.write_str(s.as_str()),
        }
    }
}

/// Compares the integer `i` against the string `s`.
fn int_str_cmp(i: i32, s: &SharedStr, mode: CmpMode) -> Ordering {
    if mode != CmpMode::Collate {
        // Integers order after strings in the binary and casefold modes.
        return Ordering::Greater;
    }

    match leading_int(s.as_str()) {
        Some((j, trailing)) => match (i as i64).cmp(&j) {
            Ordering::Equal if trailing => Ordering::Less,
            ord => ord,
        },
        None => COLLATED_ONE.as_str().cmp(s.collated()),
    }
}

/// Parses a leading integer off `s`, returning it together with a flag for
/// trailing text. Strings starting with whitespace are not numbers here.
fn leading_int(s: &str) -> Option<(i64, bool)> {
    let bytes = s.as_bytes();
    let mut idx = 0;
    let negative = bytes.first() == Some(&b'-');
    if negative {
        idx += 1;
    }

    let digits_start = idx;
    let mut value: i64 = 0;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        value = value
            .saturating_mul(10)
            .saturating_add((bytes[idx] - b'0') as i64);
        idx += 1;
    }
    if idx == digits_start {
        return None;
    }

    if negative {
        value = -value;
    }
    Some((value, idx < bytes.len()))
}
