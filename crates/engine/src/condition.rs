//! Query conditions
//!
//! A condition is a tree of filters and combiners. Filters test one
//! attribute of an entry; combiners glue filters together with
//! short-circuiting boolean logic. Both come in a `Custom` flavor carrying a
//! boxed closure.
//!
//! Filter checks are `Ordering`-valued: `Equal` means the value matches,
//! `Less` means the value is too small. Monotonic filters (those that
//! preserve index order) thereby double as the probe for index binary
//! search; everything else is evaluated during a linear scan.

use bitflags::bitflags;
use sonata_core::{CmpMode, Pattern, SourcePref, Value};
use std::cmp::Ordering;
use std::sync::Arc;

bitflags! {
    /// Condition flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CondFlags: u32 {
        /// The filter tests the entry's own `(key, value)` pair instead of
        /// its attribute tuples.
        const PARENT = 1;
    }
}

/// Built-in filter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Value equals the operand
    Equal,
    /// Value differs from the operand
    NotEqual,
    /// Value is greater than the operand
    Greater,
    /// Value is smaller than the operand
    Smaller,
    /// Value is greater than or equal to the operand
    GreaterEq,
    /// Value is smaller than or equal to the operand
    SmallerEq,
    /// Value matches a glob pattern built from the operand
    Match,
    /// The attribute exists at all
    Exists,
    /// Value contains the operand as a whitespace-separated token
    Token,
}

/// Combiner kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombinerKind {
    /// Every operand must match; stops at the first failure
    And,
    /// Any operand may match; stops at the first success
    Or,
    /// Inverts its single operand
    Not,
}

/// Boxed predicate of a custom filter.
pub type FilterFn = Box<dyn Fn(&Value) -> bool + Send + Sync>;

/// Boxed function of a custom combiner. Receives a check callback (true =
/// the operand matches the entry under evaluation) and the operand list.
pub type CombineFn =
    Box<dyn Fn(&dyn Fn(&Condition) -> bool, &[Arc<Condition>]) -> bool + Send + Sync>;

pub(crate) enum FilterTest {
    /// Comparison against a copied operand under the filter's mode.
    Cmp(FilterKind, Value),
    /// Glob match against a compiled pattern.
    Match(Pattern),
    /// Matches every value.
    Exists,
    /// Token match against a prepared needle.
    Token(String),
    /// User predicate.
    Custom(FilterFn),
    /// Matches nothing (a value-less filter that needed one).
    Never,
}

/// A filter condition.
pub struct Filter {
    pub(crate) key: Option<String>,
    pub(crate) sourcepref: Option<Arc<SourcePref>>,
    pub(crate) cmp_mode: CmpMode,
    pub(crate) flags: CondFlags,
    pub(crate) monotonic: bool,
    pub(crate) test: FilterTest,
}

/// A combiner condition.
pub struct Combiner {
    pub(crate) kind: CombinerLogic,
    pub(crate) operands: Vec<Arc<Condition>>,
}

pub(crate) enum CombinerLogic {
    Builtin(CombinerKind),
    Custom(CombineFn),
}

/// A node of the condition tree.
pub enum Condition {
    /// Tests one attribute of an entry
    Filter(Filter),
    /// Combines other conditions
    Combiner(Combiner),
}

impl Condition {
    /// Creates a built-in filter.
    ///
    /// `key` is the attribute to test; `None` means "any attribute" (or, in
    /// combination with [`CondFlags::PARENT`], the entry's own pair
    /// regardless of key). `value` is the operand; `Exists` ignores it. A
    /// kind that needs an operand but is given `None` matches nothing.
    pub fn filter(
        kind: FilterKind,
        key: Option<&str>,
        value: Option<&Value>,
        sourcepref: Option<Arc<SourcePref>>,
        cmp_mode: CmpMode,
        flags: CondFlags,
    ) -> Condition {
        let (test, monotonic) = match (kind, value) {
            (FilterKind::Exists, _) => (FilterTest::Exists, true),
            (FilterKind::Match, Some(v)) => {
                let text = match v.as_str() {
                    Some(s) => s.to_string(),
                    None => v.to_string(),
                };
                (
                    FilterTest::Match(Pattern::new(&text, cmp_mode == CmpMode::Casefold)),
                    false,
                )
            }
            (FilterKind::Token, Some(v)) => {
                let needle = match v {
                    Value::Int(i) => i.to_string(),
                    Value::Str(s) => match cmp_mode {
                        CmpMode::Casefold => s.casefolded().to_string(),
                        // Collated token matching makes no sense; fall back
                        // to binary, like Binary itself.
                        CmpMode::Binary | CmpMode::Collate => s.as_str().to_string(),
                    },
                };
                (FilterTest::Token(needle), false)
            }
            (kind, Some(v)) => {
                let monotonic = !matches!(kind, FilterKind::NotEqual);
                (FilterTest::Cmp(kind, v.copy()), monotonic)
            }
            (_, None) => (FilterTest::Never, false),
        };

        Condition::Filter(Filter {
            key: key.map(str::to_string),
            sourcepref,
            cmp_mode,
            flags,
            monotonic,
            test,
        })
    }

    /// Creates a filter with a user predicate. Custom filters are never
    /// monotonic.
    pub fn custom_filter(
        func: impl Fn(&Value) -> bool + Send + Sync + 'static,
        key: Option<&str>,
        sourcepref: Option<Arc<SourcePref>>,
        cmp_mode: CmpMode,
        flags: CondFlags,
    ) -> Condition {
        Condition::Filter(Filter {
            key: key.map(str::to_string),
            sourcepref,
            cmp_mode,
            flags,
            monotonic: false,
            test: FilterTest::Custom(Box::new(func)),
        })
    }

    /// Creates a combiner with no operands yet.
    pub fn combiner(kind: CombinerKind) -> Condition {
        Condition::Combiner(Combiner {
            kind: CombinerLogic::Builtin(kind),
            operands: Vec::new(),
        })
    }

    /// Creates a combiner with a user combine function.
    pub fn custom_combiner(
        func: impl Fn(&dyn Fn(&Condition) -> bool, &[Arc<Condition>]) -> bool
            + Send
            + Sync
            + 'static,
    ) -> Condition {
        Condition::Combiner(Combiner {
            kind: CombinerLogic::Custom(Box::new(func)),
            operands: Vec::new(),
        })
    }

    /// Appends an operand to a combiner. Ignored on filters.
    pub fn add_operand(&mut self, operand: Arc<Condition>) {
        if let Condition::Combiner(c) = self {
            c.operands.push(operand);
        }
    }

    /// The `i`th operand of a combiner.
    pub fn operand(&self, i: usize) -> Option<&Arc<Condition>> {
        match self {
            Condition::Combiner(c) => c.operands.get(i),
            Condition::Filter(_) => None,
        }
    }

    /// True for filter nodes.
    pub fn is_filter(&self) -> bool {
        matches!(self, Condition::Filter(_))
    }

    /// True for combiner nodes.
    pub fn is_combiner(&self) -> bool {
        matches!(self, Condition::Combiner(_))
    }

    /// The key a filter tests, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Condition::Filter(f) => f.key.as_deref(),
            Condition::Combiner(_) => None,
        }
    }

    /// The flags of a filter node.
    pub fn flags(&self) -> CondFlags {
        match self {
            Condition::Filter(f) => f.flags,
            Condition::Combiner(_) => CondFlags::empty(),
        }
    }

    /// Whether a filter preserves index order.
    pub fn is_monotonic(&self) -> bool {
        match self {
            Condition::Filter(f) => f.monotonic,
            Condition::Combiner(_) => false,
        }
    }

    /// The comparison mode of a filter node.
    pub fn cmp_mode(&self) -> Option<CmpMode> {
        match self {
            Condition::Filter(f) => Some(f.cmp_mode),
            Condition::Combiner(_) => None,
        }
    }

    /// The source preference of a filter node.
    pub fn sourcepref(&self) -> Option<&Arc<SourcePref>> {
        match self {
            Condition::Filter(f) => f.sourcepref.as_ref(),
            Condition::Combiner(_) => None,
        }
    }
}

impl Filter {
    /// Checks one value. `Equal` is a match; for monotonic filters the
    /// other orderings say which way an index search must move.
    pub(crate) fn check_value(&self, value: &Value) -> Ordering {
        match &self.test {
            FilterTest::Exists => Ordering::Equal,
            FilterTest::Cmp(kind, operand) => {
                let ord = value.cmp_mode(operand, self.cmp_mode);
                match kind {
                    FilterKind::Equal => ord,
                    FilterKind::NotEqual => {
                        if ord != Ordering::Equal {
                            Ordering::Equal
                        } else {
                            Ordering::Greater
                        }
                    }
                    FilterKind::Greater => {
                        if ord == Ordering::Greater {
                            Ordering::Equal
                        } else {
                            Ordering::Less
                        }
                    }
                    FilterKind::GreaterEq => {
                        if ord != Ordering::Less {
                            Ordering::Equal
                        } else {
                            Ordering::Less
                        }
                    }
                    FilterKind::Smaller => {
                        if ord == Ordering::Less {
                            Ordering::Equal
                        } else {
                            Ordering::Greater
                        }
                    }
                    FilterKind::SmallerEq => {
                        if ord != Ordering::Greater {
                            Ordering::Equal
                        } else {
                            Ordering::Greater
                        }
                    }
                    _ => Ordering::Greater,
                }
            }
            FilterTest::Match(pattern) => {
                if pattern.matches(value) {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            FilterTest::Token(needle) => {
                if token_match(needle, value, self.cmp_mode) {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            FilterTest::Custom(f) => {
                if f(value) {
                    Ordering::Equal
                } else {
                    Ordering::Greater
                }
            }
            FilterTest::Never => Ordering::Greater,
        }
    }
}

/// Token matching: the needle must equal one whitespace-separated token of
/// the value, or be a prefix of one when it ends in `*`. Integer values
/// match a numeric needle exactly, or by decimal left-factor for a starred
/// needle.
fn token_match(needle: &str, value: &Value, mode: CmpMode) -> bool {
    let hay = match value {
        Value::Str(s) => {
            if mode == CmpMode::Casefold {
                s.casefolded()
            } else {
                s.as_str()
            }
        }
        Value::Int(i) => return int_token_match(needle, *i),
    };

    let bytes = hay.as_bytes();
    let tok = needle.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }

        let mut j = 0;
        while i < bytes.len() && j < tok.len() && bytes[i] == tok[j] && tok[j] != b'*' {
            i += 1;
            j += 1;
        }

        let star = j < tok.len() && tok[j] == b'*';
        let exact = j == tok.len() && (i >= bytes.len() || bytes[i].is_ascii_whitespace());
        if star || exact {
            return true;
        }

        while i < bytes.len() && !bytes[i].is_ascii_whitespace() {
            i += 1;
        }
    }
    false
}

fn int_token_match(needle: &str, mut value: i32) -> bool {
    let bytes = needle.as_bytes();
    let mut idx = 0;
    if bytes.first() == Some(&b'-') {
        idx = 1;
    }
    let digits_start = idx;
    let mut parsed: i64 = 0;
    while idx < bytes.len() && bytes[idx].is_ascii_digit() {
        parsed = parsed * 10 + i64::from(bytes[idx] - b'0');
        idx += 1;
    }
    if idx == digits_start {
        return false;
    }
    if digits_start == 1 {
        parsed = -parsed;
    }

    match bytes.get(idx) {
        // A bare number must match exactly.
        None => parsed == i64::from(value),
        // A trailing star shifts the value until the digit counts agree.
        Some(b'*') => {
            while i64::from(value) > parsed {
                value /= 10;
            }
            i64::from(value) == parsed
        }
        Some(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cond: &Condition, v: &Value) -> Ordering {
        match cond {
            Condition::Filter(f) => f.check_value(v),
            Condition::Combiner(_) => unreachable!(),
        }
    }

    fn filter(kind: FilterKind, operand: &Value, mode: CmpMode) -> Condition {
        Condition::filter(kind, Some("k"), Some(operand), None, mode, CondFlags::empty())
    }

    #[test]
    fn test_equal_is_an_index_probe() {
        let f = filter(FilterKind::Equal, &Value::int(10), CmpMode::Casefold);
        assert_eq!(check(&f, &Value::int(5)), Ordering::Less);
        assert_eq!(check(&f, &Value::int(10)), Ordering::Equal);
        assert_eq!(check(&f, &Value::int(15)), Ordering::Greater);
        assert!(f.is_monotonic());
    }

    #[test]
    fn test_relational_filters() {
        let v = Value::int(10);
        assert_eq!(check(&filter(FilterKind::Greater, &v, CmpMode::Casefold), &Value::int(11)), Ordering::Equal);
        assert_eq!(check(&filter(FilterKind::Greater, &v, CmpMode::Casefold), &Value::int(10)), Ordering::Less);
        assert_eq!(check(&filter(FilterKind::GreaterEq, &v, CmpMode::Casefold), &Value::int(10)), Ordering::Equal);
        assert_eq!(check(&filter(FilterKind::Smaller, &v, CmpMode::Casefold), &Value::int(9)), Ordering::Equal);
        assert_eq!(check(&filter(FilterKind::Smaller, &v, CmpMode::Casefold), &Value::int(10)), Ordering::Greater);
        assert_eq!(check(&filter(FilterKind::SmallerEq, &v, CmpMode::Casefold), &Value::int(10)), Ordering::Equal);
    }

    #[test]
    fn test_notequal_is_not_monotonic() {
        let f = filter(FilterKind::NotEqual, &Value::int(10), CmpMode::Casefold);
        assert_eq!(check(&f, &Value::int(9)), Ordering::Equal);
        assert_ne!(check(&f, &Value::int(10)), Ordering::Equal);
        assert!(!f.is_monotonic());
    }

    #[test]
    fn test_match_filter_casefold() {
        let f = filter(
            FilterKind::Match,
            &Value::string("BEAT*"),
            CmpMode::Casefold,
        );
        assert_eq!(check(&f, &Value::string("Beatles")), Ordering::Equal);

        let exact = filter(FilterKind::Match, &Value::string("BEAT*"), CmpMode::Binary);
        assert_ne!(check(&exact, &Value::string("Beatles")), Ordering::Equal);
    }

    #[test]
    fn test_match_filter_int_operand() {
        // Integer operands become decimal patterns.
        let f = filter(FilterKind::Match, &Value::int(19), CmpMode::Binary);
        assert_eq!(check(&f, &Value::string("19")), Ordering::Equal);
        assert_eq!(check(&f, &Value::int(19)), Ordering::Equal);
        assert_ne!(check(&f, &Value::int(190)), Ordering::Equal);
    }

    #[test]
    fn test_exists_matches_everything() {
        let f = Condition::filter(
            FilterKind::Exists,
            None,
            None,
            None,
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_eq!(check(&f, &Value::int(1)), Ordering::Equal);
        assert_eq!(check(&f, &Value::string("x")), Ordering::Equal);
        assert!(f.is_monotonic());
    }

    #[test]
    fn test_valueless_filter_never_matches() {
        let f = Condition::filter(
            FilterKind::Equal,
            Some("k"),
            None,
            None,
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_ne!(check(&f, &Value::int(1)), Ordering::Equal);
    }

    #[test]
    fn test_token_match_strings() {
        let f = filter(
            FilterKind::Token,
            &Value::string("hello"),
            CmpMode::Binary,
        );
        assert_eq!(check(&f, &Value::string("say hello world")), Ordering::Equal);
        assert_eq!(check(&f, &Value::string("hello")), Ordering::Equal);
        assert_ne!(check(&f, &Value::string("hellos there")), Ordering::Equal);
        assert_ne!(check(&f, &Value::string("oh hell")), Ordering::Equal);
    }

    #[test]
    fn test_token_match_prefix_star() {
        let f = filter(FilterKind::Token, &Value::string("hell*"), CmpMode::Binary);
        assert_eq!(check(&f, &Value::string("hello there")), Ordering::Equal);
        assert_eq!(check(&f, &Value::string("one hell")), Ordering::Equal);
        assert_ne!(check(&f, &Value::string("shell")), Ordering::Equal);
    }

    #[test]
    fn test_token_match_ints() {
        let exact = filter(FilterKind::Token, &Value::string("12"), CmpMode::Binary);
        assert_eq!(check(&exact, &Value::int(12)), Ordering::Equal);
        assert_ne!(check(&exact, &Value::int(123)), Ordering::Equal);

        let star = filter(FilterKind::Token, &Value::string("12*"), CmpMode::Binary);
        assert_eq!(check(&star, &Value::int(12)), Ordering::Equal);
        assert_eq!(check(&star, &Value::int(1234)), Ordering::Equal);
        assert_ne!(check(&star, &Value::int(21)), Ordering::Equal);
    }

    #[test]
    fn test_custom_filter() {
        let f = Condition::custom_filter(
            |v| v.as_int().map(|i| i % 2 == 0).unwrap_or(false),
            Some("year"),
            None,
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_eq!(check(&f, &Value::int(4)), Ordering::Equal);
        assert_ne!(check(&f, &Value::int(5)), Ordering::Equal);
        assert!(!f.is_monotonic());
    }

    #[test]
    fn test_combiner_operands() {
        let mut and = Condition::combiner(CombinerKind::And);
        and.add_operand(Arc::new(filter(
            FilterKind::Equal,
            &Value::int(1),
            CmpMode::Binary,
        )));
        assert!(and.is_combiner());
        assert!(and.operand(0).is_some());
        assert!(and.operand(1).is_none());
    }
}
