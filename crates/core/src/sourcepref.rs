//! Source preferences
//!
//! A source preference is an ordered list of glob patterns ranking the
//! sources that may assert an attribute. The priority of a source is the
//! index of the first pattern matching it; a source no pattern matches gets
//! `i32::MAX` and is never consulted by queries.

use crate::pattern::Pattern;
use crate::value::SharedStr;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// An ordered list of source glob patterns.
///
/// Priorities for interned source strings are memoized by allocation
/// address, so repeated lookups during a query walk are a map probe.
pub struct SourcePref {
    patterns: Vec<Pattern>,
    cache: Mutex<FxHashMap<usize, i32>>,
}

impl SourcePref {
    /// Builds a source preference from glob patterns, most preferred first.
    pub fn new(patterns: &[&str]) -> SourcePref {
        SourcePref {
            patterns: patterns.iter().map(|p| Pattern::new(p, false)).collect(),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    /// The priority of an interned source string (cached).
    pub fn priority(&self, src: &SharedStr) -> i32 {
        if let Some(p) = self.cache.lock().get(&src.addr()) {
            return *p;
        }
        let p = self.priority_of(src.as_str());
        self.cache.lock().insert(src.addr(), p);
        p
    }

    /// The priority of a source name: the index of the first matching
    /// pattern, or `i32::MAX` when none match.
    pub fn priority_of(&self, src: &str) -> i32 {
        self.patterns
            .iter()
            .position(|p| p.matches_str(src))
            .map(|i| i as i32)
            .unwrap_or(i32::MAX)
    }
}

impl std::fmt::Debug for SourcePref {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourcePref")
            .field("patterns", &self.patterns.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_match_wins() {
        let sp = SourcePref::new(&["server", "plugin/*", "*"]);
        assert_eq!(sp.priority_of("server"), 0);
        assert_eq!(sp.priority_of("plugin/id3v2"), 1);
        assert_eq!(sp.priority_of("client"), 2);
    }

    #[test]
    fn test_unmatched_source_is_int_max() {
        let sp = SourcePref::new(&["server", "plugin/*"]);
        assert_eq!(sp.priority_of("user"), i32::MAX);
    }

    #[test]
    fn test_empty_preference() {
        let sp = SourcePref::new(&[]);
        assert_eq!(sp.priority_of("anything"), i32::MAX);
    }

    #[test]
    fn test_interned_lookup_is_cached() {
        let sp = SourcePref::new(&["plugin/*"]);
        let src = SharedStr::new("plugin/flac");
        assert_eq!(sp.priority(&src), 0);
        assert_eq!(sp.priority(&src), 0);
        assert_eq!(sp.cache.lock().len(), 1);
    }
}
