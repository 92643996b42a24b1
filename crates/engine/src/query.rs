//! Query execution
//!
//! A query walks a set of candidate entries, evaluates the condition tree
//! against each, and projects the matches through the fetch spec. The
//! candidate set comes from the cheapest index the condition admits:
//!
//! - a PARENT-flagged filter with a key scans that key's a-index;
//! - a filter on a key with a declared b-index scans the b-index;
//! - anything else unions every a-index (full scan).
//!
//! Monotonic filters binary-search the chosen index; other filters scan it
//! linearly. Entries are shared-locked before evaluation and the locks stay
//! with the transaction (two-phase locking).

use rustc_hash::FxHashMap;
use sonata_concurrency::TxnId;
use sonata_core::{Result, SharedStr};
use sonata_store::entry::{group_range, Tuple};
use sonata_store::{ConstPool, Entry, EntryStore};
use std::cell::RefCell;
use std::cmp::Ordering;
use std::ops::Range;
use std::sync::Arc;
use tracing::trace;

use crate::condition::{CombinerLogic, CombinerKind, CondFlags, Condition, Filter};
use crate::fetchspec::{FetchFlags, FetchItem, FetchSpec};
use crate::resultset::{ResultNode, ResultRow, ResultSet};

/// Per-query evaluation context: interned filter keys are memoized by
/// filter identity so each filter resolves its key once per query.
struct QueryCtx<'a> {
    pool: &'a ConstPool,
    keys: RefCell<FxHashMap<usize, Option<SharedStr>>>,
}

impl<'a> QueryCtx<'a> {
    fn new(pool: &'a ConstPool) -> QueryCtx<'a> {
        QueryCtx {
            pool,
            keys: RefCell::new(FxHashMap::default()),
        }
    }

    fn filter_key(&self, filter: &Filter) -> Option<SharedStr> {
        let id = filter as *const Filter as usize;
        self.keys
            .borrow_mut()
            .entry(id)
            .or_insert_with(|| filter.key.as_deref().map(|k| self.pool.intern_str(k)))
            .clone()
    }
}

/// How the candidate entries of a query are found. Exposed for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ScanPlan {
    /// Scan the a-index of this key
    IndexA(String),
    /// Scan the declared b-index of this key
    IndexB(String),
    /// Union of every a-index
    FullScan,
}

pub(crate) fn classify(cond: &Condition, store: &EntryStore) -> ScanPlan {
    if let Condition::Filter(f) = cond {
        if let Some(key) = f.key.as_deref() {
            if f.flags.contains(CondFlags::PARENT) {
                return ScanPlan::IndexA(key.to_string());
            }
            if store.b_index(key).is_some() {
                return ScanPlan::IndexB(key.to_string());
            }
        }
    }
    ScanPlan::FullScan
}

/// Runs a query against the store on behalf of `txn`. Fails with `Deadlock`
/// when any lock acquisition would close a wait-for cycle.
pub(crate) fn run(
    pool: &ConstPool,
    store: &EntryStore,
    txn: TxnId,
    fs: &FetchSpec,
    cond: &Condition,
) -> Result<ResultSet> {
    let ctx = QueryCtx::new(pool);

    // Resolve fetch keys up front; they are compared by pointer against
    // tuple keys during projection.
    let fetch_keys: Vec<Option<SharedStr>> = fs
        .items()
        .iter()
        .map(|item| item.key.as_deref().map(|k| pool.intern_str(k)))
        .collect();

    let entries = select_entries(&ctx, store, txn, cond)?;
    trace!(
        plan = ?classify(cond, store),
        candidates = entries.len(),
        "query candidate set selected"
    );

    let mut set = ResultSet::new(fs.len());
    for entry in entries {
        entry.lock().shared(txn)?;
        if !entry.is_empty() && check_cond(&ctx, cond, &entry) {
            set.add_row(fetch(&entry, fs.items(), &fetch_keys));
        }
    }
    Ok(set)
}

/// Picks the candidate entries per the scan plan, taking shared index
/// locks.
fn select_entries(
    ctx: &QueryCtx<'_>,
    store: &EntryStore,
    txn: TxnId,
    cond: &Condition,
) -> Result<Vec<Arc<Entry>>> {
    if let Condition::Filter(f) = cond {
        let key = ctx.filter_key(f);

        if f.flags.contains(CondFlags::PARENT) {
            if let Some(key) = key {
                let index = match store.a_index(&key, false) {
                    Some(index) => index,
                    None => return Ok(Vec::new()),
                };
                index.lock().shared(txn)?;
                return Ok(if f.monotonic {
                    index.search(|v| f.check_value(v))
                } else {
                    index.lsearch(|v| f.check_value(v))
                });
            }
        } else if let Some(key) = key {
            if let Some(index) = store.b_index(key.as_str()) {
                index.lock().shared(txn)?;
                return Ok(if f.monotonic {
                    index.search(|v| f.check_value(v))
                } else {
                    index.lsearch(|v| f.check_value(v))
                });
            }
        }
    }

    let mut entries = Vec::new();
    for (_, index) in store.all_a_indices() {
        index.lock().shared(txn)?;
        entries.extend(index.all_entries());
    }
    Ok(entries)
}

/// Evaluates the condition tree against one entry.
fn check_cond(ctx: &QueryCtx<'_>, cond: &Condition, entry: &Arc<Entry>) -> bool {
    match cond {
        Condition::Combiner(c) => match &c.kind {
            CombinerLogic::Builtin(CombinerKind::And) => c
                .operands
                .iter()
                .all(|op| check_cond(ctx, op, entry)),
            CombinerLogic::Builtin(CombinerKind::Or) => c
                .operands
                .iter()
                .any(|op| check_cond(ctx, op, entry)),
            CombinerLogic::Builtin(CombinerKind::Not) => c
                .operands
                .first()
                .map(|op| !check_cond(ctx, op, entry))
                .unwrap_or(false),
            CombinerLogic::Custom(f) => {
                let check = |op: &Condition| check_cond(ctx, op, entry);
                f(&check, &c.operands)
            }
        },
        Condition::Filter(f) => check_filter(ctx, f, entry),
    }
}

fn check_filter(ctx: &QueryCtx<'_>, filter: &Filter, entry: &Arc<Entry>) -> bool {
    let key = ctx.filter_key(filter);

    if filter.flags.contains(CondFlags::PARENT) {
        // The filter tests the entry's own pair; a key, when present, must
        // be the entry's key.
        return match key {
            Some(key) if !key.ptr_eq(entry.key()) => false,
            _ => filter.check_value(entry.value()) == Ordering::Equal,
        };
    }

    entry.with_tuples(|tuples| match key {
        Some(key) => check_group(filter, tuples, group_range(tuples, &key)),
        None => {
            // Any-key filter: a match in any group wins.
            let mut i = 0;
            while i < tuples.len() {
                let group = group_range(tuples, &tuples[i].key.clone());
                let end = group.end;
                if check_group(filter, tuples, group) {
                    return true;
                }
                i = end;
            }
            false
        }
    })
}

/// Evaluates a filter over one key group: only the tuples whose source has
/// the group's best priority are consulted, and every one of them must
/// satisfy the filter. Sources matching no preference pattern (priority
/// `i32::MAX`) are invisible.
fn check_group(filter: &Filter, tuples: &[Tuple], group: Range<usize>) -> bool {
    if group.is_empty() {
        return false;
    }

    let priority = |tuple: &Tuple| match &filter.sourcepref {
        Some(sp) => sp.priority(&tuple.src),
        None => 0,
    };

    let best = tuples[group.clone()]
        .iter()
        .map(priority)
        .min()
        .unwrap_or(i32::MAX);
    if best == i32::MAX {
        return false;
    }

    tuples[group]
        .iter()
        .filter(|t| priority(t) == best)
        .all(|t| filter.check_value(&t.val) == Ordering::Equal)
}

/// Projects one matched entry through the fetch spec.
fn fetch(entry: &Arc<Entry>, items: &[FetchItem], fetch_keys: &[Option<SharedStr>]) -> ResultRow {
    let mut cols = Vec::with_capacity(items.len());

    for (item, key) in items.iter().zip(fetch_keys) {
        let mut result: Option<Box<ResultNode>> = None;

        let wants_parent = item.flags.contains(FetchFlags::PARENT)
            && key
                .as_ref()
                .map(|k| k.ptr_eq(entry.key()))
                .unwrap_or(true);
        if wants_parent {
            result = Some(Box::new(ResultNode::new(
                entry.key().clone(),
                entry.value().clone(),
                None,
                result.take(),
            )));
        }

        if item.flags.contains(FetchFlags::DATA) {
            entry.with_tuples(|tuples| {
                match key {
                    Some(key) => {
                        fetch_group(item, tuples, group_range(tuples, key), &mut result);
                    }
                    None => {
                        let mut i = 0;
                        while i < tuples.len() {
                            let group = group_range(tuples, &tuples[i].key.clone());
                            let end = group.end;
                            fetch_group(item, tuples, group, &mut result);
                            i = end;
                        }
                    }
                }
            });
        }

        cols.push(result.map(|b| *b));
    }

    ResultRow::new(cols)
}

/// Emits every best-priority tuple of the group, prepending to the cell's
/// list (so the list runs newest-prepended first).
fn fetch_group(
    item: &FetchItem,
    tuples: &[Tuple],
    group: Range<usize>,
    result: &mut Option<Box<ResultNode>>,
) {
    if group.is_empty() {
        return;
    }

    let priority = |tuple: &Tuple| match &item.sourcepref {
        Some(sp) => sp.priority(&tuple.src),
        None => 0,
    };

    let best = tuples[group.clone()]
        .iter()
        .map(priority)
        .min()
        .unwrap_or(i32::MAX);
    if best == i32::MAX {
        return;
    }

    for tuple in tuples[group].iter().filter(|t| priority(t) == best) {
        *result = Some(Box::new(ResultNode::new(
            tuple.key.clone(),
            tuple.val.clone(),
            Some(tuple.src.clone()),
            result.take(),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::FilterKind;
    use sonata_concurrency::LockRegistry;
    use sonata_core::{CmpMode, Value};

    struct Fixture {
        pool: ConstPool,
        registry: Arc<LockRegistry>,
        store: EntryStore,
    }

    fn setup(indices: &[&str]) -> Fixture {
        let registry = Arc::new(LockRegistry::new());
        let store = EntryStore::new(Arc::clone(&registry));
        for key in indices {
            store.declare_b_index(key);
        }
        Fixture {
            pool: ConstPool::new(),
            registry,
            store,
        }
    }

    impl Fixture {
        fn add(&self, ka: &str, va: &Value, kb: &str, vb: &Value, src: &str) {
            let txn = self.registry.new_txn();
            self.store
                .add(
                    txn,
                    &self.pool.intern_str(ka),
                    &self.pool.intern_value(va),
                    &self.pool.intern_str(kb),
                    &self.pool.intern_value(vb),
                    &self.pool.intern_str(src),
                )
                .unwrap();
            self.registry.release_all(txn);
        }

        fn query(&self, fs: &FetchSpec, cond: &Condition) -> ResultSet {
            let txn = self.registry.new_txn();
            let set = run(&self.pool, &self.store, txn, fs, cond).unwrap();
            self.registry.release_all(txn);
            set
        }
    }

    fn parent_eq(key: &str, value: &Value) -> Condition {
        Condition::filter(
            FilterKind::Equal,
            Some(key),
            Some(value),
            None,
            CmpMode::Casefold,
            CondFlags::PARENT,
        )
    }

    fn data_fetch(key: Option<&str>) -> FetchSpec {
        let mut fs = FetchSpec::new();
        fs.add(key, None, FetchFlags::DATA);
        fs
    }

    #[test]
    fn test_parent_filter_selects_by_entry_value() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("Miles"), "album", &Value::string("Kind of Blue"), "id3");
        fx.add("artist", &Value::string("Trane"), "album", &Value::string("Giant Steps"), "id3");

        let set = fx.query(
            &data_fetch(Some("album")),
            &parent_eq("artist", &Value::string("Miles")),
        );
        assert_eq!(set.row_count(), 1);
        let cell = set.result(0, 0).unwrap();
        assert_eq!(cell.value().as_str(), Some("Kind of Blue"));
        assert_eq!(cell.src(), Some("id3"));
        assert!(cell.next().is_none());
    }

    #[test]
    fn test_attribute_filter_walks_tuples() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "year", &Value::int(1984), "src");
        fx.add("artist", &Value::string("Y"), "year", &Value::int(2001), "src");

        let cond = Condition::filter(
            FilterKind::Smaller,
            Some("year"),
            Some(&Value::int(2000)),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        let set = fx.query(&data_fetch(None), &cond);
        assert_eq!(set.row_count(), 1);
    }

    #[test]
    fn test_any_key_filter() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "album", &Value::string("hit"), "src");
        fx.add("artist", &Value::string("Y"), "title", &Value::string("hit"), "src");
        fx.add("artist", &Value::string("Z"), "title", &Value::string("miss"), "src");

        let cond = Condition::filter(
            FilterKind::Equal,
            None,
            Some(&Value::string("hit")),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        let set = fx.query(&data_fetch(None), &cond);
        assert_eq!(set.row_count(), 2);
    }

    #[test]
    fn test_combiners_short_circuit_semantics() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "year", &Value::int(1984), "src");

        let year_eq = |y: i32| {
            Arc::new(Condition::filter(
                FilterKind::Equal,
                Some("year"),
                Some(&Value::int(y)),
                None,
                CmpMode::Casefold,
                CondFlags::empty(),
            ))
        };

        let mut and = Condition::combiner(CombinerKind::And);
        and.add_operand(year_eq(1984));
        and.add_operand(year_eq(1985));
        assert_eq!(fx.query(&data_fetch(None), &and).row_count(), 0);

        let mut or = Condition::combiner(CombinerKind::Or);
        or.add_operand(year_eq(1985));
        or.add_operand(year_eq(1984));
        assert_eq!(fx.query(&data_fetch(None), &or).row_count(), 1);

        let mut not = Condition::combiner(CombinerKind::Not);
        not.add_operand(year_eq(1985));
        assert_eq!(fx.query(&data_fetch(None), &not).row_count(), 1);
    }

    #[test]
    fn test_custom_combiner() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "year", &Value::int(10), "src");

        // Exactly-one-of.
        let mut xor = Condition::custom_combiner(|check, ops| {
            ops.iter().filter(|op| check(op)).count() == 1
        });
        for y in [10, 11] {
            xor.add_operand(Arc::new(Condition::filter(
                FilterKind::Equal,
                Some("year"),
                Some(&Value::int(y)),
                None,
                CmpMode::Casefold,
                CondFlags::empty(),
            )));
        }
        assert_eq!(fx.query(&data_fetch(None), &xor).row_count(), 1);
    }

    #[test]
    fn test_source_preference_gates_filter() {
        let fx = setup(&[]);
        let sp = Arc::new(sonata_core::SourcePref::new(&["server", "plugin/*"]));
        fx.add("artist", &Value::string("X"), "title", &Value::string("Hello"), "plugin/id3");
        fx.add("artist", &Value::string("X"), "title", &Value::string("HELLO"), "server");

        // Only the server value is consulted: binary equality with the
        // plugin spelling fails.
        let lower = Condition::filter(
            FilterKind::Equal,
            Some("title"),
            Some(&Value::string("Hello")),
            Some(Arc::clone(&sp)),
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(Some("title")), &lower).row_count(), 0);

        let upper = Condition::filter(
            FilterKind::Equal,
            Some("title"),
            Some(&Value::string("HELLO")),
            Some(Arc::clone(&sp)),
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(Some("title")), &upper).row_count(), 1);
    }

    #[test]
    fn test_equal_best_priority_uses_and_semantics() {
        // Two tuples from the same best source: every one must satisfy the
        // filter for the group to match.
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "genre", &Value::string("jazz"), "server");
        fx.add("artist", &Value::string("X"), "genre", &Value::string("bop"), "server");

        let eq_jazz = Condition::filter(
            FilterKind::Equal,
            Some("genre"),
            Some(&Value::string("jazz")),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(None), &eq_jazz).row_count(), 0);

        // A Match that accepts both spellings does match.
        let star = Condition::filter(
            FilterKind::Match,
            Some("genre"),
            Some(&Value::string("*")),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(None), &star).row_count(), 1);
    }

    #[test]
    fn test_unmatched_sources_are_invisible() {
        let fx = setup(&[]);
        let sp = Arc::new(sonata_core::SourcePref::new(&["server"]));
        fx.add("artist", &Value::string("X"), "title", &Value::string("t"), "random");

        let cond = Condition::filter(
            FilterKind::Exists,
            Some("title"),
            None,
            Some(Arc::clone(&sp)),
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(Some("title")), &cond).row_count(), 0);

        // Projection hides them as well.
        let all = Condition::filter(
            FilterKind::Exists,
            None,
            None,
            None,
            CmpMode::Casefold,
            CondFlags::PARENT,
        );
        let mut fs = FetchSpec::new();
        fs.add(Some("title"), Some(sp), FetchFlags::DATA);
        let set = fx.query(&fs, &all);
        assert_eq!(set.row_count(), 1);
        assert!(set.result(0, 0).is_none());
    }

    #[test]
    fn test_scan_plan_classification() {
        let fx = setup(&["year"]);
        fx.add("artist", &Value::string("X"), "year", &Value::int(2000), "src");

        let parent = parent_eq("artist", &Value::string("X"));
        assert_eq!(classify(&parent, &fx.store), ScanPlan::IndexA("artist".into()));

        let by_year = Condition::filter(
            FilterKind::GreaterEq,
            Some("year"),
            Some(&Value::int(1990)),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        assert_eq!(classify(&by_year, &fx.store), ScanPlan::IndexB("year".into()));

        let by_title = Condition::filter(
            FilterKind::Equal,
            Some("title"),
            Some(&Value::string("x")),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        );
        assert_eq!(classify(&by_title, &fx.store), ScanPlan::FullScan);

        let combiner = Condition::combiner(CombinerKind::And);
        assert_eq!(classify(&combiner, &fx.store), ScanPlan::FullScan);
    }

    #[test]
    fn test_empty_entries_never_match() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "album", &Value::string("A"), "src");
        // Delete the only tuple; the entry stays in the a-index but is
        // empty.
        let txn = fx.registry.new_txn();
        fx.store
            .del(
                txn,
                &fx.pool.intern_str("artist"),
                &fx.pool.intern_str_value("X"),
                &fx.pool.intern_str("album"),
                &fx.pool.intern_str_value("A"),
                &fx.pool.intern_str("src"),
            )
            .unwrap();
        fx.registry.release_all(txn);

        let all = Condition::filter(
            FilterKind::Exists,
            None,
            None,
            None,
            CmpMode::Binary,
            CondFlags::empty(),
        );
        assert_eq!(fx.query(&data_fetch(None), &all).row_count(), 0);
    }

    #[test]
    fn test_fetch_parent_and_data() {
        let fx = setup(&[]);
        fx.add("artist", &Value::string("X"), "album", &Value::string("A"), "src");

        let mut fs = FetchSpec::new();
        fs.add(None, None, FetchFlags::PARENT | FetchFlags::DATA);
        let set = fx.query(&fs, &parent_eq("artist", &Value::string("X")));

        let cell = set.result(0, 0).unwrap();
        let entries: Vec<_> = cell.iter().map(|n| (n.key().to_string(), n.src().is_none())).collect();
        // Data tuples are prepended after the parent, so the parent pair
        // sits at the tail of the list.
        assert_eq!(entries.last().unwrap(), &("artist".to_string(), true));
        assert!(entries.iter().any(|(k, parent)| k == "album" && !parent));
    }
}
