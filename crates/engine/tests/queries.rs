//! End-to-end query scenarios against a memory database.

use sonata_core::{CmpMode, SourcePref, Value};
use sonata_engine::{
    CombinerKind, CondFlags, Condition, Database, Direction, FetchFlags, FetchSpec, FilterKind,
    OpenFlags, Order, ResultSet, TransFlags,
};
use std::sync::Arc;

fn open_mem(indices: &[&str]) -> Database {
    Database::open("unused", indices, OpenFlags::MEMORY).unwrap()
}

fn add(db: &Database, ka: &str, va: &Value, kb: &str, vb: &Value, src: &str) {
    let mut t = db.begin(TransFlags::empty());
    assert!(t.add(ka, va, kb, vb, src));
    t.commit().unwrap();
}

fn parent_filter(kind: FilterKind, key: &str, value: &Value, mode: CmpMode) -> Condition {
    Condition::filter(kind, Some(key), Some(value), None, mode, CondFlags::PARENT)
}

fn query(db: &Database, fs: &FetchSpec, cond: &Condition) -> ResultSet {
    let mut t = db.begin(TransFlags::READ_ONLY);
    let set = t.query(fs, cond);
    t.commit().unwrap();
    set
}

/// Keys of the matched entries, for set comparisons.
fn matched_parents(db: &Database, cond: &Condition) -> Vec<String> {
    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    let set = query(db, &fs, cond);
    let mut names: Vec<String> = set
        .iter()
        .map(|row| row.col(0).unwrap().value().to_string())
        .collect();
    names.sort();
    names
}

#[test]
fn add_query_del_round_trip() {
    let db = open_mem(&[]);
    add(
        &db,
        "artist",
        &Value::string("Miles"),
        "album",
        &Value::string("Kind of Blue"),
        "id3",
    );

    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::DATA);
    let cond = parent_filter(
        FilterKind::Equal,
        "artist",
        &Value::string("Miles"),
        CmpMode::Casefold,
    );

    let set = query(&db, &fs, &cond);
    assert_eq!(set.row_count(), 1);
    assert_eq!(set.col_count(), 1);
    let cell = set.result(0, 0).unwrap();
    assert_eq!(cell.key(), "album");
    assert_eq!(cell.value().as_str(), Some("Kind of Blue"));
    assert_eq!(cell.src(), Some("id3"));
    assert!(cell.next().is_none());

    let mut t = db.begin(TransFlags::empty());
    assert!(t.del(
        "artist",
        &Value::string("Miles"),
        "album",
        &Value::string("Kind of Blue"),
        "id3",
    ));
    t.commit().unwrap();

    assert_eq!(query(&db, &fs, &cond).row_count(), 0);
}

#[test]
fn source_preference_picks_the_better_source() {
    let db = open_mem(&[]);
    add(&db, "artist", &Value::string("X"), "title", &Value::string("Hello"), "plugin/id3");
    add(&db, "artist", &Value::string("X"), "title", &Value::string("HELLO"), "server");

    let sp = Arc::new(SourcePref::new(&["server", "plugin/*"]));
    let mut fs = FetchSpec::new();
    fs.add(Some("title"), Some(sp), FetchFlags::DATA);

    let cond = parent_filter(
        FilterKind::Equal,
        "artist",
        &Value::string("X"),
        CmpMode::Casefold,
    );
    let set = query(&db, &fs, &cond);

    assert_eq!(set.row_count(), 1);
    let cell = set.result(0, 0).unwrap();
    assert_eq!(cell.value().as_str(), Some("HELLO"));
    assert_eq!(cell.src(), Some("server"));
    assert!(cell.next().is_none(), "only the preferred source is emitted");
}

#[test]
fn caseless_match_is_mode_dependent() {
    let db = open_mem(&[]);
    add(&db, "artist", &Value::string("Beatles"), "album", &Value::string("Revolver"), "id3");

    let caseless = parent_filter(
        FilterKind::Match,
        "artist",
        &Value::string("BEAT*"),
        CmpMode::Casefold,
    );
    assert_eq!(matched_parents(&db, &caseless), vec!["Beatles"]);

    let binary = parent_filter(
        FilterKind::Match,
        "artist",
        &Value::string("BEAT*"),
        CmpMode::Binary,
    );
    assert!(matched_parents(&db, &binary).is_empty());
}

#[test]
fn indexed_range_scan_returns_exact_set() {
    let db = open_mem(&["year"]);
    for i in 0..1000 {
        let year = 1960 + (i % 66);
        add(
            &db,
            "song",
            &Value::string(&format!("track-{i}")),
            "year",
            &Value::int(year),
            "src",
        );
    }

    let cond = Condition::filter(
        FilterKind::GreaterEq,
        Some("year"),
        Some(&Value::int(2000)),
        None,
        CmpMode::Casefold,
        CondFlags::empty(),
    );
    let hits = matched_parents(&db, &cond);

    let expected = (0..1000)
        .filter(|i| 1960 + (i % 66) >= 2000)
        .count();
    assert_eq!(hits.len(), expected);
}

#[test]
fn and_combiner_is_set_intersection() {
    let db = open_mem(&[]);
    for (artist, genre, year) in [
        ("A", "jazz", 1959),
        ("B", "jazz", 1985),
        ("C", "rock", 1985),
        ("D", "rock", 2001),
    ] {
        add(&db, "artist", &Value::string(artist), "genre", &Value::string(genre), "s");
        add(&db, "artist", &Value::string(artist), "year", &Value::int(year), "s");
    }

    let jazz = || {
        Arc::new(Condition::filter(
            FilterKind::Equal,
            Some("genre"),
            Some(&Value::string("jazz")),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        ))
    };
    let eighties = || {
        Arc::new(Condition::filter(
            FilterKind::Equal,
            Some("year"),
            Some(&Value::int(1985)),
            None,
            CmpMode::Casefold,
            CondFlags::empty(),
        ))
    };

    let mut and = Condition::combiner(CombinerKind::And);
    and.add_operand(jazz());
    and.add_operand(eighties());

    let lhs = matched_parents(&db, &and);

    let a = matched_parents(&db, &jazz());
    let b = matched_parents(&db, &eighties());
    let expected: Vec<String> = a.into_iter().filter(|x| b.contains(x)).collect();

    assert_eq!(lhs, expected);
    assert_eq!(lhs, vec!["B"]);
}

#[test]
fn transaction_sees_its_own_writes() {
    let db = open_mem(&[]);
    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("artist", &Value::string("X"), "album", &Value::string("A"), "s"));

    let mut fs = FetchSpec::new();
    fs.add(Some("album"), None, FetchFlags::DATA);
    let cond = parent_filter(
        FilterKind::Equal,
        "artist",
        &Value::string("X"),
        CmpMode::Casefold,
    );
    let set = t.query(&fs, &cond);
    assert_eq!(set.row_count(), 1);
    t.commit().unwrap();
}

#[test]
fn committed_add_then_del_restores_prior_state() {
    let db = open_mem(&[]);
    add(&db, "artist", &Value::string("X"), "album", &Value::string("A"), "s");

    let everything = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let before = matched_parents(&db, &everything);

    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("artist", &Value::string("Y"), "album", &Value::string("B"), "s"));
    assert!(t.del("artist", &Value::string("Y"), "album", &Value::string("B"), "s"));
    t.commit().unwrap();

    assert_eq!(matched_parents(&db, &everything), before);
}

#[test]
fn repeated_add_leaves_one_tuple() {
    let db = open_mem(&[]);
    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    assert!(t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    t.commit().unwrap();

    let mut fs = FetchSpec::new();
    fs.add(Some("b"), None, FetchFlags::DATA);
    let cond = parent_filter(FilterKind::Equal, "a", &Value::int(1), CmpMode::Casefold);
    let set = query(&db, &fs, &cond);
    assert_eq!(set.row_count(), 1);
    let cell = set.result(0, 0).unwrap();
    assert_eq!(cell.iter().count(), 1);
}

#[test]
fn sort_by_year_with_collation() {
    let db = open_mem(&[]);
    for (artist, year) in [("A", 2001), ("B", 1959), ("C", 1985)] {
        add(&db, "artist", &Value::string(artist), "year", &Value::int(year), "s");
    }

    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    fs.add(Some("year"), None, FetchFlags::DATA);
    let everything = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let mut set = query(&db, &fs, &everything);

    let mut order = Order::new();
    order.add_columns(vec![1], Direction::Descending, CmpMode::Casefold);
    set.sort(&order);

    let years: Vec<i32> = set
        .iter()
        .map(|r| r.col(1).unwrap().value().as_int().unwrap())
        .collect();
    assert_eq!(years, vec![2001, 1985, 1959]);
}

#[test]
fn shuffle_keeps_every_row() {
    let db = open_mem(&[]);
    for i in 0..32 {
        add(&db, "n", &Value::int(i), "v", &Value::int(i), "s");
    }
    let everything = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    let mut set = query(&db, &fs, &everything);
    set.shuffle();

    let mut vals: Vec<i32> = set
        .iter()
        .map(|r| r.col(0).unwrap().value().as_int().unwrap())
        .collect();
    vals.sort();
    assert_eq!(vals, (0..32).collect::<Vec<_>>());
}
