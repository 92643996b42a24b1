//! Transaction lifecycle: failure latching, rollback, read-only
//! enforcement, and deadlock victim selection.

use sonata_core::{errno, CmpMode, ErrorKind, Value};
use sonata_engine::{
    CondFlags, Condition, Database, FetchFlags, FetchSpec, FilterKind, OpenFlags, TransFlags,
};
use std::thread;
use std::time::Duration;

fn open_mem() -> Database {
    Database::open("unused", &[], OpenFlags::MEMORY).unwrap()
}

fn entry_exists(db: &Database, key: &str, val: &Value) -> bool {
    let mut t = db.begin(TransFlags::READ_ONLY);
    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    let cond = Condition::filter(
        FilterKind::Equal,
        Some(key),
        Some(val),
        None,
        CmpMode::Casefold,
        CondFlags::PARENT,
    );
    let set = t.query(&fs, &cond);
    t.commit().unwrap();
    set.row_count() > 0
}

#[test]
fn failed_del_rolls_back_the_whole_transaction() {
    let db = open_mem();

    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("a", &Value::string("1"), "b", &Value::string("2"), "s"));
    assert!(!t.del("x", &Value::string("y"), "z", &Value::string("w"), "s"));
    assert!(t.is_failed());
    assert_eq!(t.error(), Some(ErrorKind::Execute));

    let err = t.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Execute);
    assert_eq!(errno(), Some(ErrorKind::Execute));

    // The earlier add was undone.
    assert!(!entry_exists(&db, "a", &Value::string("1")));
}

#[test]
fn operations_after_failure_are_noops() {
    let db = open_mem();

    let mut t = db.begin(TransFlags::empty());
    assert!(!t.del("no", &Value::int(0), "such", &Value::int(0), "tuple"));
    // This add would succeed on its own, but the transaction is latched.
    assert!(!t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    assert!(t.commit().is_err());

    assert!(!entry_exists(&db, "a", &Value::int(1)));
}

#[test]
fn abort_undoes_everything() {
    let db = open_mem();

    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    t.abort();
    assert!(!entry_exists(&db, "a", &Value::int(1)));

    // The same mutation now commits cleanly.
    let mut t = db.begin(TransFlags::empty());
    assert!(t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    t.commit().unwrap();
    assert!(entry_exists(&db, "a", &Value::int(1)));
}

#[test]
fn dropped_transaction_aborts() {
    let db = open_mem();
    {
        let mut t = db.begin(TransFlags::empty());
        assert!(t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
        // Dropped without commit.
    }
    assert!(!entry_exists(&db, "a", &Value::int(1)));
}

#[test]
fn read_only_transactions_reject_writes() {
    let db = open_mem();

    let mut t = db.begin(TransFlags::READ_ONLY);
    assert!(!t.add("a", &Value::int(1), "b", &Value::int(2), "s"));
    assert_eq!(t.error(), Some(ErrorKind::ReadOnly));
    let err = t.commit().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ReadOnly);

    assert!(!entry_exists(&db, "a", &Value::int(1)));
}

#[test]
fn query_clears_restartable() {
    let db = open_mem();
    let mut t = db.begin(TransFlags::empty());
    assert!(t.is_restartable());

    let fs = FetchSpec::new();
    let cond = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let _ = t.query(&fs, &cond);
    assert!(!t.is_restartable());
    t.commit().unwrap();
}

#[test]
fn opposed_lock_orders_pick_one_deadlock_victim() {
    let db = open_mem();
    let one = Value::int(1);
    let two = Value::int(2);

    let outcomes = thread::scope(|scope| {
        let first = scope.spawn(|| {
            let mut t = db.begin(TransFlags::empty());
            let ok_a = t.add("a", &one, "b", &two, "src");
            thread::sleep(Duration::from_millis(200));
            let ok_b = t.add("b", &two, "a", &one, "src");
            (ok_a && ok_b, t.commit().is_ok(), errno())
        });
        let second = scope.spawn(|| {
            thread::sleep(Duration::from_millis(100));
            let mut t = db.begin(TransFlags::empty());
            let ok_a = t.add("b", &two, "a", &one, "src");
            thread::sleep(Duration::from_millis(200));
            let ok_b = t.add("a", &one, "b", &two, "src");
            (ok_a && ok_b, t.commit().is_ok(), errno())
        });
        (first.join().unwrap(), second.join().unwrap())
    });

    let (first, second) = outcomes;
    // Exactly one commits; the other is the victim and reports Deadlock.
    assert!(first.1 ^ second.1, "exactly one transaction must commit");
    let loser = if first.1 { &second } else { &first };
    assert!(!loser.0, "the victim's second add must fail");
    assert_eq!(loser.2, Some(ErrorKind::Deadlock));
}

#[test]
fn concurrent_writers_make_progress_with_retries() {
    let db = open_mem();

    // Writers inserting under one key contend on the a-index; a loser of
    // that race aborts with Deadlock and is expected to simply re-run.
    thread::scope(|scope| {
        for worker in 0..8 {
            let db = &db;
            scope.spawn(move || {
                for i in 0..50 {
                    let mut attempts = 0;
                    loop {
                        let mut t = db.begin(TransFlags::empty());
                        let ok = t.add(
                            "track",
                            &Value::int(worker * 100 + i),
                            "plays",
                            &Value::int(i),
                            "scrobbler",
                        );
                        if ok && t.commit().is_ok() {
                            break;
                        }
                        attempts += 1;
                        assert!(attempts < 1000, "writer starved");
                    }
                }
            });
        }
    });

    let mut t = db.begin(TransFlags::READ_ONLY);
    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    let cond = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let set = t.query(&fs, &cond);
    t.commit().unwrap();
    assert_eq!(set.row_count(), 8 * 50);
    db.verify().unwrap();
}

#[test]
fn failed_transaction_queries_return_empty() {
    let db = open_mem();
    let mut t = db.begin(TransFlags::empty());
    assert!(!t.del("a", &Value::int(1), "b", &Value::int(2), "s"));

    let mut fs = FetchSpec::new();
    fs.add(None, None, FetchFlags::PARENT);
    let cond = Condition::filter(
        FilterKind::Exists,
        None,
        None,
        None,
        CmpMode::Binary,
        CondFlags::empty(),
    );
    let set = t.query(&fs, &cond);
    assert_eq!(set.row_count(), 0);
    assert_eq!(set.col_count(), 0);
    assert!(t.commit().is_err());
}
