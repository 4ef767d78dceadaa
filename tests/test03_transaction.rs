mod common;

use sdig_sql::{Session, SqlError, Transaction};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use tempfile::TempDir;

#[test]
fn default_transaction_is_inert() {
    let txn = Transaction::new();
    assert!(!txn.active());
    assert!(!txn.nested());
    assert!(!txn.committed());
    assert!(!txn.rolled_back());
}

#[test]
fn begin_commits_on_normal_return() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE foo (id INTEGER PRIMARY KEY)");

    let txn = db
        .begin_transaction(|txn| {
            assert!(txn.active());
            assert!(!txn.nested());
            assert!(!txn.committed());
            assert!(!txn.rolled_back());
            db.exec("INSERT INTO foo (id) VALUES (1)", &[])?;
            Ok(())
        })
        .unwrap();

    assert!(txn.committed());
    assert!(!txn.rolled_back());
    assert!(!txn.active());
    assert_eq!(common::collect_i64(&db, "SELECT id FROM foo"), [1]);
}

#[test]
fn nested_commit_defers_to_outermost() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE foo (id INTEGER PRIMARY KEY)");

    db.begin_transaction(|outer| {
        db.exec("INSERT INTO foo (id) VALUES (1)", &[])?;
        let inner = db.begin_transaction(|inner| {
            assert!(inner.nested());
            db.exec("INSERT INTO foo (id) VALUES (2)", &[])?;
            Ok(())
        })?;
        assert!(inner.committed());
        assert!(!outer.committed());
        Ok(())
    })
    .unwrap();

    assert_eq!(common::collect_i64(&db, "SELECT id FROM foo ORDER BY id"), [1, 2]);
}

#[test]
fn explicit_rollback_discards_work() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE foo (id INTEGER PRIMARY KEY)");

    let txn = db
        .begin_transaction(|txn| {
            db.exec("INSERT INTO foo (id) VALUES (1)", &[])?;
            txn.rollback()?;
            Ok(())
        })
        .unwrap();

    assert!(txn.rolled_back());
    assert!(!txn.committed());
    assert!(common::collect_i64(&db, "SELECT id FROM foo").is_empty());
}

#[test]
fn nested_rollback_unwinds_every_frame() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE foo (id INTEGER PRIMARY KEY)");

    let result = db.begin_transaction(|outer| {
        db.exec("INSERT INTO foo (id) VALUES (1)", &[])?;
        db.begin_transaction(|inner| {
            db.exec("INSERT INTO foo (id) VALUES (2)", &[])?;
            inner.rollback()?;
            Ok(())
        })?;
        // the whole transaction is gone, including this frame
        assert!(!outer.active());
        assert!(outer.rolled_back());
        Ok(())
    });

    assert!(result.is_ok());
    assert!(common::collect_i64(&db, "SELECT id FROM foo").is_empty());
}

#[test]
fn s3_rollback_hooks_run_lifo() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE foo (id INTEGER)");

    let order = Arc::new(Mutex::new(Vec::new()));
    let committed = Arc::new(AtomicUsize::new(0));

    let txn = db
        .begin_transaction(|txn| {
            for hook in 1..=3 {
                let order = Arc::clone(&order);
                db.on_rollback(move || order.lock().unwrap().push(hook));
            }
            let committed = Arc::clone(&committed);
            db.on_final_commit(move || {
                committed.fetch_add(1, Ordering::SeqCst);
            });
            txn.rollback()?;
            Ok(())
        })
        .unwrap();

    assert!(txn.rolled_back());
    assert_eq!(*order.lock().unwrap(), [3, 2, 1]);
    assert_eq!(committed.load(Ordering::SeqCst), 0);
}

#[test]
fn commit_hooks_run_fifo_and_rollback_hooks_are_dropped() {
    let db = Session::open_in_memory().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let rolled = Arc::new(AtomicUsize::new(0));

    db.begin_transaction(|_| {
        for hook in 1..=3 {
            let order = Arc::clone(&order);
            db.on_final_commit(move || order.lock().unwrap().push(hook));
        }
        let rolled = Arc::clone(&rolled);
        db.on_rollback(move || {
            rolled.fetch_add(1, Ordering::SeqCst);
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), [1, 2, 3]);
    assert_eq!(rolled.load(Ordering::SeqCst), 0);
}

#[test]
fn hooks_registered_in_nested_frames_wait_for_outermost() {
    let db = Session::open_in_memory().unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    db.begin_transaction(|_| {
        let outer_order = Arc::clone(&order);
        db.on_final_commit(move || outer_order.lock().unwrap().push("outer"));

        db.begin_transaction(|_| {
            let inner_order = Arc::clone(&order);
            db.on_final_commit(move || inner_order.lock().unwrap().push("inner"));
            Ok(())
        })?;

        // the inner frame committed but the queue has not drained yet
        assert!(order.lock().unwrap().is_empty());
        Ok(())
    })
    .unwrap();

    assert_eq!(*order.lock().unwrap(), ["outer", "inner"]);
}

#[test]
fn s2_cross_session_busy_retry() {
    let dir = TempDir::new().unwrap();
    let db = common::open_sample(&dir);
    let uri = common::db_uri(&dir);

    let (started_tx, started_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    // reader: holds a read lock open mid-iteration until released
    let reader = thread::spawn(move || {
        let db2 = Session::open(&uri).unwrap();
        let stmt = db2.exec("SELECT * FROM employees", &[]).unwrap();
        assert!(stmt.is_active());
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
        drop(stmt);
    });

    started_rx.recv().unwrap();

    let mut retry_count = -1;
    let mut reader = Some(reader);
    db.begin_transaction(|_| {
        retry_count += 1;
        if retry_count > 0 {
            // let the reader finish so this attempt can commit
            if let Some(handle) = reader.take() {
                release_tx.send(()).unwrap();
                handle.join().unwrap();
            }
        }
        db.exec(
            "INSERT INTO employees (number, surname, forename, extension, email, \
                                    office_code, reports_to, job_title) \
             VALUES (9999, 'Smith', 'Jane', 'x4321', 'jsmith@classicmodelcars.com', \
                     7, 1102, 'Payroll')",
            &[],
        )?;
        Ok(())
    })
    .unwrap();

    assert_eq!(retry_count, 1);
    assert_eq!(
        common::collect_i64(&db, "SELECT count(*) FROM employees WHERE number = 9999"),
        [1]
    );
}

#[test]
fn busy_from_nested_frame_escalates_to_the_outermost() {
    let db = Session::open_in_memory().unwrap();
    common::exec_batch(&db, "CREATE TABLE t (attempt INTEGER)");

    let mut outer_runs = 0;
    let mut inner_runs = 0;

    db.begin_transaction(|_| {
        outer_runs += 1;
        db.exec("INSERT INTO t (attempt) VALUES (?1)", &[&outer_runs])?;

        if outer_runs == 1 {
            let nested = db.begin_transaction(|_| {
                inner_runs += 1;
                Err(SqlError::Busy)
            });
            // a nested frame never retries; Busy propagates unchanged
            assert!(matches!(&nested, Err(SqlError::Busy)));
            return nested.map(|_| ());
        }
        Ok(())
    })
    .unwrap();

    assert_eq!(outer_runs, 2);
    assert_eq!(inner_runs, 1);
    // only the second attempt's insert survived
    assert_eq!(common::collect_i64(&db, "SELECT attempt FROM t"), [2]);
}
