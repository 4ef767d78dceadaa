mod common;

use sdig_sql::{IdSet, Session, Statement};
use tempfile::TempDir;

fn ids(values: &[i64]) -> IdSet {
    values.iter().copied().collect()
}

fn select_all(db: &Session, table: &str) -> Vec<i64> {
    common::collect_i64(db, &format!("SELECT id FROM {table}"))
}

#[test]
fn attach_creates_queryable_table() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[10, 20]);
    set.attach(&db).unwrap();
    assert!(set.is_attached_to(&db));
    assert_eq!(select_all(&db, &set.sql_name()), [10, 20]);

    set.detach().unwrap();
    assert!(!set.is_attached());
    assert!(db.exec(&format!("SELECT id FROM {}", set.sql_name()), &[]).is_err());
    // detaching again is a no-op
    set.detach().unwrap();
}

#[test]
fn attach_is_idempotent_and_reattach_moves() {
    let db1 = Session::open_in_memory().unwrap();
    let db2 = Session::open_in_memory().unwrap();
    let mut set = ids(&[1]);

    set.attach(&db1).unwrap();
    set.attach(&db1).unwrap(); // no-op
    assert!(set.is_attached_to(&db1));
    assert_eq!(select_all(&db1, &set.sql_name()), [1]);

    set.attach(&db2).unwrap();
    assert!(set.is_attached_to(&db2));
    assert!(!set.is_attached_to(&db1));
    assert!(db1.exec(&format!("SELECT id FROM {}", set.sql_name()), &[]).is_err());
    assert_eq!(select_all(&db2, &set.sql_name()), [1]);
}

#[test]
fn attach_to_closed_session_defers_table_creation() {
    let db = Session::new();
    let mut set = ids(&[5]);
    set.attach(&db).unwrap();
    assert!(set.is_attached_to(&db));
}

#[test]
fn s4_intermixed_insert_served_in_order() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[2, 4, 6, 8]);
    set.attach(&db).unwrap();

    assert_eq!(set.insert_iter([0, 1, 3, 5, 7, 9, 10]), 7);
    assert_eq!(set.as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
    assert_eq!(
        select_all(&db, &set.sql_name()),
        [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
    );
    assert_eq!(
        common::collect_i64(&db, &format!("SELECT id FROM {} ORDER BY id", set.sql_name())),
        [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10]
    );
}

#[test]
fn where_constraints_are_honoured() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[0, 1, 2, 3, 4, 5, 6, 7]);
    set.attach(&db).unwrap();
    let name = set.sql_name();

    assert_eq!(common::collect_i64(&db, &format!("SELECT id FROM {name} WHERE id = 5")), [5]);
    assert_eq!(
        common::collect_i64(&db, &format!("SELECT id FROM {name} WHERE id > 3 AND id <= 6")),
        [4, 5, 6]
    );
    assert_eq!(
        common::collect_i64(&db, &format!("SELECT id FROM {name} WHERE id < 2")),
        [0, 1]
    );
    assert_eq!(
        common::collect_i64(&db, &format!("SELECT id FROM {name} ORDER BY id DESC")),
        [7, 6, 5, 4, 3, 2, 1, 0]
    );
    assert_eq!(
        common::collect_i64(&db, &format!("SELECT rowid FROM {name} WHERE rowid >= 6")),
        [6, 7]
    );
}

#[test]
fn s5_insert_null_id() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[1, 2]);
    set.attach(&db).unwrap();
    let name = set.sql_name();

    let err = db
        .exec(&format!("INSERT INTO {name} (id) VALUES (NULL)"), &[])
        .unwrap_err();
    assert!(err.to_string().to_lowercase().contains("null"), "got: {err}");
    assert_eq!(set.as_slice(), &[1, 2]);

    db.exec(&format!("INSERT OR IGNORE INTO {name} (id) VALUES (NULL)"), &[])
        .unwrap();
    assert_eq!(set.as_slice(), &[1, 2]);
}

#[test]
fn sql_insert_updates_the_container() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[1]);
    set.attach(&db).unwrap();
    let name = set.sql_name();

    db.exec(&format!("INSERT INTO {name} (id) VALUES (42)"), &[]).unwrap();
    assert!(set.contains(42));
    assert_eq!(db.last_insert_rowid(), 42);

    // duplicate inserts follow the statement's conflict action
    let err = db
        .exec(&format!("INSERT INTO {name} (id) VALUES (42)"), &[])
        .unwrap_err();
    assert!(err.to_string().contains("not unique"), "got: {err}");

    db.exec(&format!("INSERT OR IGNORE INTO {name} (id) VALUES (42)"), &[])
        .unwrap();
    db.exec(&format!("INSERT OR REPLACE INTO {name} (id) VALUES (42)"), &[])
        .unwrap();
    assert_eq!(set.as_slice(), &[1, 42]);
}

#[test]
fn sql_update_and_delete() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[1, 2, 3, 4]);
    set.attach(&db).unwrap();
    let name = set.sql_name();

    db.exec(&format!("UPDATE {name} SET id = 99 WHERE id = 4"), &[]).unwrap();
    assert_eq!(set.as_slice(), &[1, 2, 3, 99]);

    // no-op update
    db.exec(&format!("UPDATE {name} SET id = 2 WHERE id = 2"), &[]).unwrap();
    assert_eq!(set.as_slice(), &[1, 2, 3, 99]);

    // collision with an existing id
    let err = db
        .exec(&format!("UPDATE {name} SET id = 3 WHERE id = 2"), &[])
        .unwrap_err();
    assert!(err.to_string().contains("not unique"), "got: {err}");
    assert_eq!(set.as_slice(), &[1, 2, 3, 99]);

    db.exec(&format!("UPDATE OR IGNORE {name} SET id = 3 WHERE id = 2"), &[])
        .unwrap();
    assert_eq!(set.as_slice(), &[1, 2, 3, 99]);

    db.exec(&format!("UPDATE OR REPLACE {name} SET id = 3 WHERE id = 2"), &[])
        .unwrap();
    assert_eq!(set.as_slice(), &[1, 3, 99]);

    db.exec(&format!("DELETE FROM {name} WHERE id < 50"), &[]).unwrap();
    assert_eq!(set.as_slice(), &[99]);
}

#[test]
fn s6_cursor_survives_concurrent_erase() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[1, 2, 3, 4, 5]);
    set.attach(&db).unwrap();

    let stmt = Statement::prepare(&db, &format!("SELECT id FROM {}", set.sql_name())).unwrap();
    let mut row = stmt.begin().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 1);
    row.step().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 2);

    set.erase(3);

    row.step().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 4);
    row.step().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 5);
    assert!(!row.step().unwrap());
}

#[test]
fn cursor_does_not_repeat_after_insert_behind() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[10, 20, 30]);
    set.attach(&db).unwrap();

    let stmt = Statement::prepare(&db, &format!("SELECT id FROM {}", set.sql_name())).unwrap();
    let mut row = stmt.begin().unwrap();
    row.step().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 20);

    set.insert(5);
    set.insert(15);

    row.step().unwrap();
    assert_eq!(row.get::<i64>(0).unwrap(), 30);
    assert!(!row.step().unwrap());
}

#[test]
fn rename_is_rejected() {
    let db = Session::open_in_memory().unwrap();
    let mut set = ids(&[1]);
    set.attach(&db).unwrap();
    assert!(db
        .exec(&format!("ALTER TABLE temp.{} RENAME TO somewhere_else", set.sql_name()), &[])
        .is_err());
}

#[test]
fn swap_keeps_names_and_exchanges_contents() {
    let db = Session::open_in_memory().unwrap();
    let mut a = ids(&[1, 2]);
    let mut b = ids(&[30]);
    a.attach(&db).unwrap();
    b.attach(&db).unwrap();

    let name_a = a.sql_name();
    let name_b = b.sql_name();
    let stmt = Statement::prepare(&db, &format!("SELECT id FROM {name_a}")).unwrap();

    a.swap(&mut b).unwrap();

    assert_eq!(a.sql_name(), name_a);
    assert_eq!(b.sql_name(), name_b);
    assert_eq!(a.as_slice(), &[30]);
    assert_eq!(b.as_slice(), &[1, 2]);

    // both on one session: the previously prepared statement stays valid
    // and now serves the swapped contents behind the same name
    let mut row = stmt.begin().unwrap();
    let mut seen = Vec::new();
    while !row.is_empty() {
        seen.push(row.get::<i64>(0).unwrap());
        row.step().unwrap();
    }
    assert_eq!(seen, [30]);
}

#[test]
fn swap_across_sessions_moves_attachments() {
    let db1 = Session::open_in_memory().unwrap();
    let db2 = Session::open_in_memory().unwrap();
    let mut a = ids(&[1]);
    let mut b = ids(&[2]);
    a.attach(&db1).unwrap();
    b.attach(&db2).unwrap();

    a.swap(&mut b).unwrap();

    assert!(a.is_attached_to(&db2));
    assert!(b.is_attached_to(&db1));
    assert_eq!(select_all(&db2, &a.sql_name()), [2]);
    assert_eq!(select_all(&db1, &b.sql_name()), [1]);
}

#[test]
fn statement_and_sql_bulk_operations() {
    let dir = TempDir::new().unwrap();
    let db = common::open_sample(&dir);
    let mut set = IdSet::attached(&db).unwrap();

    let added = set
        .insert_sql("SELECT number FROM employees WHERE office_code = ?1", &[&1_i64])
        .unwrap();
    assert_eq!(added, 4);
    assert_eq!(set.as_slice(), &[1002, 1056, 1143, 1165]);

    let removed = set
        .erase_sql("SELECT number FROM employees WHERE job_title = ?1", &[&"Sales Rep"])
        .unwrap();
    assert_eq!(removed, 1); // only 1165 is in the set
    assert_eq!(set.as_slice(), &[1002, 1056, 1143]);

    // intersect against a sorted result
    let stmt = Statement::prepare(
        &db,
        "SELECT number FROM employees WHERE number > 1050 ORDER BY number",
    )
    .unwrap();
    let removed = set.intersect_stmt(&stmt, 0).unwrap();
    assert_eq!(removed, 1); // 1002 drops out
    assert_eq!(set.as_slice(), &[1056, 1143]);

    set.symmetric_difference_sql(
        "SELECT number FROM employees WHERE office_code = ?1 ORDER BY number",
        &[&1_i64],
    )
    .unwrap();
    // {1056,1143} xor {1002,1056,1143,1165} = {1002,1165}
    assert_eq!(set.as_slice(), &[1002, 1165]);
}

#[test]
fn detached_sql_operations_are_rejected() {
    let mut set = ids(&[1]);
    let err = set.insert_sql("SELECT 1", &[]).unwrap_err();
    assert!(err.to_string().contains("not attached"));
}

#[test]
fn dropping_an_attached_set_removes_its_table() {
    let db = Session::open_in_memory().unwrap();
    let name;
    {
        let mut set = ids(&[1]);
        set.attach(&db).unwrap();
        name = set.sql_name();
        assert_eq!(select_all(&db, &name), [1]);
    }
    assert!(db.exec(&format!("SELECT id FROM {name}"), &[]).is_err());
}
