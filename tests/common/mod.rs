//! Shared sample-company fixture for the integration tests.

#![allow(dead_code)]

use sdig_sql::{Session, Statement};
use tempfile::TempDir;

pub const LONDON_PHONE: &str = "+44 20 7877 2041";

/// URI of the fixture database inside `dir`.
pub fn db_uri(dir: &TempDir) -> String {
    format!("sqlite3:{}", dir.path().join("sample.db").display())
}

/// Execute a batch of semicolon-separated statements one by one.
pub fn exec_batch(db: &Session, sql: &str) {
    let mut rest = sql.trim_start();
    while !rest.is_empty() {
        let (stmt, tail) = Statement::prepare_with_tail(db, rest).expect("batch statement");
        if stmt.is_prepared() {
            stmt.begin().expect("batch execution");
        }
        rest = tail;
    }
}

pub fn create_schema(db: &Session) {
    exec_batch(
        db,
        "CREATE TABLE IF NOT EXISTS offices (
             code           INTEGER PRIMARY KEY,
             city           TEXT NOT NULL,
             phone          TEXT NOT NULL,
             address_line_1 TEXT,
             address_line_2 TEXT,
             state          TEXT,
             country        TEXT,
             postal_code    TEXT,
             territory      TEXT
         );
         CREATE TABLE IF NOT EXISTS employees (
             number      INTEGER PRIMARY KEY,
             surname     TEXT NOT NULL,
             forename    TEXT NOT NULL,
             extension   TEXT,
             email       TEXT,
             office_code INTEGER REFERENCES offices(code),
             reports_to  INTEGER,
             job_title   TEXT
         );",
    );
}

pub fn populate(db: &Session) {
    let offices: &[(i64, &str, &str, &str, &str)] = &[
        (1, "San Francisco", "+1 650 219 4782", "USA", "NA"),
        (2, "Boston", "+1 215 837 0825", "USA", "NA"),
        (3, "New York", "+1 212 555 3000", "USA", "NA"),
        (4, "Paris", "+33 14 723 4404", "France", "EMEA"),
        (5, "Tokyo", "+81 33 224 5000", "Japan", "APAC"),
        (6, "Sydney", "+61 2 9264 2451", "Australia", "APAC"),
        (7, "London", LONDON_PHONE, "UK", "EMEA"),
    ];
    for (code, city, phone, country, territory) in offices {
        db.exec(
            "INSERT OR REPLACE INTO offices (code, city, phone, country, territory)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[code, city, phone, country, territory],
        )
        .expect("insert office");
    }

    let employees: &[(i64, &str, &str, &str, i64, Option<i64>, &str)] = &[
        (1002, "Murphy", "Diane", "x5800", 1, None, "President"),
        (1056, "Patterson", "Mary", "x4611", 1, Some(1002), "VP Sales"),
        (1102, "Bondur", "Gerard", "x5408", 4, Some(1056), "Sales Manager (EMEA)"),
        (1143, "Bow", "Anthony", "x5428", 1, Some(1056), "Sales Manager (NA)"),
        (1165, "Jennings", "Leslie", "x3291", 1, Some(1143), "Sales Rep"),
        (1337, "Bondur", "Loui", "x6493", 4, Some(1102), "Sales Rep"),
    ];
    for (number, surname, forename, extension, office, reports_to, title) in employees {
        let email = format!(
            "{}{}@classicmodelcars.com",
            forename.chars().next().unwrap().to_lowercase(),
            surname.to_lowercase()
        );
        db.exec(
            "INSERT OR REPLACE INTO employees
                 (number, surname, forename, extension, email, office_code, reports_to, job_title)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            &[number, surname, forename, extension, &email, office, reports_to, title],
        )
        .expect("insert employee");
    }
}

/// Open (creating if necessary) the populated fixture database in `dir`.
pub fn open_sample(dir: &TempDir) -> Session {
    let db = Session::open(&db_uri(dir)).expect("open fixture database");
    create_schema(&db);
    populate(&db);
    db
}

/// Collect column 0 of every row of `sql` as `i64`.
pub fn collect_i64(db: &Session, sql: &str) -> Vec<i64> {
    let stmt = db.exec(sql, &[]).expect("query");
    let mut row = stmt.current_row();
    let mut values = Vec::new();
    while !row.is_empty() {
        values.push(row.get::<i64>(0).expect("integer column"));
        row.step().expect("step");
    }
    values
}
