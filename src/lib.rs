/*!
 * sdig-sql - embedded SQLite access with live ID-set virtual tables
 *
 * This crate sits directly atop SQLite and provides four tightly coupled
 * abstractions:
 *
 * - [`Session`]: one connection, owning its cache of precompiled
 *   statements, its progress callback and its stack of in-flight
 *   transactions
 * - [`Statement`] / [`Row`]: a prepared-statement lifecycle with typed
 *   parameter binding, row iteration and automatic lock/deadlock handling
 * - [`Transaction`]: nested transactions with automatic retry on
 *   contention, plus commit/rollback hook queues
 * - [`IdSet`]: an in-memory ordered set of 64-bit keys, simultaneously
 *   exposed to the SQL engine as a queryable, updatable virtual table
 *   backed by that same container
 *
 * # Example
 *
 * ```rust,no_run
 * use sdig_sql::prelude::*;
 *
 * fn lookup() -> Result<()> {
 *     let phone_by_city =
 *         register_statement("SELECT phone FROM offices WHERE city = ?");
 *
 *     let db = Session::open("sqlite3:/var/lib/app/company.db")?;
 *     let result = db.exec_registered(phone_by_city, &[&"London"])?;
 *     if result.is_row() {
 *         println!("{}", result.current().get::<String>(0)?);
 *     }
 *
 *     db.begin_transaction(|_txn| {
 *         db.exec("UPDATE offices SET phone = ?1 WHERE city = ?2",
 *                 &[&"+44 20 7946 0000", &"London"])?;
 *         Ok(())
 *     })?;
 *     Ok(())
 * }
 * ```
 *
 * A single `Session` must not be used from more than one thread
 * concurrently; distinct sessions on the same database are safe. The
 * statement registry and the blob-destructor registry are the only
 * process-wide state.
 */

mod collation;
mod error;
mod idset;
mod registry;
mod session;
mod statement;
mod transaction;
mod types;

pub use error::{Result, SqlError};
pub use idset::IdSet;
pub use registry::{register_statement, registered_statement, registered_statement_count};
pub use session::{ExecResult, InterruptHandle, Session};
pub use statement::{Row, Statement};
pub use transaction::Transaction;
pub use types::{FromColumn, Id, Null, ToParam, ValueType};

pub mod prelude {
    //! Convenient imports for common functionality.

    pub use crate::{
        register_statement, ExecResult, FromColumn, Id, IdSet, Null, Result, Row, Session,
        SqlError, Statement, ToParam, Transaction, ValueType,
    };
}
