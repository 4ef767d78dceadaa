use std::ffi::{c_int, CStr};

use libsqlite3_sys as ffi;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SqlError>;

/// Failures surfaced by the library.
///
/// `Sql`, `Interrupt` and `Busy` are the three signalled failure kinds; the
/// remaining variants cover invalid parameter binding the same way the
/// engine distinguishes them (index out of range, oversize value,
/// allocation failure).
#[derive(Debug, Error)]
pub enum SqlError {
    /// Preparation or execution failure: syntactic, semantic, constraint
    /// violation, I/O and so on. The message carries the SQL text being
    /// processed when it is known.
    #[error("{message}")]
    Sql { message: String },

    /// The executing statement was aborted by [`Session::interrupt`] or a
    /// progress handler.
    ///
    /// [`Session::interrupt`]: crate::Session::interrupt
    #[error("statement interrupted")]
    Interrupt,

    /// Contention or a potential deadlock that the internal unlock wait did
    /// not resolve. Handled automatically inside [`Transaction::begin`].
    ///
    /// [`Transaction::begin`]: crate::Transaction::begin
    #[error("cannot obtain write lock due to existing read locks")]
    Busy,

    /// A parameter index, column name or statement ID was not valid.
    #[error("{0}")]
    InvalidArgument(String),

    /// A bound value exceeded the engine's size limits.
    #[error("{0}")]
    TooBig(String),

    /// The engine could not allocate memory for the operation.
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl SqlError {
    /// Build a generic error from a narrative message, appending the SQL
    /// text when one is available.
    pub(crate) fn with_sql(message: impl Into<String>, sql: Option<&str>) -> Self {
        let message = message.into();
        let message = match sql {
            Some(sql) if !sql.is_empty() => format!("{message} [SQL: {sql}]"),
            _ => message,
        };
        SqlError::Sql { message }
    }

    pub(crate) fn message(message: impl Into<String>) -> Self {
        SqlError::Sql {
            message: message.into(),
        }
    }
}

/// Describe `status`, preferring the connection's own last message when it
/// still refers to that status.
pub(crate) fn engine_message(db: *mut ffi::sqlite3, status: c_int) -> String {
    unsafe {
        let text = if !db.is_null() && ffi::sqlite3_errcode(db) == status {
            ffi::sqlite3_errmsg(db)
        } else {
            ffi::sqlite3_errstr(status)
        };
        if text.is_null() {
            format!("unknown error (status {status})")
        } else {
            CStr::from_ptr(text).to_string_lossy().into_owned()
        }
    }
}

/// Build the generic error kind from an engine status code.
pub(crate) fn engine_error(db: *mut ffi::sqlite3, status: c_int, sql: Option<&str>) -> SqlError {
    SqlError::with_sql(engine_message(db, status), sql)
}
