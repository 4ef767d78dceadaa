//! Prepared statements and row cursors.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_int, CStr};
use std::rc::{Rc, Weak};
use std::sync::OnceLock;

use libsqlite3_sys as ffi;
use parking_lot::Mutex;

use crate::error::{engine_error, engine_message, Result, SqlError};
use crate::session::SessionBody;
use crate::types::{FromColumn, ToParam, ValueType};

/// A compiled SQL statement owned by a [`Session`].
///
/// Lifecycle: a statement is created unprepared or compiled from
/// `(session, sql)`; it may be reset any number of times (cancelling
/// iteration while preserving bindings) and is finalized exactly once, by
/// [`Statement::finalize`] or on drop. A statement is *active* while the
/// engine has produced at least one row and more may follow.
///
/// [`Session`]: crate::Session
pub struct Statement {
    session: RefCell<Option<Weak<SessionBody>>>,
    stmt: Cell<*mut ffi::sqlite3_stmt>,
    active: Cell<bool>,
}

impl Default for Statement {
    fn default() -> Self {
        Self::new()
    }
}

impl Statement {
    /// Create an unprepared statement.
    #[must_use]
    pub fn new() -> Self {
        Statement {
            session: RefCell::new(None),
            stmt: Cell::new(std::ptr::null_mut()),
            active: Cell::new(false),
        }
    }

    /// Compile the first statement out of `sql` on `session`.
    ///
    /// # Errors
    /// [`SqlError::Busy`] when the engine reports contention that the
    /// unlock wait could not resolve, [`SqlError::Sql`] for any other
    /// preparation failure.
    pub fn prepare(session: &crate::Session, sql: &str) -> Result<Self> {
        Self::prepare_in(&session.body(), sql)
    }

    /// Like [`Statement::prepare`], additionally returning the left-trimmed
    /// remainder of `sql` after the first statement, for chained parsing.
    ///
    /// # Errors
    /// As [`Statement::prepare`].
    pub fn prepare_with_tail<'a>(
        session: &crate::Session,
        sql: &'a str,
    ) -> Result<(Self, &'a str)> {
        let stmt = Statement::new();
        let consumed = stmt.prepare_in_place(&session.body(), sql)?;
        Ok((stmt, sql[consumed..].trim_start()))
    }

    pub(crate) fn prepare_in(body: &Rc<SessionBody>, sql: &str) -> Result<Self> {
        let stmt = Statement::new();
        stmt.prepare_in_place(body, sql)?;
        Ok(stmt)
    }

    /// Compile `sql` into this statement, finalizing any previous handle
    /// first. Returns the byte offset of the unconsumed tail.
    pub(crate) fn prepare_in_place(&self, body: &Rc<SessionBody>, sql: &str) -> Result<usize> {
        self.finalize();
        *self.session.borrow_mut() = Some(Rc::downgrade(body));

        let db = body.raw_db()?;
        loop {
            let mut handle: *mut ffi::sqlite3_stmt = std::ptr::null_mut();
            let mut tail: *const std::ffi::c_char = std::ptr::null();
            let status = unsafe {
                ffi::sqlite3_prepare_v2(
                    db,
                    sql.as_ptr().cast(),
                    c_int::try_from(sql.len())
                        .map_err(|_| SqlError::TooBig("SQL text too large".into()))?,
                    &mut handle,
                    &mut tail,
                )
            };
            match status {
                ffi::SQLITE_OK => {
                    self.stmt.set(handle);
                    let consumed = unsafe { tail.offset_from(sql.as_ptr().cast()) } as usize;
                    return Ok(consumed);
                }
                ffi::SQLITE_LOCKED => {
                    if !body.wait_for_unlock() {
                        return Err(SqlError::Busy);
                    }
                }
                ffi::SQLITE_BUSY => return Err(SqlError::Busy),
                status => return Err(engine_error(db, status, Some(sql))),
            }
        }
    }

    /// Release the compiled handle, resetting first. Idempotent.
    pub fn finalize(&self) {
        if self.is_prepared() {
            self.reset();
            unsafe {
                ffi::sqlite3_finalize(self.stmt.get());
            }
            self.stmt.set(std::ptr::null_mut());
        }
        *self.session.borrow_mut() = None;
    }

    #[must_use]
    pub fn is_prepared(&self) -> bool {
        !self.stmt.get().is_null()
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        !self.is_prepared()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.get()
    }

    /// The SQL text this statement was compiled from, if prepared.
    #[must_use]
    pub fn sql(&self) -> Option<String> {
        if !self.is_prepared() {
            return None;
        }
        unsafe {
            let text = ffi::sqlite3_sql(self.stmt.get());
            if text.is_null() {
                None
            } else {
                Some(CStr::from_ptr(text).to_string_lossy().into_owned())
            }
        }
    }

    /// Cancel iteration. Bindings are preserved.
    pub fn reset(&self) {
        if self.is_prepared() {
            unsafe {
                ffi::sqlite3_reset(self.stmt.get());
            }
        }
        self.active.set(false);
    }

    /// Clear all parameter bindings, resetting first if active.
    pub fn clear_bindings(&self) {
        if self.is_active() {
            self.reset();
        }
        if self.is_prepared() {
            unsafe {
                ffi::sqlite3_clear_bindings(self.stmt.get());
            }
        }
    }

    fn raw(&self) -> Result<*mut ffi::sqlite3_stmt> {
        if self.is_prepared() {
            Ok(self.stmt.get())
        } else {
            Err(SqlError::InvalidArgument(
                "statement is not prepared".into(),
            ))
        }
    }

    fn raw_db(&self) -> *mut ffi::sqlite3 {
        self.session
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .and_then(|body| body.raw_db().ok())
            .unwrap_or(std::ptr::null_mut())
    }

    pub(crate) fn session_body(&self) -> Result<Rc<SessionBody>> {
        self.session
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SqlError::message("statement's session no longer exists"))
    }

    fn bind_error(&self, index: usize, status: c_int) -> SqlError {
        match status {
            ffi::SQLITE_RANGE => SqlError::InvalidArgument(format!(
                "parameter index {index} out of range (SQL: {})",
                self.sql().unwrap_or_default()
            )),
            ffi::SQLITE_TOOBIG => SqlError::TooBig(engine_message(self.raw_db(), status)),
            ffi::SQLITE_NOMEM => SqlError::OutOfMemory(engine_message(self.raw_db(), status)),
            status => engine_error(self.raw_db(), status, self.sql().as_deref()),
        }
    }

    fn check_bind(&self, index: usize, status: c_int) -> Result<()> {
        if status == ffi::SQLITE_OK {
            Ok(())
        } else {
            Err(self.bind_error(index, status))
        }
    }

    /// Bind an SQL NULL to the 1-based parameter `index`.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] for an out-of-range index.
    pub fn bind_null(&self, index: usize) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;
        let status = unsafe { ffi::sqlite3_bind_null(raw, index as c_int) };
        self.check_bind(index, status)
    }

    /// Bind a 64-bit integer. Smaller integer widths widen; unsigned values
    /// are stored as the reinterpreted signed value.
    ///
    /// # Errors
    /// As [`Statement::bind_null`].
    pub fn bind_int64(&self, index: usize, value: i64) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;
        let status = unsafe { ffi::sqlite3_bind_int64(raw, index as c_int, value) };
        self.check_bind(index, status)
    }

    /// Bind a double. NaN and the infinities are preserved exactly.
    ///
    /// # Errors
    /// As [`Statement::bind_null`].
    pub fn bind_double(&self, index: usize, value: f64) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;
        let status = unsafe { ffi::sqlite3_bind_double(raw, index as c_int, value) };
        self.check_bind(index, status)
    }

    /// Bind UTF-8 text. The engine takes its own copy.
    ///
    /// # Errors
    /// [`SqlError::TooBig`] for oversize values, otherwise as
    /// [`Statement::bind_null`].
    pub fn bind_text(&self, index: usize, value: &str) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;
        let status = unsafe {
            ffi::sqlite3_bind_text64(
                raw,
                index as c_int,
                value.as_ptr().cast(),
                value.len() as ffi::sqlite3_uint64,
                ffi::SQLITE_TRANSIENT(),
                ffi::SQLITE_UTF8 as u8,
            )
        };
        self.check_bind(index, status)
    }

    /// Bind a blob. The engine takes its own copy.
    ///
    /// # Errors
    /// As [`Statement::bind_text`].
    pub fn bind_blob(&self, index: usize, value: &[u8]) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;
        let status = unsafe {
            ffi::sqlite3_bind_blob64(
                raw,
                index as c_int,
                value.as_ptr().cast(),
                value.len() as ffi::sqlite3_uint64,
                ffi::SQLITE_TRANSIENT(),
            )
        };
        self.check_bind(index, status)
    }

    /// Bind a blob without copying, handing buffer ownership to the engine.
    ///
    /// `destructor` is invoked exactly once with the buffer when the engine
    /// releases it, on whichever thread the engine chooses. Zero-length
    /// buffers are not handed to the engine; their destructor runs before
    /// this call returns.
    ///
    /// # Errors
    /// [`SqlError::Sql`] when a destructor is already registered for the
    /// buffer address, otherwise as [`Statement::bind_text`].
    pub fn bind_blob_with_destructor(
        &self,
        index: usize,
        data: Box<[u8]>,
        destructor: impl FnOnce(Box<[u8]>) + Send + 'static,
    ) -> Result<()> {
        if self.is_active() {
            self.reset();
        }
        let raw = self.raw()?;

        if data.is_empty() {
            let status = unsafe {
                ffi::sqlite3_bind_blob64(
                    raw,
                    index as c_int,
                    data.as_ptr().cast(),
                    0,
                    ffi::SQLITE_TRANSIENT(),
                )
            };
            destructor(data);
            return self.check_bind(index, status);
        }

        let len = data.len();
        let ptr = Box::into_raw(data) as *mut u8;
        if let Err(err) = register_blob_destructor(
            ptr as usize,
            BlobRelease {
                len,
                run: Box::new(destructor),
            },
        ) {
            drop(unsafe { Box::from_raw(std::slice::from_raw_parts_mut(ptr, len)) });
            return Err(err);
        }

        // on failure the engine has already run the destructor callback
        let status = unsafe {
            ffi::sqlite3_bind_blob64(
                raw,
                index as c_int,
                ptr.cast(),
                len as ffi::sqlite3_uint64,
                Some(release_blob),
            )
        };
        self.check_bind(index, status)
    }

    /// Bind one value through its [`ToParam`] implementation.
    ///
    /// # Errors
    /// As the underlying primitive bind.
    pub fn bind(&self, index: usize, value: &dyn ToParam) -> Result<()> {
        value.bind_to(self, index)
    }

    /// Clear all bindings, then bind `params` positionally from slot 1.
    /// Parameters past the end of `params` remain null.
    ///
    /// # Errors
    /// As [`Statement::bind`].
    pub fn bind_all(&self, params: &[&dyn ToParam]) -> Result<()> {
        self.clear_bindings();
        for (i, param) in params.iter().enumerate() {
            param.bind_to(self, i + 1)?;
        }
        Ok(())
    }

    /// Start iteration and fetch the first row. An inactive prepared
    /// statement becomes active; an unprepared one yields an empty row.
    ///
    /// # Errors
    /// [`SqlError::Interrupt`], [`SqlError::Busy`] or [`SqlError::Sql`]
    /// per the engine's report for the first step.
    pub fn begin(&self) -> Result<Row<'_>> {
        if !self.is_prepared() {
            return Ok(Row::empty());
        }
        if self.is_active() {
            self.reset();
        }
        self.active.set(true);
        self.next()
    }

    /// [`Statement::bind_all`] followed by [`Statement::begin`].
    ///
    /// # Errors
    /// As both of those.
    pub fn begin_with(&self, params: &[&dyn ToParam]) -> Result<Row<'_>> {
        self.bind_all(params)?;
        self.begin()
    }

    /// Advance to the next row. At the end of the result set the statement
    /// resets to inactive (bindings preserved) and an empty row is
    /// returned.
    ///
    /// # Errors
    /// As [`Statement::begin`].
    pub fn next(&self) -> Result<Row<'_>> {
        if !self.is_prepared() || !self.is_active() {
            return Ok(Row::empty());
        }

        loop {
            let status = unsafe { ffi::sqlite3_step(self.stmt.get()) };
            match status {
                ffi::SQLITE_ROW => break,
                ffi::SQLITE_OK | ffi::SQLITE_DONE => {
                    self.reset();
                    break;
                }
                ffi::SQLITE_INTERRUPT => {
                    self.reset();
                    return Err(SqlError::Interrupt);
                }
                ffi::SQLITE_LOCKED => {
                    let body = self.session_body()?;
                    if !body.wait_for_unlock() {
                        self.reset();
                        return Err(SqlError::Busy);
                    }
                }
                ffi::SQLITE_BUSY => {
                    self.reset();
                    return Err(SqlError::Busy);
                }
                status => {
                    self.reset();
                    let db = self.raw_db();
                    let sql = self.sql();
                    return Err(engine_error(db, status, sql.as_deref()));
                }
            }
        }

        Ok(self.current_row())
    }

    /// The row the statement is currently positioned on; empty when the
    /// statement is inactive.
    #[must_use]
    pub fn current_row(&self) -> Row<'_> {
        Row { stmt: Some(self) }
    }
}

impl Drop for Statement {
    fn drop(&mut self) {
        self.finalize();
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql())
            .field("active", &self.is_active())
            .finish()
    }
}

/// A lightweight cursor over the current result position of a
/// [`Statement`].
///
/// Copying a row copies the reference: advancing any copy advances the
/// underlying statement, so all copies observe the same position.
#[derive(Clone, Copy)]
pub struct Row<'stmt> {
    stmt: Option<&'stmt Statement>,
}

impl<'stmt> Row<'stmt> {
    pub(crate) fn empty() -> Self {
        Row { stmt: None }
    }

    /// True when no statement is referenced or the statement is inactive.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        !matches!(self.stmt, Some(stmt) if stmt.is_active())
    }

    /// Advance the underlying statement one row. Returns `false` once the
    /// result set is exhausted.
    ///
    /// # Errors
    /// As [`Statement::next`].
    pub fn step(&mut self) -> Result<bool> {
        match self.stmt {
            None => Ok(false),
            Some(stmt) => {
                stmt.next()?;
                Ok(stmt.is_active())
            }
        }
    }

    fn live(&self) -> Result<*mut ffi::sqlite3_stmt> {
        match self.stmt {
            Some(stmt) if stmt.is_active() => stmt.raw(),
            _ => Err(SqlError::InvalidArgument("no current row".into())),
        }
    }

    /// Decode column `col` (0-based) through its [`FromColumn`]
    /// implementation.
    ///
    /// # Errors
    /// When the row is empty or the value cannot be represented as `T`.
    pub fn get<T: FromColumn>(&self, col: usize) -> Result<T> {
        T::from_column(self, col)
    }

    /// Whether the cell at `col` is NULL. `false` for an empty row.
    #[must_use]
    pub fn is_null(&self, col: usize) -> bool {
        match self.live() {
            Ok(raw) => {
                (unsafe { ffi::sqlite3_column_type(raw, col as c_int) }) == ffi::SQLITE_NULL
            }
            Err(_) => false,
        }
    }

    /// Size in bytes of the cell at `col`.
    #[must_use]
    pub fn col_size(&self, col: usize) -> usize {
        match self.live() {
            Ok(raw) => (unsafe { ffi::sqlite3_column_bytes(raw, col as c_int) }) as usize,
            Err(_) => 0,
        }
    }

    /// Number of columns in the result.
    #[must_use]
    pub fn col_count(&self) -> usize {
        match self.live() {
            Ok(raw) => (unsafe { ffi::sqlite3_column_count(raw) }) as usize,
            Err(_) => 0,
        }
    }

    /// Name of column `col`, if the row is live and the column exists.
    #[must_use]
    pub fn col_name(&self, col: usize) -> Option<String> {
        let raw = self.live().ok()?;
        unsafe {
            let name = ffi::sqlite3_column_name(raw, col as c_int);
            if name.is_null() {
                None
            } else {
                Some(CStr::from_ptr(name).to_string_lossy().into_owned())
            }
        }
    }

    /// Storage class of the cell at `col`.
    ///
    /// # Errors
    /// When the row is empty or the engine reports an unknown class.
    pub fn col_type(&self, col: usize) -> Result<ValueType> {
        let raw = self.live()?;
        let kind = unsafe { ffi::sqlite3_column_type(raw, col as c_int) };
        match kind {
            ffi::SQLITE_INTEGER => Ok(ValueType::Integer),
            ffi::SQLITE_FLOAT => Ok(ValueType::Float),
            ffi::SQLITE_TEXT => Ok(ValueType::Text),
            ffi::SQLITE_BLOB => Ok(ValueType::Blob),
            ffi::SQLITE_NULL => Ok(ValueType::Null),
            other => Err(SqlError::message(format!("unknown column type {other}"))),
        }
    }

    /// Index of the column named `name` in the current result, by linear
    /// scan.
    #[must_use]
    pub fn col_no(&self, name: &str) -> Option<usize> {
        (0..self.col_count()).find(|&i| self.col_name(i).as_deref() == Some(name))
    }

    /// As [`Row::col_no`].
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] when no column has that name.
    pub fn col_no_required(&self, name: &str) -> Result<usize> {
        self.col_no(name).ok_or_else(|| {
            SqlError::InvalidArgument(format!("no such column '{name}' in result set"))
        })
    }

    /// Integer value of the cell at `col`; NULL decodes as zero.
    ///
    /// # Errors
    /// When the row is empty.
    pub fn column_i64(&self, col: usize) -> Result<i64> {
        let raw = self.live()?;
        Ok(unsafe { ffi::sqlite3_column_int64(raw, col as c_int) })
    }

    /// Float value of the cell at `col`; NULL decodes as quiet NaN so
    /// numeric consumers can treat it as a sentinel.
    ///
    /// # Errors
    /// When the row is empty.
    pub fn column_f64(&self, col: usize) -> Result<f64> {
        let raw = self.live()?;
        if self.is_null(col) {
            return Ok(f64::NAN);
        }
        Ok(unsafe { ffi::sqlite3_column_double(raw, col as c_int) })
    }

    /// Text value of the cell at `col`, or `None` for NULL.
    ///
    /// # Errors
    /// When the row is empty.
    pub fn column_text(&self, col: usize) -> Result<Option<String>> {
        let raw = self.live()?;
        if self.is_null(col) {
            return Ok(None);
        }
        unsafe {
            let text = ffi::sqlite3_column_text(raw, col as c_int);
            let len = ffi::sqlite3_column_bytes(raw, col as c_int) as usize;
            if text.is_null() {
                return Ok(Some(String::new()));
            }
            let bytes = std::slice::from_raw_parts(text.cast::<u8>(), len);
            Ok(Some(String::from_utf8_lossy(bytes).into_owned()))
        }
    }

    /// Blob value of the cell at `col`, or `None` for NULL.
    ///
    /// # Errors
    /// When the row is empty.
    pub fn column_blob(&self, col: usize) -> Result<Option<Vec<u8>>> {
        let raw = self.live()?;
        if self.is_null(col) {
            return Ok(None);
        }
        unsafe {
            let data = ffi::sqlite3_column_blob(raw, col as c_int);
            let len = ffi::sqlite3_column_bytes(raw, col as c_int) as usize;
            if data.is_null() {
                return Ok(Some(Vec::new()));
            }
            let bytes = std::slice::from_raw_parts(data.cast::<u8>(), len);
            Ok(Some(bytes.to_vec()))
        }
    }
}

struct BlobRelease {
    len: usize,
    run: Box<dyn FnOnce(Box<[u8]>) + Send>,
}

fn blob_destructors() -> &'static Mutex<HashMap<usize, BlobRelease>> {
    static MAP: OnceLock<Mutex<HashMap<usize, BlobRelease>>> = OnceLock::new();
    MAP.get_or_init(|| Mutex::new(HashMap::new()))
}

fn register_blob_destructor(ptr: usize, release: BlobRelease) -> Result<()> {
    let mut map = blob_destructors().lock();
    if map.contains_key(&ptr) {
        return Err(SqlError::message(format!(
            "destructor already registered for blob {ptr:#x}"
        )));
    }
    map.insert(ptr, release);
    Ok(())
}

unsafe extern "C" fn release_blob(data: *mut std::ffi::c_void) {
    let entry = blob_destructors().lock().remove(&(data as usize));
    if let Some(BlobRelease { len, run }) = entry {
        let buffer = Box::from_raw(std::slice::from_raw_parts_mut(data.cast::<u8>(), len));
        run(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_blob_destructor_is_rejected() {
        let key = 0xdead_0001_usize;
        register_blob_destructor(
            key,
            BlobRelease {
                len: 1,
                run: Box::new(|_| {}),
            },
        )
        .unwrap();
        let err = register_blob_destructor(
            key,
            BlobRelease {
                len: 1,
                run: Box::new(|_| {}),
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("already registered"));
        blob_destructors().lock().remove(&key);
    }
}
