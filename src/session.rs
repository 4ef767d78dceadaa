//! Database connections.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::ffi::{c_int, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::sync::{Arc, OnceLock};

use libsqlite3_sys as ffi;
use parking_lot::{Condvar, Mutex};

// Not present in the vendored libsqlite3-sys bindings, but compiled into the
// bundled sqlite3.c; declared here so the deferred-close semantics in
// `Drop for Session` can use the real symbol.
extern "C" {
    fn sqlite3_close_v2(db: *mut ffi::sqlite3) -> c_int;
}

use crate::collation;
use crate::error::{engine_error, engine_message, Result, SqlError};
use crate::idset::vtab;
use crate::registry;
use crate::statement::{Row, Statement};
use crate::transaction::{Transaction, TxnFrame};
use crate::types::ToParam;

/// Progress handlers fire every ~10 000 virtual-machine steps.
const PROGRESS_PERIOD: c_int = 10_000;

/// One open connection to a local database.
///
/// An application may open any number of sessions for a given database.
/// Distinct sessions on the same database are safe to use from different
/// threads; a single session must not be used from more than one thread
/// concurrently. The only cross-thread entry points are
/// [`InterruptHandle`] and the engine's unlock notifications, which the
/// session handles internally.
pub struct Session {
    body: Rc<SessionBody>,
}

impl Session {
    /// Create a session with no connection.
    #[must_use]
    pub fn new() -> Self {
        Session {
            body: Rc::new(SessionBody::new()),
        }
    }

    /// Open a connection to `uri`.
    ///
    /// Recognized schemes are `sqlite3:` and `file:` (case-insensitive);
    /// the remainder is handed to the engine as a `file:` URI. A bare path
    /// is wrapped as `file://<path>`.
    ///
    /// # Errors
    /// [`SqlError::Sql`] for an unrecognised scheme or any engine failure
    /// to open the database.
    pub fn open(uri: &str) -> Result<Self> {
        let session = Session::new();
        session.reopen(uri)?;
        Ok(session)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// As [`Session::open`].
    pub fn open_in_memory() -> Result<Self> {
        Session::open("sqlite3::memory:")
    }

    /// Open a connection on this session, closing any current one first.
    /// The current connection is replaced even when opening fails.
    ///
    /// # Errors
    /// As [`Session::open`], plus any failure to close the previous
    /// connection.
    pub fn reopen(&self, uri: &str) -> Result<()> {
        let rewritten = rewrite_uri(uri)?;
        let c_uri = CString::new(rewritten)
            .map_err(|_| SqlError::InvalidArgument("URI contains a NUL byte".into()))?;

        let mut db: *mut ffi::sqlite3 = std::ptr::null_mut();
        let status = unsafe {
            ffi::sqlite3_open_v2(
                c_uri.as_ptr(),
                &mut db,
                ffi::SQLITE_OPEN_READWRITE | ffi::SQLITE_OPEN_CREATE | ffi::SQLITE_OPEN_URI,
                std::ptr::null(),
            )
        };

        if status != ffi::SQLITE_OK {
            let err = engine_error(db, status, None);
            if !db.is_null() {
                unsafe {
                    ffi::sqlite3_close(db);
                }
            }
            if self.is_open() {
                let _ = self.close();
            }
            return Err(err);
        }

        if self.is_open() {
            if let Err(err) = self.close() {
                unsafe {
                    ffi::sqlite3_close(db);
                }
                return Err(err);
            }
        }

        self.body.db.set(db);
        *self.body.interrupt.db.lock() = db;
        unsafe {
            collation::register(db);
            vtab::register(db);
        }
        *self.body.uri.borrow_mut() = uri.to_string();
        tracing::debug!(uri, "opened database session");
        Ok(())
    }

    /// Close the connection if open, finalizing the statement cache first.
    ///
    /// # Errors
    /// [`SqlError::Sql`] when the engine refuses to close, e.g. with
    /// statements still executing; the connection stays open.
    pub fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.body.finalize_cached();
        let db = self.body.db.get();
        *self.body.interrupt.db.lock() = std::ptr::null_mut();
        let status = unsafe { ffi::sqlite3_close(db) };
        if status != ffi::SQLITE_OK {
            *self.body.interrupt.db.lock() = db;
            return Err(engine_error(db, status, None));
        }
        self.body.db.set(std::ptr::null_mut());
        self.body.uri.borrow_mut().clear();
        Ok(())
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.body.is_open()
    }

    /// The URI of the open connection, empty when closed.
    #[must_use]
    pub fn uri(&self) -> String {
        self.body.uri.borrow().clone()
    }

    /// Compile and begin executing an ad-hoc statement. The SQL is
    /// (re-)compiled on each call; register statements for repeated use.
    ///
    /// The returned [`Statement`] is positioned on the first row (if any)
    /// so the caller may continue iteration.
    ///
    /// # Errors
    /// Compilation, binding or execution failures per the taxonomy.
    pub fn exec(&self, sql: &str, params: &[&dyn ToParam]) -> Result<Statement> {
        self.body.exec(sql, params)
    }

    /// Execute a statement registered with
    /// [`register_statement`](crate::register_statement), compiling and
    /// caching it on first use by this session.
    ///
    /// The returned guard resets the underlying statement when dropped.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] for an unknown ID, otherwise as
    /// [`Session::exec`].
    pub fn exec_registered(&self, id: usize, params: &[&dyn ToParam]) -> Result<ExecResult> {
        self.body.exec_registered(id, params)
    }

    /// Fetch this session's cached statement for a registered ID,
    /// compiling it if needed. If the cached statement is already active,
    /// a private copy is compiled and returned instead so re-entrant use
    /// does not clobber the ongoing iteration.
    ///
    /// # Errors
    /// As [`Session::exec_registered`].
    pub fn statement(&self, id: usize) -> Result<Rc<Statement>> {
        self.body.statement(id)
    }

    /// Finalize every statement in the per-session cache.
    pub fn finalize_statements(&self) {
        self.body.finalize_cached();
    }

    /// Reset every statement in the per-session cache.
    pub fn reset_statements(&self) {
        self.body.reset_cached();
    }

    /// Search the database for a named object.
    ///
    /// # Errors
    /// As [`Session::exec_registered`].
    pub fn has_object(&self, object_type: &str, name: &str) -> Result<bool> {
        static HAS_OBJECT: OnceLock<usize> = OnceLock::new();
        if !self.is_open() {
            return Ok(false);
        }
        let id = *HAS_OBJECT.get_or_init(|| {
            registry::register_statement(
                "SELECT rootpage FROM sqlite_master WHERE type=? AND name=?",
            )
        });
        let result = self.exec_registered(id, &[&object_type, &name])?;
        Ok(result.is_row())
    }

    /// Abort any statement executing on this connection. Safe to call from
    /// the executing thread (via a progress handler) or any other thread;
    /// the interrupted thread observes [`SqlError::Interrupt`].
    pub fn interrupt(&self) {
        self.body.interrupt.interrupt();
    }

    /// A handle that can interrupt this session from any thread.
    #[must_use]
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.body.interrupt),
        }
    }

    /// ID of the most recently inserted row, even if since rolled back.
    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        match self.body.raw_db() {
            Ok(db) => unsafe { ffi::sqlite3_last_insert_rowid(db) },
            Err(_) => 0,
        }
    }

    /// Rows changed by the most recent mutating statement.
    #[must_use]
    pub fn rows_affected(&self) -> usize {
        match self.body.raw_db() {
            Ok(db) => unsafe { ffi::sqlite3_changes(db) as usize },
            Err(_) => 0,
        }
    }

    /// The engine's most recent status code on this connection.
    #[must_use]
    pub fn last_status_code(&self) -> i32 {
        match self.body.raw_db() {
            Ok(db) => unsafe { ffi::sqlite3_errcode(db) },
            Err(_) => ffi::SQLITE_MISUSE,
        }
    }

    /// Message describing the most recent status on this connection.
    #[must_use]
    pub fn last_message(&self) -> String {
        match self.body.raw_db() {
            Ok(db) => engine_message(db, unsafe { ffi::sqlite3_errcode(db) }),
            Err(_) => "database connection is not open".into(),
        }
    }

    /// Message for `status`, using `session`'s context when it refers to
    /// that session's most recent status.
    #[must_use]
    pub fn status_message(session: Option<&Session>, status: i32) -> String {
        let db = session
            .and_then(|s| s.body.raw_db().ok())
            .unwrap_or(std::ptr::null_mut());
        engine_message(db, status)
    }

    /// Free spare memory held for this connection and drop the statement
    /// cache.
    pub fn release_memory(&self) {
        if let Ok(db) = self.body.raw_db() {
            unsafe {
                ffi::sqlite3_db_release_memory(db);
            }
        }
        self.body.finalize_cached();
    }

    /// Run a database garbage-collection cycle.
    ///
    /// # Errors
    /// As [`Session::exec`].
    pub fn vacuum(&self) -> Result<()> {
        self.body.reset_cached();
        self.exec("VACUUM", &[])?;
        Ok(())
    }

    /// Set or clear the statement-progress callback. While set, the engine
    /// invokes it periodically during execution; returning `true` aborts
    /// the current statement, which surfaces as [`SqlError::Interrupt`] in
    /// the executing thread.
    ///
    /// # Errors
    /// [`SqlError::Sql`] when the session is closed.
    pub fn set_progress_handler(
        &self,
        handler: Option<Box<dyn FnMut() -> bool + 'static>>,
    ) -> Result<()> {
        let db = self.body.raw_db()?;
        let registered = handler.is_some();
        *self.body.progress.borrow_mut() = handler;
        unsafe {
            if registered {
                ffi::sqlite3_progress_handler(
                    db,
                    PROGRESS_PERIOD,
                    Some(call_progress_handler),
                    Rc::as_ptr(&self.body) as *mut c_void,
                );
            } else {
                ffi::sqlite3_progress_handler(db, 0, None, std::ptr::null_mut());
            }
        }
        Ok(())
    }

    /// Run `body` inside a transaction; shorthand for
    /// [`Transaction::begin`].
    ///
    /// # Errors
    /// As [`Transaction::begin`].
    pub fn begin_transaction<F>(&self, body: F) -> Result<Transaction>
    where
        F: FnMut(&Transaction) -> Result<()>,
    {
        Transaction::begin(self, body)
    }

    /// Run `action` when the outermost active transaction commits, in
    /// registration (FIFO) order. With no transaction active, `action`
    /// runs immediately. Registered actions are dropped if the transaction
    /// rolls back.
    pub fn on_final_commit(&self, action: impl FnOnce() + 'static) {
        self.body.on_final_commit(Box::new(action));
    }

    /// Run `action` if the active transaction rolls back, in reverse
    /// registration (LIFO) order. With no transaction active, `action` is
    /// dropped. Registered actions are dropped once the outermost
    /// transaction commits.
    pub fn on_rollback(&self, action: impl FnOnce() + 'static) {
        self.body.on_rollback(Box::new(action));
    }

    pub(crate) fn body(&self) -> Rc<SessionBody> {
        Rc::clone(&self.body)
    }
}

impl Default for Session {
    fn default() -> Self {
        Session::new()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.is_open() {
            return;
        }
        if let Err(err) = self.close() {
            tracing::warn!(uri = %self.uri(), error = %err, "failed to close session cleanly");
            let db = self.body.db.get();
            *self.body.interrupt.db.lock() = std::ptr::null_mut();
            self.body.db.set(std::ptr::null_mut());
            self.body.uri.borrow_mut().clear();
            // defers the actual close until outstanding statements finalize
            unsafe {
                sqlite3_close_v2(db);
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uri", &self.uri())
            .field("open", &self.is_open())
            .finish()
    }
}

fn rewrite_uri(uri: &str) -> Result<String> {
    match uri.find(':') {
        Some(pos) => {
            let scheme = &uri[..pos];
            let rest = &uri[pos + 1..];
            if scheme.eq_ignore_ascii_case("sqlite3") || scheme.eq_ignore_ascii_case("file") {
                Ok(format!("file:{rest}"))
            } else {
                Err(SqlError::message(format!(
                    "unrecognised database type \"{scheme}\" in URI \"{uri}\""
                )))
            }
        }
        None => Ok(format!("file://{uri}")),
    }
}

unsafe extern "C" fn call_progress_handler(ctx: *mut c_void) -> c_int {
    let body = &*(ctx as *const SessionBody);
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        let mut slot = body.progress.borrow_mut();
        match slot.as_mut() {
            Some(handler) => handler(),
            None => false,
        }
    }));
    match outcome {
        Ok(abort) => c_int::from(abort),
        Err(_) => 1,
    }
}

/// Cross-thread interrupt capability for one [`Session`].
#[derive(Clone)]
pub struct InterruptHandle {
    shared: Arc<InterruptShared>,
}

impl InterruptHandle {
    /// Abort any statement currently executing on the session. A no-op
    /// once the session is closed.
    pub fn interrupt(&self) {
        self.shared.interrupt();
    }
}

pub(crate) struct InterruptShared {
    db: Mutex<*mut ffi::sqlite3>,
}

unsafe impl Send for InterruptShared {}
unsafe impl Sync for InterruptShared {}

impl InterruptShared {
    fn interrupt(&self) {
        let guard = self.db.lock();
        let db = *guard;
        if !db.is_null() {
            unsafe {
                ffi::sqlite3_interrupt(db);
            }
        }
    }
}

struct WaitState {
    waiting: Mutex<bool>,
    notify: Condvar,
}

/// Guard returned by [`Session::exec_registered`]; resets the underlying
/// cached statement when dropped so the next use starts fresh.
pub struct ExecResult {
    stmt: Option<Rc<Statement>>,
}

impl ExecResult {
    fn new(stmt: Rc<Statement>) -> Self {
        ExecResult { stmt: Some(stmt) }
    }

    /// The underlying statement.
    #[must_use]
    pub fn statement(&self) -> &Statement {
        self.stmt.as_ref().expect("statement already released")
    }

    /// The row the statement is positioned on.
    #[must_use]
    pub fn current(&self) -> Row<'_> {
        self.statement().current_row()
    }

    /// Advance to the next row.
    ///
    /// # Errors
    /// As [`Statement::next`].
    pub fn next(&self) -> Result<Row<'_>> {
        self.statement().next()
    }

    /// Whether the statement is positioned on a row.
    #[must_use]
    pub fn is_row(&self) -> bool {
        self.statement().is_active()
    }

    /// Take control of the underlying statement, disabling the automatic
    /// reset.
    #[must_use]
    pub fn release(mut self) -> Rc<Statement> {
        self.stmt.take().expect("statement already released")
    }
}

impl std::ops::Deref for ExecResult {
    type Target = Statement;

    fn deref(&self) -> &Statement {
        self.statement()
    }
}

impl Drop for ExecResult {
    fn drop(&mut self) {
        if let Some(stmt) = self.stmt.take() {
            stmt.reset();
        }
    }
}

type HookAction = Box<dyn FnOnce()>;

pub(crate) struct SessionBody {
    db: Cell<*mut ffi::sqlite3>,
    uri: RefCell<String>,
    statements: RefCell<Vec<Option<Rc<Statement>>>>,
    wait: Arc<WaitState>,
    interrupt: Arc<InterruptShared>,
    progress: RefCell<Option<Box<dyn FnMut() -> bool>>>,
    inner_txn: RefCell<Option<Rc<TxnFrame>>>,
    commit_actions: RefCell<VecDeque<HookAction>>,
    rollback_actions: RefCell<Vec<HookAction>>,
}

impl SessionBody {
    fn new() -> Self {
        SessionBody {
            db: Cell::new(std::ptr::null_mut()),
            uri: RefCell::new(String::new()),
            statements: RefCell::new(Vec::new()),
            wait: Arc::new(WaitState {
                waiting: Mutex::new(false),
                notify: Condvar::new(),
            }),
            interrupt: Arc::new(InterruptShared {
                db: Mutex::new(std::ptr::null_mut()),
            }),
            progress: RefCell::new(None),
            inner_txn: RefCell::new(None),
            commit_actions: RefCell::new(VecDeque::new()),
            rollback_actions: RefCell::new(Vec::new()),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.db.get().is_null()
    }

    pub(crate) fn raw_db(&self) -> Result<*mut ffi::sqlite3> {
        let db = self.db.get();
        if db.is_null() {
            Err(SqlError::message("database connection is not open"))
        } else {
            Ok(db)
        }
    }

    pub(crate) fn exec(self: &Rc<Self>, sql: &str, params: &[&dyn ToParam]) -> Result<Statement> {
        let stmt = Statement::prepare_in(self, sql)?;
        stmt.begin_with(params)?;
        Ok(stmt)
    }

    pub(crate) fn exec_registered(
        self: &Rc<Self>,
        id: usize,
        params: &[&dyn ToParam],
    ) -> Result<ExecResult> {
        let stmt = self.statement(id)?;
        stmt.begin_with(params)?;
        Ok(ExecResult::new(stmt))
    }

    pub(crate) fn statement(self: &Rc<Self>, id: usize) -> Result<Rc<Statement>> {
        {
            let mut cache = self.statements.borrow_mut();
            if id >= cache.len() {
                if id >= registry::registered_statement_count() {
                    return Err(SqlError::InvalidArgument(format!(
                        "invalid statement ID {id} given"
                    )));
                }
                cache.resize_with(id + 1, || None);
            }
            if cache[id].is_none() {
                cache[id] = Some(Rc::new(Statement::new()));
            }
        }

        let stmt = self.statements.borrow()[id]
            .clone()
            .expect("cache slot populated above");

        if !stmt.is_prepared() {
            let sql = registry::registered_statement(id)?;
            stmt.prepare_in_place(self, &sql)?;
        }

        if stmt.is_active() {
            // re-entrant use of the registered statement: hand out a
            // private copy so the ongoing iteration is not clobbered
            let sql = registry::registered_statement(id)?;
            return Ok(Rc::new(Statement::prepare_in(self, &sql)?));
        }

        Ok(stmt)
    }

    pub(crate) fn finalize_cached(&self) {
        let cache = std::mem::take(&mut *self.statements.borrow_mut());
        for stmt in cache.into_iter().flatten() {
            stmt.finalize();
        }
    }

    pub(crate) fn reset_cached(&self) {
        for stmt in self.statements.borrow().iter().flatten() {
            stmt.reset();
        }
    }

    /// Block until the engine delivers an unlock notification. Returns
    /// `false` when registering the notification reports a potential
    /// deadlock, in which case the caller raises [`SqlError::Busy`].
    pub(crate) fn wait_for_unlock(&self) -> bool {
        let db = match self.raw_db() {
            Ok(db) => db,
            Err(_) => return false,
        };

        *self.wait.waiting.lock() = true;

        let arg = Arc::as_ptr(&self.wait) as *mut c_void;
        let status = unsafe { ffi::sqlite3_unlock_notify(db, Some(on_unlock_notify), arg) };

        if status != ffi::SQLITE_OK {
            *self.wait.waiting.lock() = false;
            return false;
        }

        let mut waiting = self.wait.waiting.lock();
        while *waiting {
            self.wait.notify.wait(&mut waiting);
        }
        drop(waiting);

        unsafe {
            ffi::sqlite3_unlock_notify(db, None, std::ptr::null_mut());
        }
        true
    }

    pub(crate) fn in_transaction(&self) -> bool {
        self.inner_txn.borrow().is_some()
    }

    /// Push `frame` as the innermost transaction, returning the previous
    /// head (the new frame's outer).
    pub(crate) fn add_transaction(&self, frame: Rc<TxnFrame>) -> Option<Rc<TxnFrame>> {
        self.inner_txn.borrow_mut().replace(frame)
    }

    /// Unlink `frame` from the transaction stack wherever it sits.
    pub(crate) fn remove_transaction(&self, frame: &Rc<TxnFrame>) {
        let head = self.inner_txn.borrow().clone();
        let Some(head) = head else { return };

        if Rc::ptr_eq(&head, frame) {
            *self.inner_txn.borrow_mut() = frame.take_outer();
            return;
        }

        let mut cursor = head;
        loop {
            let next = cursor.outer();
            match next {
                Some(next) if Rc::ptr_eq(&next, frame) => {
                    cursor.set_outer(frame.take_outer());
                    return;
                }
                Some(next) => cursor = next,
                None => return,
            }
        }
    }

    /// Outermost commit: drop the rollback queue, then drain the commit
    /// queue in FIFO order.
    pub(crate) fn transaction_committed(&self) {
        self.rollback_actions.borrow_mut().clear();
        loop {
            let action = self.commit_actions.borrow_mut().pop_front();
            match action {
                Some(action) => action(),
                None => break,
            }
        }
    }

    /// Rollback reached the engine: unwind every frame innermost-first,
    /// drop the commit queue, then drain the rollback queue in LIFO order.
    pub(crate) fn transaction_rolled_back(&self) {
        loop {
            let frame = self.inner_txn.borrow_mut().take();
            match frame {
                Some(frame) => {
                    let outer = frame.unwind_rolled_back();
                    *self.inner_txn.borrow_mut() = outer;
                }
                None => break,
            }
        }
        self.commit_actions.borrow_mut().clear();
        loop {
            let action = self.rollback_actions.borrow_mut().pop();
            match action {
                Some(action) => action(),
                None => break,
            }
        }
    }

    pub(crate) fn on_final_commit(&self, action: HookAction) {
        if self.in_transaction() {
            self.commit_actions.borrow_mut().push_back(action);
        } else {
            action();
        }
    }

    pub(crate) fn on_rollback(&self, action: HookAction) {
        if self.in_transaction() {
            self.rollback_actions.borrow_mut().push(action);
        }
    }
}

unsafe extern "C" fn on_unlock_notify(args: *mut *mut c_void, count: c_int) {
    for i in 0..count as usize {
        let state = &*((*args.add(i)) as *const WaitState);
        let mut waiting = state.waiting.lock();
        *waiting = false;
        state.notify.notify_all();
    }
}
