//! Nested transactions with automatic retry on contention.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::OnceLock;

use libsqlite3_sys as ffi;

use crate::error::{Result, SqlError};
use crate::registry::register_statement;
use crate::session::{Session, SessionBody};

fn begin_stmt() -> usize {
    static ID: OnceLock<usize> = OnceLock::new();
    *ID.get_or_init(|| register_statement("BEGIN"))
}

fn commit_stmt() -> usize {
    static ID: OnceLock<usize> = OnceLock::new();
    *ID.get_or_init(|| register_statement("COMMIT"))
}

fn rollback_stmt() -> usize {
    static ID: OnceLock<usize> = OnceLock::new();
    *ID.get_or_init(|| register_statement("ROLLBACK"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnTag {
    Default,
    Committed,
    RolledBack,
}

/// One frame of a session's transaction stack. Frames, not the movable
/// [`Transaction`] wrappers, are what the session links together, so
/// moving a `Transaction` never disturbs the stack.
pub(crate) struct TxnFrame {
    session: RefCell<Option<Rc<SessionBody>>>,
    tag: Cell<TxnTag>,
    outer: RefCell<Option<Rc<TxnFrame>>>,
}

impl TxnFrame {
    fn new() -> Rc<Self> {
        Rc::new(TxnFrame {
            session: RefCell::new(None),
            tag: Cell::new(TxnTag::Default),
            outer: RefCell::new(None),
        })
    }

    pub(crate) fn outer(&self) -> Option<Rc<TxnFrame>> {
        self.outer.borrow().clone()
    }

    pub(crate) fn take_outer(&self) -> Option<Rc<TxnFrame>> {
        self.outer.borrow_mut().take()
    }

    pub(crate) fn set_outer(&self, outer: Option<Rc<TxnFrame>>) {
        *self.outer.borrow_mut() = outer;
    }

    /// Deactivate this frame as part of a rollback unwind, returning the
    /// next frame outward.
    pub(crate) fn unwind_rolled_back(&self) -> Option<Rc<TxnFrame>> {
        *self.session.borrow_mut() = None;
        self.tag.set(TxnTag::RolledBack);
        self.take_outer()
    }
}

/// A unit of atomic work on one [`Session`], possibly nested.
///
/// Only the outermost frame issues engine-level `BEGIN`/`COMMIT`/
/// `ROLLBACK`; nested frames defer visibility to the outermost one.
/// Dropping a still-active transaction rolls it back.
pub struct Transaction {
    frame: Rc<TxnFrame>,
}

impl Transaction {
    /// An inactive transaction attached to nothing.
    #[must_use]
    pub fn new() -> Self {
        Transaction {
            frame: TxnFrame::new(),
        }
    }

    /// Open a frame on `session` and run `body` inside it, committing on
    /// normal return.
    ///
    /// If `body` fails with [`SqlError::Busy`] and the frame is the
    /// outermost one, the frame is rolled back and `body` is re-invoked
    /// from scratch until it completes without contention. A Busy failure
    /// in a nested frame propagates unchanged so the outermost frame can
    /// decide. Any other failure propagates after the frame is rolled
    /// back.
    ///
    /// `body` must therefore be re-runnable: side effects outside the
    /// database (logging, counters) execute again on every retry.
    ///
    /// # Errors
    /// Whatever `body`, `COMMIT` or `ROLLBACK` surface, minus the absorbed
    /// outermost Busy failures.
    pub fn begin<F>(session: &Session, mut body: F) -> Result<Transaction>
    where
        F: FnMut(&Transaction) -> Result<()>,
    {
        let txn = Transaction::new();
        loop {
            let attempt = txn
                .begin_frame(&session.body())
                .and_then(|()| body(&txn))
                .and_then(|()| txn.commit());
            match attempt {
                Ok(()) => break,
                Err(SqlError::Busy) if !txn.nested() => {
                    tracing::debug!("transaction contended, rolling back and retrying");
                    txn.rollback()?;
                }
                Err(err) => {
                    txn.rollback()?;
                    return Err(err);
                }
            }
        }
        Ok(txn)
    }

    fn begin_frame(&self, session: &Rc<SessionBody>) -> Result<()> {
        if !session.in_transaction() {
            // outermost frame: open the engine-level transaction
            session.exec_registered(begin_stmt(), &[])?;
        }
        let prev = session.add_transaction(Rc::clone(&self.frame));
        self.frame.set_outer(prev);
        *self.frame.session.borrow_mut() = Some(Rc::clone(session));
        self.frame.tag.set(TxnTag::Default);
        Ok(())
    }

    /// Commit this frame. Outermost frames issue `COMMIT`, drain the
    /// commit hooks in FIFO order and discard the rollback hooks; nested
    /// frames just leave the stack. Idempotent.
    ///
    /// # Errors
    /// Engine failures from `COMMIT`, including [`SqlError::Busy`]; the
    /// frame stays active so the retry loop can roll it back.
    pub fn commit(&self) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        let session = self
            .frame
            .session
            .borrow()
            .clone()
            .expect("active transaction has a session");

        if !self.nested() {
            session.exec_registered(commit_stmt(), &[])?;
            session.transaction_committed();
        }

        *self.frame.session.borrow_mut() = None;
        self.frame.tag.set(TxnTag::Committed);
        session.remove_transaction(&self.frame);
        Ok(())
    }

    /// Roll back the whole transaction. If the engine still has a live
    /// transaction, `ROLLBACK` is issued; every frame of the stack is then
    /// unwound innermost-first, the rollback hooks drain in LIFO order and
    /// the commit hooks are discarded. Idempotent.
    ///
    /// # Errors
    /// Engine failures from `ROLLBACK`.
    pub fn rollback(&self) -> Result<()> {
        if !self.active() {
            return Ok(());
        }
        let session = self
            .frame
            .session
            .borrow_mut()
            .take()
            .expect("active transaction has a session");

        if session.is_open() {
            let autocommit = unsafe { ffi::sqlite3_get_autocommit(session.raw_db()?) };
            if autocommit == 0 {
                session.exec_registered(rollback_stmt(), &[])?;
            }
            // with autocommit back on the engine already rolled back,
            // typically after an error
        }

        session.transaction_rolled_back();
        Ok(())
    }

    /// Whether this frame is still open.
    #[must_use]
    pub fn active(&self) -> bool {
        self.frame.session.borrow().is_some()
    }

    /// Whether this frame runs inside another frame on the same session.
    #[must_use]
    pub fn nested(&self) -> bool {
        self.frame.outer.borrow().is_some()
    }

    #[must_use]
    pub fn committed(&self) -> bool {
        self.frame.tag.get() == TxnTag::Committed
    }

    #[must_use]
    pub fn rolled_back(&self) -> bool {
        self.frame.tag.get() == TxnTag::RolledBack
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Transaction::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.active() {
            if let Err(err) = self.rollback() {
                tracing::warn!(error = %err, "failed to roll back transaction on drop");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("active", &self.active())
            .field("nested", &self.nested())
            .field("tag", &self.frame.tag.get())
            .finish()
    }
}
