//! In-memory ordered ID sets, optionally exposed to SQL as virtual
//! tables.

pub(crate) mod vtab;

use std::ptr::NonNull;
use std::rc::Rc;

use libsqlite3_sys as ffi;

use crate::error::{Result, SqlError};
use crate::session::{Session, SessionBody};
use crate::statement::Statement;
use crate::types::{Id, ToParam};

/// Heap body of an [`IdSet`]. Starts with the engine's virtual-table
/// header so the engine can hold its address as the `sqlite3_vtab`
/// instance for the set's table; the address stays stable for the body's
/// whole lifetime.
#[repr(C)]
pub(crate) struct IdSetBody {
    base: ffi::sqlite3_vtab,
    pub(crate) storage: Vec<Id>,
    pub(crate) session: Option<Rc<SessionBody>>,
}

impl IdSetBody {
    /// Binary-search insert preserving strict ascending order. Returns the
    /// position and whether the id was newly added.
    pub(crate) fn insert_id(&mut self, id: Id) -> (usize, bool) {
        match self.storage.binary_search(&id) {
            Ok(pos) => (pos, false),
            Err(pos) => {
                self.storage.insert(pos, id);
                (pos, true)
            }
        }
    }

    /// Remove `id` if present; returns the number of elements removed
    /// (0 or 1).
    pub(crate) fn erase_id(&mut self, id: Id) -> usize {
        match self.storage.binary_search(&id) {
            Ok(pos) => {
                self.storage.remove(pos);
                1
            }
            Err(_) => 0,
        }
    }

    pub(crate) fn contains_id(&self, id: Id) -> bool {
        self.storage.binary_search(&id).is_ok()
    }
}

/// Sorted set of unique 64-bit integer keys that can serve SQL queries.
///
/// While attached to a [`Session`], a virtual table named
/// `idset_<hex-body-address>` exists in the `temp` schema and is backed by
/// this set's storage: SQL can both read and mutate the in-process
/// container, and open cursors stay consistent across such mutations.
pub struct IdSet {
    body: NonNull<IdSetBody>,
}

impl IdSet {
    /// An empty, unattached set.
    #[must_use]
    pub fn new() -> Self {
        let body = Box::new(IdSetBody {
            base: unsafe { std::mem::zeroed() },
            storage: Vec::new(),
            session: None,
        });
        IdSet {
            body: NonNull::from(Box::leak(body)),
        }
    }

    /// An empty set attached to `session`.
    ///
    /// # Errors
    /// As [`IdSet::attach`].
    pub fn attached(session: &Session) -> Result<Self> {
        let mut set = IdSet::new();
        set.attach(session)?;
        Ok(set)
    }

    fn body(&self) -> &IdSetBody {
        unsafe { self.body.as_ref() }
    }

    fn body_mut(&mut self) -> &mut IdSetBody {
        unsafe { self.body.as_mut() }
    }

    /// The set's SQL-visible table name, derived from the stable address
    /// of its heap body.
    #[must_use]
    pub fn sql_name(&self) -> String {
        format!("idset_{:x}", self.body.as_ptr() as usize)
    }

    /// Expose the set to `session` as a virtual table in the `temp`
    /// schema. Re-attaching to the same session is a no-op; attaching to a
    /// different session detaches first.
    ///
    /// # Errors
    /// SQL failures from creating (or dropping) the backing table.
    pub fn attach(&mut self, session: &Session) -> Result<()> {
        let target = session.body();
        if let Some(current) = &self.body().session {
            if Rc::ptr_eq(current, &target) {
                return Ok(());
            }
        }
        if self.body().session.is_some() {
            self.detach()?;
        }
        self.attach_body(target)
    }

    fn attach_body(&mut self, session: Rc<SessionBody>) -> Result<()> {
        self.body_mut().session = Some(Rc::clone(&session));
        if session.is_open() {
            let sql = format!(
                "CREATE VIRTUAL TABLE temp.{} USING {}({})",
                self.sql_name(),
                vtab::MODULE_NAME_STR,
                self.body.as_ptr() as usize,
            );
            session.exec(&sql, &[])?;
        }
        Ok(())
    }

    /// Drop the set's virtual table and forget the session.
    ///
    /// # Errors
    /// SQL failures from dropping the table.
    pub fn detach(&mut self) -> Result<()> {
        let session = self.body().session.clone();
        if let Some(session) = session {
            if session.is_open() {
                let sql = format!("DROP TABLE {}", self.sql_name());
                session.exec(&sql, &[])?;
            }
            self.body_mut().session = None;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.body().session.is_some()
    }

    #[must_use]
    pub fn is_attached_to(&self, session: &Session) -> bool {
        matches!(&self.body().session, Some(s) if Rc::ptr_eq(s, &session.body()))
    }

    fn attached_session(&self, context: &str) -> Result<Rc<SessionBody>> {
        self.body().session.clone().ok_or_else(|| {
            SqlError::InvalidArgument(format!("{context}: set not attached to any database"))
        })
    }

    /// Insert one id. Returns its position and whether it was newly added.
    pub fn insert(&mut self, id: Id) -> (usize, bool) {
        self.body_mut().insert_id(id)
    }

    /// Insert every id from `ids`; returns the number newly added.
    pub fn insert_iter<I: IntoIterator<Item = Id>>(&mut self, ids: I) -> usize {
        let mut added = 0;
        for id in ids {
            if self.body_mut().insert_id(id).1 {
                added += 1;
            }
        }
        added
    }

    /// Merge `other` into this set; returns the number newly added.
    pub fn insert_set(&mut self, other: &IdSet) -> usize {
        if other.is_empty() {
            return 0;
        }
        if self.is_empty() {
            self.body_mut().storage = other.body().storage.clone();
            return self.len();
        }

        let mine = std::mem::take(&mut self.body_mut().storage);
        let theirs = &other.body().storage;
        let mut merged = Vec::with_capacity(mine.len() + theirs.len());
        let mut added = 0;
        let (mut i, mut j) = (0, 0);
        while i < mine.len() && j < theirs.len() {
            match mine[i].cmp(&theirs[j]) {
                std::cmp::Ordering::Less => {
                    merged.push(mine[i]);
                    i += 1;
                }
                std::cmp::Ordering::Equal => {
                    merged.push(mine[i]);
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Greater => {
                    merged.push(theirs[j]);
                    added += 1;
                    j += 1;
                }
            }
        }
        merged.extend_from_slice(&mine[i..]);
        added += theirs.len() - j;
        merged.extend_from_slice(&theirs[j..]);
        self.body_mut().storage = merged;
        added
    }

    /// Insert the values of column `col` of every row `stmt` produces;
    /// returns the number newly added.
    ///
    /// # Errors
    /// Statement iteration or decoding failures.
    pub fn insert_stmt(&mut self, stmt: &Statement, col: usize) -> Result<usize> {
        let mut added = 0;
        let mut row = stmt.begin()?;
        while !row.is_empty() {
            let id: Id = row.get(col)?;
            if self.body_mut().insert_id(id).1 {
                added += 1;
            }
            row.step()?;
        }
        Ok(added)
    }

    /// Run `sql` on the attached session and insert column 0 of the
    /// result; returns the number newly added.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] when detached, otherwise as
    /// [`IdSet::insert_stmt`].
    pub fn insert_sql(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<usize> {
        let session = self.attached_session("IdSet::insert_sql")?;
        let stmt = Statement::prepare_in(&session, sql)?;
        stmt.bind_all(params)?;
        self.insert_stmt(&stmt, 0)
    }

    /// Remove one id; returns the number removed (0 or 1).
    pub fn erase(&mut self, id: Id) -> usize {
        self.body_mut().erase_id(id)
    }

    /// Remove every id in `ids`; returns the number removed.
    pub fn erase_iter<I: IntoIterator<Item = Id>>(&mut self, ids: I) -> usize {
        let mut removed = 0;
        for id in ids {
            removed += self.body_mut().erase_id(id);
        }
        removed
    }

    /// Remove every element also present in `other`; returns the number
    /// removed.
    pub fn erase_set(&mut self, other: &IdSet) -> usize {
        if self.is_empty() || other.is_empty() {
            return 0;
        }
        let before = self.len();
        let theirs = &other.body().storage;
        self.body_mut().storage.retain(|id| theirs.binary_search(id).is_err());
        before - self.len()
    }

    /// Remove the values of column `col` of every row `stmt` produces;
    /// returns the number removed.
    ///
    /// # Errors
    /// Statement iteration or decoding failures.
    pub fn erase_stmt(&mut self, stmt: &Statement, col: usize) -> Result<usize> {
        let mut removed = 0;
        let mut row = stmt.begin()?;
        while !row.is_empty() {
            let id: Id = row.get(col)?;
            removed += self.body_mut().erase_id(id);
            row.step()?;
        }
        Ok(removed)
    }

    /// Run `sql` on the attached session and erase column 0 of the result;
    /// returns the number removed.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] when detached, otherwise as
    /// [`IdSet::erase_stmt`].
    pub fn erase_sql(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<usize> {
        let session = self.attached_session("IdSet::erase_sql")?;
        let stmt = Statement::prepare_in(&session, sql)?;
        stmt.bind_all(params)?;
        self.erase_stmt(&stmt, 0)
    }

    /// Remove every element *not* present in `other`; returns the number
    /// removed.
    pub fn intersect(&mut self, other: &IdSet) -> usize {
        if self.is_empty() {
            return 0;
        }
        if other.is_empty() {
            let removed = self.len();
            self.clear();
            return removed;
        }
        let before = self.len();
        let theirs = &other.body().storage;
        self.body_mut().storage.retain(|id| theirs.binary_search(id).is_ok());
        before - self.len()
    }

    /// Intersect with the ids `ids` yields; returns the number removed.
    pub fn intersect_iter<I: IntoIterator<Item = Id>>(&mut self, ids: I) -> usize {
        let mut tmp = IdSet::new();
        tmp.insert_iter(ids);
        self.intersect(&tmp)
    }

    /// Remove every element not present in the result of `stmt`, whose
    /// column `col` **must be sorted ascending**; returns the number
    /// removed.
    ///
    /// # Errors
    /// Statement iteration or decoding failures.
    pub fn intersect_stmt(&mut self, stmt: &Statement, col: usize) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let storage = std::mem::take(&mut self.body_mut().storage);
        let mut kept = Vec::with_capacity(storage.len());
        let mut i = 0;
        let mut row = stmt.begin()?;
        while !row.is_empty() && i < storage.len() {
            let value: Id = row.get(col)?;
            match value.cmp(&storage[i]) {
                std::cmp::Ordering::Equal => {
                    kept.push(storage[i]);
                    i += 1;
                    row.step()?;
                }
                std::cmp::Ordering::Less => {
                    row.step()?;
                }
                std::cmp::Ordering::Greater => {
                    i += 1;
                }
            }
        }
        let removed = storage.len() - kept.len();
        self.body_mut().storage = kept;
        Ok(removed)
    }

    /// As [`IdSet::intersect_stmt`] over ad-hoc SQL on the attached
    /// session.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] when detached, otherwise as
    /// [`IdSet::intersect_stmt`].
    pub fn intersect_sql(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let session = self.attached_session("IdSet::intersect_sql")?;
        let stmt = Statement::prepare_in(&session, sql)?;
        stmt.bind_all(params)?;
        self.intersect_stmt(&stmt, 0)
    }

    /// Keep elements present in exactly one of the two sets: removes
    /// elements present in both, inserts elements present only in
    /// `other`.
    pub fn symmetric_difference(&mut self, other: &IdSet) {
        if other.is_empty() {
            return;
        }
        let mine = std::mem::take(&mut self.body_mut().storage);
        let theirs = &other.body().storage;
        let mut result = Vec::with_capacity(mine.len() + theirs.len());
        let (mut i, mut j) = (0, 0);
        while i < mine.len() && j < theirs.len() {
            match mine[i].cmp(&theirs[j]) {
                std::cmp::Ordering::Less => {
                    result.push(mine[i]);
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    result.push(theirs[j]);
                    j += 1;
                }
                std::cmp::Ordering::Equal => {
                    i += 1;
                    j += 1;
                }
            }
        }
        result.extend_from_slice(&mine[i..]);
        result.extend_from_slice(&theirs[j..]);
        self.body_mut().storage = result;
    }

    /// Symmetric difference with the ids `ids` yields.
    pub fn symmetric_difference_iter<I: IntoIterator<Item = Id>>(&mut self, ids: I) {
        let mut tmp = IdSet::new();
        tmp.insert_iter(ids);
        self.symmetric_difference(&tmp);
    }

    /// Symmetric difference with the result of `stmt`, whose column `col`
    /// **must be sorted ascending** (duplicate source values are skipped).
    ///
    /// # Errors
    /// Statement iteration or decoding failures.
    pub fn symmetric_difference_stmt(&mut self, stmt: &Statement, col: usize) -> Result<()> {
        let mine = std::mem::take(&mut self.body_mut().storage);
        let mut result = Vec::with_capacity(mine.len());
        let mut i = 0;
        let mut previous: Option<Id> = None;
        let mut row = stmt.begin()?;
        while !row.is_empty() {
            let value: Id = row.get(col)?;
            row.step()?;
            if previous == Some(value) {
                continue;
            }
            previous = Some(value);
            while i < mine.len() && mine[i] < value {
                result.push(mine[i]);
                i += 1;
            }
            if i < mine.len() && mine[i] == value {
                i += 1;
            } else {
                result.push(value);
            }
        }
        result.extend_from_slice(&mine[i..]);
        self.body_mut().storage = result;
        Ok(())
    }

    /// As [`IdSet::symmetric_difference_stmt`] over ad-hoc SQL on the
    /// attached session.
    ///
    /// # Errors
    /// [`SqlError::InvalidArgument`] when detached, otherwise as
    /// [`IdSet::symmetric_difference_stmt`].
    pub fn symmetric_difference_sql(&mut self, sql: &str, params: &[&dyn ToParam]) -> Result<()> {
        let session = self.attached_session("IdSet::symmetric_difference_sql")?;
        let stmt = Statement::prepare_in(&session, sql)?;
        stmt.bind_all(params)?;
        self.symmetric_difference_stmt(&stmt, 0)
    }

    /// Exchange storage and database attachments with `other`. The SQL
    /// names stay with their bodies, so when both sets were attached to
    /// the same session, previously prepared statements referring to
    /// either name remain valid; across different sessions callers must
    /// re-prepare.
    ///
    /// # Errors
    /// SQL failures from the re-attachment round trip.
    pub fn swap(&mut self, other: &mut IdSet) -> Result<()> {
        std::mem::swap(&mut self.body_mut().storage, &mut other.body_mut().storage);

        let mine = self.body().session.clone();
        let theirs = other.body().session.clone();
        let same = match (&mine, &theirs) {
            (Some(a), Some(b)) => Rc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            other.detach()?;
            if let Some(session) = mine {
                other.attach_body(session)?;
            }
            self.detach()?;
            if let Some(session) = theirs {
                self.attach_body(session)?;
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, id: Id) -> bool {
        self.body().contains_id(id)
    }

    /// Position of `id` in the set, if present.
    #[must_use]
    pub fn find(&self, id: Id) -> Option<usize> {
        self.body().storage.binary_search(&id).ok()
    }

    /// Position of the smallest element not less than `id`.
    #[must_use]
    pub fn lower_bound(&self, id: Id) -> usize {
        self.body().storage.partition_point(|&v| v < id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.body().storage.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.body().storage.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.body().storage.capacity()
    }

    pub fn clear(&mut self) {
        self.body_mut().storage.clear();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.body_mut().storage.reserve(additional);
    }

    pub fn shrink_to_fit(&mut self) {
        self.body_mut().storage.shrink_to_fit();
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Id] {
        &self.body().storage
    }

    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, Id>> {
        self.body().storage.iter().copied()
    }
}

impl Default for IdSet {
    fn default() -> Self {
        IdSet::new()
    }
}

impl Drop for IdSet {
    fn drop(&mut self) {
        if let Err(err) = self.detach() {
            tracing::warn!(name = %self.sql_name(), error = %err, "failed to detach ID set");
        }
        unsafe {
            drop(Box::from_raw(self.body.as_ptr()));
        }
    }
}

impl Clone for IdSet {
    /// Clones the storage only; the clone starts unattached.
    fn clone(&self) -> Self {
        let mut copy = IdSet::new();
        copy.body_mut().storage = self.body().storage.clone();
        copy
    }
}

impl FromIterator<Id> for IdSet {
    fn from_iter<I: IntoIterator<Item = Id>>(iter: I) -> Self {
        let mut set = IdSet::new();
        set.insert_iter(iter);
        set
    }
}

impl Extend<Id> for IdSet {
    fn extend<I: IntoIterator<Item = Id>>(&mut self, iter: I) {
        self.insert_iter(iter);
    }
}

impl PartialEq for IdSet {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for IdSet {}

impl PartialOrd for IdSet {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IdSet {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.as_slice().cmp(other.as_slice())
    }
}

impl std::ops::Index<usize> for IdSet {
    type Output = Id;

    fn index(&self, index: usize) -> &Id {
        &self.body().storage[index]
    }
}

impl std::fmt::Debug for IdSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdSet")
            .field("ids", &self.as_slice())
            .field("attached", &self.is_attached())
            .finish()
    }
}
