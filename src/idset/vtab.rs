//! The `sdig_idset` virtual-table module.
//!
//! Serves an [`IdSet`](super::IdSet) body as a one-column table whose `id`
//! column doubles as the rowid. Cursors re-synchronize against the live
//! storage before serving each value, so they stay consistent when the
//! container is mutated between steps.

use std::ffi::{c_char, c_int, c_void, CStr, CString};
use std::sync::OnceLock;

use libsqlite3_sys as ffi;

use super::IdSetBody;
use crate::types::Id;

pub(crate) const MODULE_NAME: &CStr = c"sdig_idset";
pub(crate) const MODULE_NAME_STR: &str = "sdig_idset";

const DECLARE_SQL: &CStr = c"CREATE TABLE idset (id INTEGER PRIMARY KEY)";

struct ModuleHolder(ffi::sqlite3_module);

unsafe impl Send for ModuleHolder {}
unsafe impl Sync for ModuleHolder {}

fn module() -> *const ffi::sqlite3_module {
    static MODULE: OnceLock<ModuleHolder> = OnceLock::new();
    let holder = MODULE.get_or_init(|| {
        let mut m: ffi::sqlite3_module = unsafe { std::mem::zeroed() };
        m.iVersion = 1;
        m.xCreate = Some(x_create);
        m.xConnect = Some(x_create);
        m.xBestIndex = Some(x_best_index);
        m.xDisconnect = Some(x_detach);
        m.xDestroy = Some(x_detach);
        m.xOpen = Some(x_open);
        m.xClose = Some(x_close);
        m.xFilter = Some(x_filter);
        m.xNext = Some(x_next);
        m.xEof = Some(x_eof);
        m.xColumn = Some(x_column);
        m.xRowid = Some(x_rowid);
        m.xUpdate = Some(x_update);
        m.xRename = Some(x_rename);
        ModuleHolder(m)
    });
    &holder.0
}

/// Register the module on a freshly opened connection.
pub(crate) unsafe fn register(db: *mut ffi::sqlite3) -> c_int {
    ffi::sqlite3_create_module_v2(db, MODULE_NAME.as_ptr(), module(), std::ptr::null_mut(), None)
}

unsafe fn set_vtab_error(vtab: *mut ffi::sqlite3_vtab, message: &str) {
    if !(*vtab).zErrMsg.is_null() {
        ffi::sqlite3_free((*vtab).zErrMsg.cast());
    }
    let text = CString::new(message).unwrap_or_default();
    (*vtab).zErrMsg = ffi::sqlite3_mprintf(c"%s".as_ptr(), text.as_ptr());
}

unsafe fn set_create_error(out: *mut *mut c_char, message: &str) {
    let text = CString::new(message).unwrap_or_default();
    *out = ffi::sqlite3_mprintf(c"%s".as_ptr(), text.as_ptr());
}

fn vtab_name(body: *mut IdSetBody) -> String {
    format!("idset_{:x}", body as usize)
}

unsafe extern "C" fn x_create(
    db: *mut ffi::sqlite3,
    _aux: *mut c_void,
    argc: c_int,
    argv: *const *const c_char,
    pp_vtab: *mut *mut ffi::sqlite3_vtab,
    pz_err: *mut *mut c_char,
) -> c_int {
    if argc < 4 {
        set_create_error(pz_err, "sdig_idset: missing ID-set body pointer");
        return ffi::SQLITE_ERROR;
    }

    let arg = CStr::from_ptr(*argv.add(3)).to_string_lossy();
    let address = arg.trim().parse::<usize>().unwrap_or(0);
    if address == 0 {
        set_create_error(pz_err, "sdig_idset: null ID-set body pointer");
        return ffi::SQLITE_ERROR;
    }

    ffi::sqlite3_declare_vtab(db, DECLARE_SQL.as_ptr());
    // allow conflict handling to work
    ffi::sqlite3_vtab_config(db, ffi::SQLITE_VTAB_CONSTRAINT_SUPPORT, 1 as c_int);

    *pp_vtab = address as *mut ffi::sqlite3_vtab;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_detach(vtab: *mut ffi::sqlite3_vtab) -> c_int {
    let body = vtab.cast::<IdSetBody>();
    (*body).session = None;
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_best_index(
    vtab: *mut ffi::sqlite3_vtab,
    info: *mut ffi::sqlite3_index_info,
) -> c_int {
    let info = &mut *info;
    info.idxNum = 0;

    if info.nConstraint > 0 {
        let buf = ffi::sqlite3_malloc(info.nConstraint).cast::<c_char>();
        if buf.is_null() {
            return ffi::SQLITE_NOMEM;
        }
        info.idxStr = buf;
        info.needToFreeIdxStr = 1;
    }

    let mut arg_no = 0usize;
    for i in 0..info.nConstraint as usize {
        let constraint = &*info.aConstraint.add(i);
        let usage = &mut *info.aConstraintUsage.add(i);

        if constraint.usable == 0 {
            usage.argvIndex = 0;
            usage.omit = 1;
            continue;
        }
        if constraint.iColumn != 0 && constraint.iColumn != -1 {
            return ffi::SQLITE_ERROR;
        }

        match c_int::from(constraint.op) {
            ffi::SQLITE_INDEX_CONSTRAINT_EQ
            | ffi::SQLITE_INDEX_CONSTRAINT_GT
            | ffi::SQLITE_INDEX_CONSTRAINT_LE
            | ffi::SQLITE_INDEX_CONSTRAINT_LT
            | ffi::SQLITE_INDEX_CONSTRAINT_GE => {
                // forwarded via the index string; the engine re-checks the
                // constraint itself because omit stays unset
                *info.idxStr.add(arg_no) = constraint.op as c_char;
                arg_no += 1;
                usage.argvIndex = arg_no as c_int;
                usage.omit = 0;
            }
            _ => {
                usage.argvIndex = 0;
                usage.omit = 1;
            }
        }
    }

    // ascending scans come straight out of the sorted storage; descending
    // needs the engine-side sort
    info.orderByConsumed = 1;
    for i in 0..info.nOrderBy as usize {
        let order_by = &*info.aOrderBy.add(i);
        if order_by.iColumn != 0 && order_by.iColumn != -1 {
            return ffi::SQLITE_ERROR;
        }
        if order_by.desc != 0 {
            info.orderByConsumed = 0;
            break;
        }
    }

    ffi::SQLITE_OK
}

#[repr(C)]
struct IdSetCursor {
    base: ffi::sqlite3_vtab_cursor,
    body: *mut IdSetBody,
    pos: usize,
    /// `None` when the cursor is yet to be positioned by `x_filter` or has
    /// reached the end of the result set.
    id: Option<Id>,
}

impl IdSetCursor {
    fn storage(&self) -> &Vec<Id> {
        unsafe { &(*self.body).storage }
    }

    /// Re-synchronize with the live storage before serving a value. When
    /// the element at the recorded position no longer matches the recorded
    /// id, seek the smallest element not less than it; an exact match at
    /// the new position counts as already visited and is skipped. Returns
    /// whether a current row remains.
    fn sync(&mut self) -> bool {
        let Some(id) = self.id else {
            return false;
        };
        let storage = self.storage();
        if storage.get(self.pos) == Some(&id) {
            return true;
        }

        let i = storage.partition_point(|&v| v < id);
        let new_state = if i >= storage.len() {
            None
        } else if storage[i] == id {
            if i + 1 >= storage.len() {
                None
            } else {
                Some((i + 1, storage[i + 1]))
            }
        } else {
            Some((i, storage[i]))
        };
        match new_state {
            None => self.id = None,
            Some((pos, id)) => {
                self.pos = pos;
                self.id = Some(id);
            }
        }
        self.id.is_some()
    }

    fn step_next(&mut self) {
        let Some(original) = self.id else {
            return;
        };
        if self.sync() && self.id == Some(original) {
            self.pos += 1;
            self.id = self.storage().get(self.pos).copied();
        }
    }
}

unsafe extern "C" fn x_open(
    vtab: *mut ffi::sqlite3_vtab,
    pp_cursor: *mut *mut ffi::sqlite3_vtab_cursor,
) -> c_int {
    let cursor = Box::new(IdSetCursor {
        base: std::mem::zeroed(),
        body: vtab.cast::<IdSetBody>(),
        pos: 0,
        id: None,
    });
    *pp_cursor = Box::into_raw(cursor).cast::<ffi::sqlite3_vtab_cursor>();
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_close(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    drop(Box::from_raw(cursor.cast::<IdSetCursor>()));
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_filter(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    _idx_num: c_int,
    _idx_str: *const c_char,
    _argc: c_int,
    _argv: *mut *mut ffi::sqlite3_value,
) -> c_int {
    // constraints forwarded by x_best_index are re-checked by the engine,
    // so the scan always starts from the smallest element
    let cursor = &mut *cursor.cast::<IdSetCursor>();
    cursor.pos = 0;
    cursor.id = cursor.storage().first().copied();
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_next(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    (*cursor.cast::<IdSetCursor>()).step_next();
    ffi::SQLITE_OK
}

unsafe extern "C" fn x_eof(cursor: *mut ffi::sqlite3_vtab_cursor) -> c_int {
    c_int::from((*cursor.cast::<IdSetCursor>()).id.is_none())
}

unsafe extern "C" fn x_column(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    ctx: *mut ffi::sqlite3_context,
    col: c_int,
) -> c_int {
    if col > 0 {
        return ffi::SQLITE_RANGE;
    }
    let cursor = &mut *cursor.cast::<IdSetCursor>();
    cursor.sync();
    match cursor.id {
        Some(id) => {
            ffi::sqlite3_result_int64(ctx, id);
            ffi::SQLITE_OK
        }
        None => ffi::SQLITE_DONE,
    }
}

unsafe extern "C" fn x_rowid(
    cursor: *mut ffi::sqlite3_vtab_cursor,
    rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    let cursor = &mut *cursor.cast::<IdSetCursor>();
    cursor.sync();
    match cursor.id {
        Some(id) => {
            *rowid = id;
            ffi::SQLITE_OK
        }
        None => ffi::SQLITE_DONE,
    }
}

unsafe fn value_i64(value: *mut ffi::sqlite3_value) -> Option<i64> {
    if ffi::sqlite3_value_type(value) == ffi::SQLITE_NULL {
        None
    } else {
        Some(ffi::sqlite3_value_int64(value))
    }
}

unsafe extern "C" fn x_update(
    vtab: *mut ffi::sqlite3_vtab,
    argc: c_int,
    argv: *mut *mut ffi::sqlite3_value,
    out_rowid: *mut ffi::sqlite3_int64,
) -> c_int {
    let body = vtab.cast::<IdSetBody>();
    let name = vtab_name(body);

    let db = match &(*body).session {
        Some(session) => match session.raw_db() {
            Ok(db) => db,
            Err(_) => return ffi::SQLITE_ERROR,
        },
        None => return ffi::SQLITE_ERROR,
    };
    let conflict = ffi::sqlite3_vtab_on_conflict(db);

    let rowid = value_i64(*argv.add(0));

    if argc == 1 {
        // DELETE
        if let Some(rowid) = rowid {
            (*body).erase_id(rowid);
        }
        return ffi::SQLITE_OK;
    }
    if argc < 1 {
        return ffi::SQLITE_OK;
    }

    let Some(rowid) = rowid else {
        // INSERT; argv[1] is an optional explicit rowid, argv[2] the id
        let insert_rowid = value_i64(*argv.add(1));
        let Some(id) = value_i64(*argv.add(2)) else {
            if conflict != ffi::SQLITE_IGNORE {
                set_vtab_error(vtab, &format!("illegal INSERT INTO {name} with id=NULL"));
            }
            return ffi::SQLITE_CONSTRAINT_NOTNULL;
        };

        if let Some(explicit) = insert_rowid {
            if explicit != id {
                set_vtab_error(
                    vtab,
                    &format!(
                        "illegal INSERT INTO {name} with rowid={explicit}, id={id}: \
                         rowid cannot differ from id"
                    ),
                );
                return ffi::SQLITE_CONSTRAINT_VTAB;
            }
        }

        if !(*body).insert_id(id).1 {
            return match conflict {
                ffi::SQLITE_REPLACE => {
                    *out_rowid = id;
                    ffi::SQLITE_OK
                }
                ffi::SQLITE_IGNORE => ffi::SQLITE_CONSTRAINT_UNIQUE,
                _ => {
                    set_vtab_error(
                        vtab,
                        &format!("illegal INSERT INTO {name}: ID {id} not unique"),
                    );
                    ffi::SQLITE_CONSTRAINT_UNIQUE
                }
            };
        }
        *out_rowid = id;
        return ffi::SQLITE_OK;
    };

    if value_i64(*argv.add(1)) == Some(rowid) {
        // UPDATE keeping its rowid
        if argc < 3 {
            return ffi::SQLITE_OK;
        }
        let Some(id) = value_i64(*argv.add(2)) else {
            if conflict != ffi::SQLITE_IGNORE {
                set_vtab_error(
                    vtab,
                    &format!("illegal UPDATE {name} with id=NULL where rowid={rowid}"),
                );
            }
            return ffi::SQLITE_CONSTRAINT_NOTNULL;
        };
        if id == rowid {
            return ffi::SQLITE_OK;
        }
        if (*body).contains_id(id) {
            return match conflict {
                ffi::SQLITE_REPLACE => {
                    (*body).erase_id(rowid);
                    ffi::SQLITE_OK
                }
                ffi::SQLITE_IGNORE => ffi::SQLITE_CONSTRAINT_UNIQUE,
                _ => {
                    set_vtab_error(
                        vtab,
                        &format!("illegal UPDATE {name} on rowid={rowid}: ID {id} not unique"),
                    );
                    ffi::SQLITE_CONSTRAINT_UNIQUE
                }
            };
        }
        (*body).erase_id(rowid);
        (*body).insert_id(id);
        ffi::SQLITE_OK
    } else {
        // UPDATE trying to move the row to a different rowid
        if conflict != ffi::SQLITE_IGNORE {
            let target = value_i64(*argv.add(1)).unwrap_or_default();
            set_vtab_error(
                vtab,
                &format!("illegal UPDATE {name} attempting to modify rowid {rowid} to {target}"),
            );
        }
        ffi::SQLITE_CONSTRAINT_VTAB
    }
}

unsafe extern "C" fn x_rename(vtab: *mut ffi::sqlite3_vtab, new_name: *const c_char) -> c_int {
    let original = vtab_name(vtab.cast::<IdSetBody>());
    let requested = CStr::from_ptr(new_name).to_string_lossy();
    // only self-renames are legal; the table name is derived from the
    // body address and must stay put
    if requested != original {
        set_vtab_error(
            vtab,
            &format!("illegal rename of {original} to \"{requested}\""),
        );
        return ffi::SQLITE_MISUSE;
    }
    ffi::SQLITE_OK
}
