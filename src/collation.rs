//! The ALPHANUM collation registered on every open connection.
//!
//! Compares UTF-8 strings code point by code point, skipping any
//! non-alphanumeric code point on either side and folding case before
//! comparing. With both sides equal under that rule, the side with
//! characters left over sorts greater.

use std::cmp::Ordering;
use std::ffi::{c_int, c_void, CStr};
use std::slice;

use libsqlite3_sys as ffi;

pub(crate) const COLLATION_NAME: &CStr = c"ALPHANUM";

pub(crate) unsafe fn register(db: *mut ffi::sqlite3) -> c_int {
    ffi::sqlite3_create_collation_v2(
        db,
        COLLATION_NAME.as_ptr(),
        ffi::SQLITE_UTF8,
        std::ptr::null_mut(),
        Some(collate_alphanum),
        None,
    )
}

unsafe extern "C" fn collate_alphanum(
    _ctx: *mut c_void,
    a_len: c_int,
    a: *const c_void,
    b_len: c_int,
    b: *const c_void,
) -> c_int {
    let a = slice::from_raw_parts(a.cast::<u8>(), a_len as usize);
    let b = slice::from_raw_parts(b.cast::<u8>(), b_len as usize);
    match compare_alphanum(
        &String::from_utf8_lossy(a),
        &String::from_utf8_lossy(b),
    ) {
        Ordering::Less => -1,
        Ordering::Equal => 0,
        Ordering::Greater => 1,
    }
}

fn fold(c: char) -> char {
    c.to_uppercase().next().unwrap_or(c)
}

pub(crate) fn compare_alphanum(a: &str, b: &str) -> Ordering {
    let mut ia = a.chars().peekable();
    let mut ib = b.chars().peekable();

    loop {
        match (ia.peek().copied(), ib.peek().copied()) {
            (Some(ca), Some(cb)) => {
                if !ca.is_alphanumeric() {
                    ia.next();
                    if !cb.is_alphanumeric() {
                        ib.next();
                    }
                } else if !cb.is_alphanumeric() {
                    ib.next();
                } else {
                    let (fa, fb) = (fold(ca), fold(cb));
                    if fa != fb {
                        return (fa as u32).cmp(&(fb as u32));
                    }
                    ia.next();
                    ib.next();
                }
            }
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn case_insensitive() {
        assert_eq!(compare_alphanum("abc", "ABC"), Ordering::Equal);
        assert_eq!(compare_alphanum("abd", "ABC"), Ordering::Greater);
    }

    #[test]
    fn skips_non_alphanumeric() {
        assert_eq!(compare_alphanum("a-b-c", "abc"), Ordering::Equal);
        assert_eq!(compare_alphanum("...", ""), Ordering::Greater);
        assert_eq!(compare_alphanum("a.1", "a#1"), Ordering::Equal);
    }

    #[test]
    fn shorter_side_sorts_less() {
        assert_eq!(compare_alphanum("ab", "abc"), Ordering::Less);
        assert_eq!(compare_alphanum("abc", "ab"), Ordering::Greater);
    }

    #[test]
    fn unicode_folding() {
        assert_eq!(compare_alphanum("été", "ÉTÉ"), Ordering::Equal);
        assert_eq!(compare_alphanum("ärm", "Ärm"), Ordering::Equal);
    }
}
