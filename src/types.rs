//! Parameter binding and column extraction traits.
//!
//! A [`ToParam`] value knows how to write itself into a 1-based parameter
//! slot; a [`FromColumn`] value knows how to read itself out of a result
//! column. Both are open for user types: implement them in terms of the
//! primitive accessors on [`Statement`] and [`Row`].

use chrono::NaiveDateTime;

use crate::error::{Result, SqlError};
use crate::statement::{Row, Statement};

/// Row ID type of the underlying engine.
pub type Id = i64;

/// Storage class of a result column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Null,
    Integer,
    Float,
    Text,
    Blob,
}

/// Marker that binds an SQL NULL.
#[derive(Debug, Clone, Copy, Default)]
pub struct Null;

/// A value that can be bound to a statement parameter.
pub trait ToParam {
    /// Write `self` into parameter slot `index` (1-based).
    ///
    /// # Errors
    /// Propagates binding failures from the statement.
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()>;
}

/// A value that can be decoded from a result column.
pub trait FromColumn: Sized {
    /// Read column `col` (0-based) of the row the statement is positioned
    /// on.
    ///
    /// # Errors
    /// Fails when the row is empty or the cell cannot be represented.
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self>;
}

impl<T: ToParam + ?Sized> ToParam for &T {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        (**self).bind_to(stmt, index)
    }
}

impl ToParam for Null {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_null(index)
    }
}

impl<T: ToParam> ToParam for Option<T> {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        match self {
            Some(value) => value.bind_to(stmt, index),
            None => stmt.bind_null(index),
        }
    }
}

macro_rules! bind_widening_int {
    ($($t:ty),*) => {$(
        impl ToParam for $t {
            fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
                stmt.bind_int64(index, i64::from(*self))
            }
        }
    )*};
}

bind_widening_int!(i8, i16, i32, i64, u8, u16, u32);

impl ToParam for u64 {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        // stored as the reinterpreted signed value; callers wanting the
        // logical unsigned value back must re-interpret
        stmt.bind_int64(index, *self as i64)
    }
}

impl ToParam for usize {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_int64(index, *self as i64)
    }
}

impl ToParam for bool {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_int64(index, i64::from(*self))
    }
}

impl ToParam for f32 {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_double(index, f64::from(*self))
    }
}

impl ToParam for f64 {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_double(index, *self)
    }
}

impl ToParam for str {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_text(index, self)
    }
}

impl ToParam for String {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_text(index, self)
    }
}

impl ToParam for [u8] {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_blob(index, self)
    }
}

impl ToParam for Vec<u8> {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_blob(index, self)
    }
}

impl ToParam for NaiveDateTime {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_text(index, &self.format("%F %T%.f").to_string())
    }
}

impl ToParam for serde_json::Value {
    fn bind_to(&self, stmt: &Statement, index: usize) -> Result<()> {
        stmt.bind_text(index, &self.to_string())
    }
}

macro_rules! column_int {
    ($($t:ty),*) => {$(
        impl FromColumn for $t {
            fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
                let value = row.column_i64(col)?;
                <$t>::try_from(value).map_err(|_| {
                    SqlError::InvalidArgument(format!(
                        "column {col} value {value} out of range for {}",
                        stringify!($t)
                    ))
                })
            }
        }
    )*};
}

column_int!(i8, i16, i32, u8, u16, u32);

impl FromColumn for i64 {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        row.column_i64(col)
    }
}

impl FromColumn for u64 {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        Ok(row.column_i64(col)? as u64)
    }
}

impl FromColumn for bool {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        Ok(row.column_i64(col)? != 0)
    }
}

impl FromColumn for f64 {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        row.column_f64(col)
    }
}

impl FromColumn for f32 {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        Ok(row.column_f64(col)? as f32)
    }
}

impl FromColumn for String {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        Ok(row.column_text(col)?.unwrap_or_default())
    }
}

impl FromColumn for Vec<u8> {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        Ok(row.column_blob(col)?.unwrap_or_default())
    }
}

impl<T: FromColumn> FromColumn for Option<T> {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        if row.is_null(col) {
            Ok(None)
        } else {
            T::from_column(row, col).map(Some)
        }
    }
}

impl FromColumn for std::path::PathBuf {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        String::from_column(row, col).map(Into::into)
    }
}

impl FromColumn for NaiveDateTime {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        let text = String::from_column(row, col)?;
        NaiveDateTime::parse_from_str(&text, "%F %T%.f")
            .map_err(|e| SqlError::InvalidArgument(format!("column {col}: bad timestamp: {e}")))
    }
}

impl FromColumn for serde_json::Value {
    fn from_column(row: &Row<'_>, col: usize) -> Result<Self> {
        let text = String::from_column(row, col)?;
        serde_json::from_str(&text)
            .map_err(|e| SqlError::InvalidArgument(format!("column {col}: bad JSON: {e}")))
    }
}
