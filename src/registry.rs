//! Process-wide interning of SQL text.
//!
//! Registering a statement assigns it a dense integer ID that stays valid
//! for the lifetime of the process and is shared by every [`Session`]. The
//! registry never compiles SQL; syntax errors only surface when a session
//! first materializes the statement.
//!
//! [`Session`]: crate::Session

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::error::{Result, SqlError};

#[derive(Default)]
struct RegistryData {
    by_sql: HashMap<Arc<str>, usize>,
    by_id: Vec<Arc<str>>,
}

fn registry() -> &'static Mutex<RegistryData> {
    static REGISTRY: OnceLock<Mutex<RegistryData>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(RegistryData::default()))
}

/// Register `sql` for precompiled execution and return its statement ID.
///
/// Idempotent: registering byte-identical text again returns the original
/// ID. Safe to call from any thread.
pub fn register_statement(sql: &str) -> usize {
    let mut data = registry().lock();
    if let Some(&id) = data.by_sql.get(sql) {
        return id;
    }
    let id = data.by_id.len();
    let text: Arc<str> = Arc::from(sql);
    data.by_sql.insert(Arc::clone(&text), id);
    data.by_id.push(text);
    id
}

/// Number of statements registered so far in this process.
#[must_use]
pub fn registered_statement_count() -> usize {
    registry().lock().by_id.len()
}

/// Look up the SQL text for a previously registered statement ID.
///
/// # Errors
/// Returns [`SqlError::InvalidArgument`] when `id` was never issued by
/// [`register_statement`].
pub fn registered_statement(id: usize) -> Result<Arc<str>> {
    let data = registry().lock();
    data.by_id
        .get(id)
        .cloned()
        .ok_or_else(|| SqlError::InvalidArgument(format!("statement ID {id} out of bounds")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_is_idempotent() {
        let a = register_statement("SELECT 1 -- registry idempotence");
        let b = register_statement("SELECT 1 -- registry idempotence");
        assert_eq!(a, b);
    }

    #[test]
    fn text_round_trips() {
        let sql = "SELECT 2 -- registry round trip";
        let id = register_statement(sql);
        assert_eq!(&*registered_statement(id).unwrap(), sql);
        assert!(registered_statement_count() > id);
    }

    #[test]
    fn unknown_id_is_rejected() {
        let err = registered_statement(usize::MAX).unwrap_err();
        assert!(matches!(err, SqlError::InvalidArgument(_)));
    }

    #[test]
    fn distinct_text_gets_distinct_ids() {
        let a = register_statement("SELECT 3 -- registry distinct a");
        let b = register_statement("SELECT 3 -- registry distinct b");
        assert_ne!(a, b);
    }
}
