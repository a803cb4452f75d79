//! Mapping from sqlx errors onto the core error taxonomy.

use entity_infra_core::EntityError;

/// SQLSTATEs that mean "another transaction got there first": serialization
/// failure, deadlock, lock not available.
const RETRYABLE_SQLSTATES: &[&str] = &["40001", "40P01", "55P03"];

pub(crate) fn storage_err(err: sqlx::Error) -> EntityError {
    if let sqlx::Error::Database(db) = &err {
        let retryable = db
            .code()
            .is_some_and(|code| RETRYABLE_SQLSTATES.iter().any(|state| code == *state));
        if retryable {
            return EntityError::Conflict(db.message().to_string());
        }
    }
    EntityError::Transaction(anyhow::Error::new(err))
}
