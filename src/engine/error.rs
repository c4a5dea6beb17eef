//! Engine failure taxonomy.
//!
//! The classes drive recovery policy: invalid input fails the submitting
//! command, not-found drops the single object, transient failures are
//! retried by the caller loop, corruption disables the cache but never halts
//! evaluation, and fatal errors abort the affected search state.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("cache corruption: {0}")]
    Corruption(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<sqlx::Error> for EngineError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => EngineError::NotFound,
            sqlx::Error::Database(ref db) if db.message().contains("locked") => {
                EngineError::Transient(e.to_string())
            }
            other => EngineError::Corruption(other.to_string()),
        }
    }
}
