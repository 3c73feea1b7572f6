//! Store error taxonomy.

use thiserror::Error;

/// Errors surfaced by the durable store.
///
/// These map onto the State/Persistence branch of the core error taxonomy:
/// callers treat every variant here as terminal for the operation that
/// raised it, never silently swallowed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    #[error("invalid status transition on {collection}/{id}: {from} -> {to}")]
    InvalidTransition {
        collection: String,
        id: String,
        from: String,
        to: String,
    },

    #[error("busy: could not acquire write lock within {0:?}")]
    Busy(std::time::Duration),

    #[error("transaction aborted: {0}")]
    TransactionAborted(String),

    #[error("atomic write of {path} failed read-back validation: {reason}")]
    AtomicWriteFailed { path: String, reason: String },
}

impl StoreError {
    /// Errors under this taxonomy are all State/Persistence and therefore
    /// terminal for the calling step; nothing here is retryable by the
    /// executor's own retry policy.
    pub fn recoverable(&self) -> bool {
        false
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
