//! Storage error types.

use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from the persistence layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backing database could not be opened.
    #[error("failed to open store at {path}: {message}")]
    OpenFailed {
        /// Requested path.
        path: String,
        /// Backend error text.
        message: String,
    },

    /// A read or write against the backend failed.
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A compare-and-set lost the race and retries were exhausted.
    #[error("compare-and-set contention on {namespace}:{key}")]
    CasContention {
        /// Namespace of the contended key.
        namespace: String,
        /// The contended key.
        key: String,
    },
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Backend(e.to_string())
    }
}
