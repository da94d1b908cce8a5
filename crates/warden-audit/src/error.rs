//! Audit error types.

use thiserror::Error;

/// Result alias for audit operations.
pub type AuditResult<T> = Result<T, AuditError>;

/// Errors from audit sinks.
#[derive(Debug, Error)]
pub enum AuditError {
    /// The file sink could not be created.
    #[error("failed to open audit file {path}: {source}")]
    OpenFailed {
        /// Requested path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A sink write failed.
    #[error("audit sink `{sink}` write failed: {message}")]
    WriteFailed {
        /// The failing sink's name.
        sink: String,
        /// Failure text.
        message: String,
    },

    /// A query against a sink failed.
    #[error("audit query failed: {0}")]
    QueryFailed(String),

    /// The sink does not support queries.
    #[error("audit sink does not support queries")]
    NotQueryable,
}
