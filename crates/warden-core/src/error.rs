//! Shared error type for foundation operations.

use thiserror::Error;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors produced by foundation types.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An identifier failed to parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// A manifest failed shape validation.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// A lifecycle transition was rejected.
    #[error(transparent)]
    Lifecycle(#[from] crate::lifecycle::LifecycleError),
}
