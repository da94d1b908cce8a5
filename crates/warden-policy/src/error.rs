//! Policy error types.

use thiserror::Error;

/// Result alias for policy operations.
pub type PolicyResult<T> = Result<T, PolicyError>;

/// Errors from rule compilation and rule-set loading.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A glob pattern failed to compile.
    #[error("invalid pattern `{pattern}`: {message}")]
    InvalidPattern {
        /// The offending pattern.
        pattern: String,
        /// Compiler error text.
        message: String,
    },

    /// A rule-set file failed to parse.
    #[error("failed to parse rule set: {0}")]
    ParseError(String),

    /// A rule-set file could not be read.
    #[error("failed to read rule set from {path}: {source}")]
    ReadError {
        /// The file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The rule-set file extension is not a supported format.
    #[error("unsupported rule file format: {0}")]
    UnsupportedFormat(String),
}
