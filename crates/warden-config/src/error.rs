//! Configuration error types.

use thiserror::Error;

/// Result alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors from loading, secret resolution, and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    ReadError {
        /// The file path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A config file failed to parse.
    #[error("failed to parse config file {path}: {message}")]
    ParseError {
        /// The file path.
        path: String,
        /// Parser error text.
        message: String,
    },

    /// A secret reference could not be resolved.
    #[error("failed to resolve secret `{key}` via {provider}: {message}")]
    SecretResolution {
        /// Provider kind (`env`, `file`, `vault`).
        provider: String,
        /// The secret key.
        key: String,
        /// Failure text.
        message: String,
    },

    /// An environment variable held an unusable value.
    #[error("invalid value for {var}: {message}")]
    InvalidEnvValue {
        /// The variable name.
        var: String,
        /// What was wrong.
        message: String,
    },

    /// The production hardening gate failed.
    #[error("production hardening gate failed: {failures} required check(s) unmet")]
    HardeningFailed {
        /// Number of failed required checks.
        failures: usize,
    },
}
