//! Capability error types.

use thiserror::Error;

/// Result alias for capability operations.
pub type CapabilityResult<T> = Result<T, CapabilityError>;

/// Errors from token handling and grant management.
#[derive(Debug, Error)]
pub enum CapabilityError {
    /// The token's MAC does not verify under any accepted secret.
    #[error("invalid token signature")]
    InvalidSignature,

    /// The token has expired.
    #[error("token expired: {token_id}")]
    TokenExpired {
        /// Display form of the expired token id.
        token_id: String,
    },

    /// The token was revoked.
    #[error("token revoked: {token_id}")]
    TokenRevoked {
        /// Display form of the revoked token id.
        token_id: String,
    },

    /// No such token.
    #[error("token not found: {token_id}")]
    TokenNotFound {
        /// Display form of the missing token id.
        token_id: String,
    },

    /// The granter lacks the permissions it is trying to grant.
    #[error("granter not authorized: {reason}")]
    GranterNotAuthorized {
        /// Which requested permission failed the superset check.
        reason: String,
    },

    /// A permission spec string failed to parse.
    #[error("malformed permission spec: {spec}")]
    MalformedSpec {
        /// The offending spec.
        spec: String,
    },

    /// A resource glob failed to compile.
    #[error("invalid resource pattern `{pattern}`: {message}")]
    InvalidResource {
        /// The offending pattern.
        pattern: String,
        /// Compiler error text.
        message: String,
    },

    /// The persistence mirror failed.
    #[error("capability persistence error: {0}")]
    Persistence(String),
}
