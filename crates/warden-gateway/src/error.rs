//! Dispatcher error taxonomy.
//!
//! Every failed request is answered with
//! `{type: "error", id, payload: {code, message}}`. Policy, auth,
//! validation, and timeout failures are local: they fail the request,
//! never the session or the process.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Wire error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// Malformed payload or unknown request type.
    #[serde(rename = "VALIDATION_ERROR")]
    Validation,
    /// Missing or invalid credentials.
    #[serde(rename = "AUTH_ERROR")]
    Auth,
    /// Unknown agent or subscription.
    #[serde(rename = "NOT_FOUND")]
    NotFound,
    /// Agent-level failure (bad state, task failure, denial).
    #[serde(rename = "AGENT_ERROR")]
    Agent,
    /// LLM transport failure after retries.
    #[serde(rename = "PROVIDER_ERROR")]
    Provider,
    /// Peer unreachable or peer-side failure.
    #[serde(rename = "CLUSTER_FORWARD_FAILED")]
    ClusterForwardFailed,
    /// Unexpected internal failure; details stay in the log.
    #[serde(rename = "INTERNAL")]
    Internal,
}

impl ErrorCode {
    /// The wire name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Auth => "AUTH_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::Agent => "AGENT_ERROR",
            Self::Provider => "PROVIDER_ERROR",
            Self::ClusterForwardFailed => "CLUSTER_FORWARD_FAILED",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request-level failure carrying its wire code.
#[derive(Debug, Error)]
#[error("{code}: {message}")]
pub struct GatewayError {
    /// The wire error code.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
}

impl GatewayError {
    /// Build an error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// A validation error.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Validation, message)
    }

    /// An auth error.
    #[must_use]
    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Auth, message)
    }

    /// A not-found error.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    /// An agent error.
    #[must_use]
    pub fn agent(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Agent, message)
    }

    /// A provider error.
    #[must_use]
    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Provider, message)
    }

    /// A cluster-forward error.
    #[must_use]
    pub fn cluster(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ClusterForwardFailed, message)
    }

    /// An internal error with a generic wire message.
    #[must_use]
    pub fn internal() -> Self {
        Self::new(ErrorCode::Internal, "internal error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(ErrorCode::Validation.as_str(), "VALIDATION_ERROR");
        assert_eq!(ErrorCode::ClusterForwardFailed.as_str(), "CLUSTER_FORWARD_FAILED");
        let json = serde_json::to_string(&ErrorCode::Auth).unwrap();
        assert_eq!(json, "\"AUTH_ERROR\"");
    }
}
