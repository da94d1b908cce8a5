//! Audit entry types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::types::Timestamp;

/// The outcome of an audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The operation succeeded.
    Success,
    /// The operation failed or was refused.
    Failure,
}

impl std::fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
        }
    }
}

/// One append-only audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// When the entry was created.
    pub timestamp: Timestamp,
    /// Who performed the operation (agent id, client id, `system`).
    pub actor: String,
    /// What happened, as `verb.noun` (`tool.denied`, `agent.spawn`).
    pub action: String,
    /// The kind of resource acted on (`agent`, `capability`, `tool`).
    pub resource_type: String,
    /// The specific resource.
    pub resource_id: String,
    /// Success or failure.
    pub outcome: AuditOutcome,
    /// Structured detail payload (redacted before sinks see it).
    #[serde(default)]
    pub details: Value,
    /// Client address, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Client user agent, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl AuditEntry {
    /// Start a successful entry.
    #[must_use]
    pub fn success(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::new(actor, action, resource_type, resource_id, AuditOutcome::Success)
    }

    /// Start a failure entry.
    #[must_use]
    pub fn failure(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
    ) -> Self {
        Self::new(actor, action, resource_type, resource_id, AuditOutcome::Failure)
    }

    fn new(
        actor: impl Into<String>,
        action: impl Into<String>,
        resource_type: impl Into<String>,
        resource_id: impl Into<String>,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            timestamp: Timestamp::now(),
            actor: actor.into(),
            action: action.into(),
            resource_type: resource_type.into(),
            resource_id: resource_id.into(),
            outcome,
            details: Value::Null,
            ip: None,
            user_agent: None,
        }
    }

    /// Attach a detail payload.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Attach the client address.
    #[must_use]
    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    /// Attach the client user agent.
    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}
