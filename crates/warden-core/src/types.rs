//! Identifier newtypes and common value types.
//!
//! Every identifier in the control plane is a UUID behind a distinct
//! newtype so that an agent id can never be passed where a token id is
//! expected. Display forms carry a short prefix for log readability.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($(#[$doc:meta])* $name:ident, $prefix:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Create a new random identifier.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from the canonical hyphenated form.
            ///
            /// # Errors
            ///
            /// Returns the underlying [`uuid::Error`] if the string is not
            /// a valid UUID.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!($prefix, ":{}"), self.0)
            }
        }
    };
}

uuid_id!(
    /// Stable identifier for a managed agent.
    AgentId,
    "agent"
);

uuid_id!(
    /// Identifier for a capability token.
    TokenId,
    "cap"
);

uuid_id!(
    /// Identifier for a published event.
    EventId,
    "evt"
);

uuid_id!(
    /// Identifier for an event bus subscription.
    SubscriptionId,
    "sub"
);

impl AgentId {
    /// The bare UUID without the display prefix, as sent on the wire.
    #[must_use]
    pub fn wire(&self) -> String {
        self.0.to_string()
    }
}

/// Identifier for a dispatcher node in a cluster.
///
/// Unlike the UUID ids this is an operator-chosen string (hostname,
/// deployment slot) so it survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Wrap a node name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The node name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Client-chosen request correlation id.
///
/// Opaque to the dispatcher; echoed back on exactly one response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub String);

impl RequestId {
    /// Wrap a client-supplied id.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a server-side id (used for pushed events).
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The raw id string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A UTC timestamp with serde support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub DateTime<Utc>);

impl Timestamp {
    /// The current time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Wrap an existing datetime.
    #[must_use]
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Milliseconds since the Unix epoch.
    #[must_use]
    pub fn unix_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Coarse trust categorization for an agent.
///
/// Shapes default limits and auditing verbosity; it is not a substitute
/// for policy or capability checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TrustLevel {
    /// Operator-trusted; relaxed default limits.
    Trusted,
    /// Autonomous but monitored; every operation is audited.
    #[default]
    MonitoredAutonomous,
    /// Untrusted third-party code; tightest limits, verbose audit.
    Untrusted,
}

impl std::fmt::Display for TrustLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Trusted => write!(f, "trusted"),
            Self::MonitoredAutonomous => write!(f, "monitored-autonomous"),
            Self::Untrusted => write!(f, "untrusted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_prefix() {
        let id = AgentId::new();
        assert!(id.to_string().starts_with("agent:"));
        assert!(TokenId::new().to_string().starts_with("cap:"));
    }

    #[test]
    fn test_id_parse_roundtrip() {
        let id = AgentId::new();
        let parsed = AgentId::parse(&id.wire()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_ids_are_distinct_types() {
        // Serde is transparent: ids serialize as bare UUID strings.
        let id = AgentId::new();
        let json = serde_json::to_string(&id).unwrap();
        assert!(!json.contains("agent:"));
    }

    #[test]
    fn test_trust_level_serde() {
        let json = serde_json::to_string(&TrustLevel::MonitoredAutonomous).unwrap();
        assert_eq!(json, "\"monitored-autonomous\"");
    }

    #[test]
    fn test_timestamp_ordering() {
        let a = Timestamp::now();
        let b = Timestamp::now();
        assert!(a <= b);
    }
}
