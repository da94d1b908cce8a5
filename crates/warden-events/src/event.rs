//! The event type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::types::{EventId, Timestamp};

/// An event published on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id.
    pub id: EventId,
    /// Dotted channel namespace (`agent.lifecycle`).
    pub channel: String,
    /// Event type within the channel (`agent.created`).
    #[serde(rename = "type")]
    pub event_type: String,
    /// When the event was published.
    pub timestamp: Timestamp,
    /// Acting agent, when relevant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    /// Correlates the event with a request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

impl Event {
    /// Create an event on `channel` with `event_type` and `data`.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        event_type: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: EventId::new(),
            channel: channel.into(),
            event_type: event_type.into(),
            timestamp: Timestamp::now(),
            agent_id: None,
            correlation_id: None,
            data,
        }
    }

    /// Attach the acting agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Attach a correlation id.
    #[must_use]
    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_wire_shape() {
        let event = Event::new("agent.lifecycle", "agent.created", serde_json::json!({"x": 1}))
            .with_agent("agent-1");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["channel"], "agent.lifecycle");
        assert_eq!(json["type"], "agent.created");
        assert_eq!(json["agent_id"], "agent-1");
        assert!(json.get("correlation_id").is_none());
    }
}
