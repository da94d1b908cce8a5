//! The native message envelope and server message builders.
//!
//! Native frames are `{type, id, payload}`. Inbound frames in other
//! formats are converted by [`crate::normalize`] before they reach the
//! dispatcher, so everything past the boundary is typed.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::ErrorCode;

/// A normalized inbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// The request type (`chat`, `agent_spawn`, ...).
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Client-chosen correlation id.
    pub id: String,
    /// Request payload.
    #[serde(default)]
    pub payload: Value,
    /// Cluster forward hop count; absent on client frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop: Option<u8>,
}

impl Frame {
    /// Build a frame.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            id: id.into(),
            payload,
            hop: None,
        }
    }
}

/// An outbound server message, already shaped for the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    /// The message type.
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Correlation id (request id, or server-generated for events).
    pub id: String,
    /// Message payload.
    #[serde(default)]
    pub payload: Value,
}

impl ServerMessage {
    /// Generic constructor.
    #[must_use]
    pub fn new(msg_type: impl Into<String>, id: impl Into<String>, payload: Value) -> Self {
        Self {
            msg_type: msg_type.into(),
            id: id.into(),
            payload,
        }
    }

    /// `auth_required`, sent on connect.
    #[must_use]
    pub fn auth_required() -> Self {
        Self::new("auth_required", uuid::Uuid::new_v4().to_string(), Value::Null)
    }

    /// `auth_success`.
    #[must_use]
    pub fn auth_success(id: &str) -> Self {
        Self::new("auth_success", id, Value::Null)
    }

    /// `auth_failed`.
    #[must_use]
    pub fn auth_failed(id: &str) -> Self {
        Self::new("auth_failed", id, json!({"message": "invalid credentials"}))
    }

    /// `{type: "error", id, payload: {code, message}}`.
    #[must_use]
    pub fn error(id: &str, code: ErrorCode, message: &str) -> Self {
        Self::new("error", id, json!({"code": code.as_str(), "message": message}))
    }

    /// An `event` push with a server-generated id.
    #[must_use]
    pub fn event(event: &warden_events::Event) -> Self {
        Self::new(
            "event",
            uuid::Uuid::new_v4().to_string(),
            json!({
                "channel": event.channel,
                "type": event.event_type,
                "timestamp": event.timestamp,
                "data": event.data,
                "agentId": event.agent_id,
            }),
        )
    }

    /// Serialize for the wire.
    #[must_use]
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_shape() {
        let msg = ServerMessage::error("req-1", ErrorCode::NotFound, "unknown agent");
        let json: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["id"], "req-1");
        assert_eq!(json["payload"]["code"], "NOT_FOUND");
        assert_eq!(json["payload"]["message"], "unknown agent");
    }

    #[test]
    fn test_event_shape() {
        let event = warden_events::Event::new("agent.lifecycle", "agent.created", json!({"x": 1}))
            .with_agent("a-1");
        let msg = ServerMessage::event(&event);
        assert_eq!(msg.msg_type, "event");
        assert_eq!(msg.payload["channel"], "agent.lifecycle");
        assert_eq!(msg.payload["type"], "agent.created");
        assert_eq!(msg.payload["agentId"], "a-1");
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::new("chat", "1", json!({"messages": []}));
        let text = serde_json::to_string(&frame).unwrap();
        let parsed: Frame = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, frame);
        assert!(!text.contains("hop"));
    }
}
