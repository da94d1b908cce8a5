//! The parent <-> worker message protocol.
//!
//! Messages are JSON objects, one per line, over the worker's
//! stdin/stdout: `{type, id, payload, ts}`. Unknown types are ignored
//! so protocol additions never crash older workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use warden_core::types::Timestamp;

/// Message types in the worker protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Worker finished startup and can accept work.
    Ready,
    /// Parent liveness probe.
    Heartbeat,
    /// Worker's answer to a heartbeat.
    HeartbeatAck,
    /// Parent dispatches code or a task for execution.
    Execute,
    /// Worker's answer to an execute.
    ExecuteResult,
    /// Parent dispatches a typed task (deadline in the payload).
    Task,
    /// Worker's answer to a task.
    Result,
    /// Worker pushes an event to the parent.
    Event,
    /// Parent asks the worker to shut down gracefully.
    Terminate,
    /// Worker acknowledges a terminate and is about to exit.
    Shutdown,
    /// Worker-side failure outside any specific request.
    Error,
    /// Anything this version does not know; ignored on receipt.
    #[serde(other)]
    Unknown,
}

/// One protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    /// The message type.
    #[serde(rename = "type")]
    pub kind: MessageKind,
    /// Correlation id; responses echo the request's id.
    pub id: String,
    /// Message payload.
    #[serde(default)]
    pub payload: Value,
    /// Sender timestamp, unix milliseconds.
    pub ts: i64,
}

impl WorkerMessage {
    /// Build a message stamped now.
    #[must_use]
    pub fn new(kind: MessageKind, id: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            id: id.into(),
            payload,
            ts: Timestamp::now().unix_millis(),
        }
    }

    /// Serialize to one protocol line (newline included).
    #[must_use]
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }

    /// Parse one protocol line. Returns `None` for anything that is
    /// not a protocol message (stray worker prints, partial lines).
    #[must_use]
    pub fn parse_line(line: &str) -> Option<Self> {
        serde_json::from_str(line.trim()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let msg = WorkerMessage::new(
            MessageKind::Execute,
            "req-1",
            serde_json::json!({"code": "print('hi')"}),
        );
        let line = msg.to_line();
        assert!(line.ends_with('\n'));
        let parsed = WorkerMessage::parse_line(&line).unwrap();
        assert_eq!(parsed.kind, MessageKind::Execute);
        assert_eq!(parsed.id, "req-1");
    }

    #[test]
    fn test_wire_names() {
        let msg = WorkerMessage::new(MessageKind::HeartbeatAck, "h-1", Value::Null);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "heartbeat_ack");
    }

    #[test]
    fn test_unknown_type_is_tolerated() {
        let parsed =
            WorkerMessage::parse_line(r#"{"type":"future_thing","id":"x","ts":0}"#).unwrap();
        assert_eq!(parsed.kind, MessageKind::Unknown);
    }

    #[test]
    fn test_garbage_line_is_none() {
        assert!(WorkerMessage::parse_line("worker printed this").is_none());
        assert!(WorkerMessage::parse_line("").is_none());
    }
}
