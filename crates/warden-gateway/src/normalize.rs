//! Inbound format normalization.
//!
//! Three formats are accepted and converted to the native
//! `{type, id, payload}` envelope at the stream boundary:
//!
//! - **Native**: `{type, id, payload}` passes through.
//! - **JSON-RPC 2.0**: `{jsonrpc: "2.0", method, params, id}` maps
//!   method to type and params to payload.
//! - **OpenClaw-style**: `{type, requestId | request_id, ...rest}`
//!   where the remaining fields *are* the payload.

use serde_json::{Map, Value};

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::Frame;

/// Normalize one inbound text frame.
///
/// # Errors
///
/// [`GatewayError`] with `VALIDATION_ERROR` for frames that fit none
/// of the accepted formats.
pub fn normalize_frame(text: &str) -> GatewayResult<Frame> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| GatewayError::validation(format!("malformed JSON: {e}")))?;
    let Value::Object(object) = value else {
        return Err(GatewayError::validation("frame must be a JSON object"));
    };

    // JSON-RPC 2.0.
    if object.get("jsonrpc").and_then(Value::as_str) == Some("2.0") {
        return normalize_jsonrpc(&object);
    }

    let msg_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("frame has no type"))?
        .to_string();

    // Native form: explicit id + payload (or a bare type+id frame).
    if let Some(id) = object.get("id").and_then(Value::as_str) {
        if object.contains_key("payload") || object.len() <= 2 {
            let mut frame = Frame::new(
                msg_type,
                id,
                object.get("payload").cloned().unwrap_or(Value::Null),
            );
            frame.hop = hop_of(&object);
            return Ok(frame);
        }
    }

    // OpenClaw-style: requestId/request_id plus inline fields.
    let id = object
        .get("requestId")
        .or_else(|| object.get("request_id"))
        .or_else(|| object.get("id"))
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("frame has no request id"))?
        .to_string();

    let mut payload = Map::new();
    for (key, value) in &object {
        if matches!(key.as_str(), "type" | "requestId" | "request_id" | "id" | "hop") {
            continue;
        }
        payload.insert(key.clone(), value.clone());
    }
    let mut frame = Frame::new(msg_type, id, Value::Object(payload));
    frame.hop = hop_of(&object);
    Ok(frame)
}

fn normalize_jsonrpc(object: &Map<String, Value>) -> GatewayResult<Frame> {
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("jsonrpc frame has no method"))?;
    let id = match object.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => return Err(GatewayError::validation("jsonrpc frame has no usable id")),
    };
    Ok(Frame::new(
        method,
        id,
        object.get("params").cloned().unwrap_or(Value::Null),
    ))
}

fn hop_of(object: &Map<String, Value>) -> Option<u8> {
    object
        .get("hop")
        .and_then(Value::as_u64)
        .and_then(|h| u8::try_from(h).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_native_passthrough() {
        let frame = normalize_frame(
            r#"{"type":"chat","id":"r1","payload":{"messages":[]}}"#,
        )
        .unwrap();
        assert_eq!(frame.msg_type, "chat");
        assert_eq!(frame.id, "r1");
        assert_eq!(frame.payload, json!({"messages": []}));
    }

    #[test]
    fn test_jsonrpc() {
        let frame = normalize_frame(
            r#"{"jsonrpc":"2.0","method":"agent_status","params":{"agentId":"a"},"id":7}"#,
        )
        .unwrap();
        assert_eq!(frame.msg_type, "agent_status");
        assert_eq!(frame.id, "7");
        assert_eq!(frame.payload["agentId"], "a");
    }

    #[test]
    fn test_openclaw_style() {
        let frame = normalize_frame(
            r#"{"type":"agent_task","requestId":"req-9","agentId":"a","task":{"type":"noop"}}"#,
        )
        .unwrap();
        assert_eq!(frame.msg_type, "agent_task");
        assert_eq!(frame.id, "req-9");
        assert_eq!(frame.payload["agentId"], "a");
        assert_eq!(frame.payload["task"]["type"], "noop");
    }

    #[test]
    fn test_snake_case_request_id() {
        let frame =
            normalize_frame(r#"{"type":"subscribe","request_id":"s1","channels":["agent.*"]}"#)
                .unwrap();
        assert_eq!(frame.id, "s1");
        assert_eq!(frame.payload["channels"][0], "agent.*");
    }

    #[test]
    fn test_hop_is_carried() {
        let frame = normalize_frame(
            r#"{"type":"agent_status","id":"f1","payload":{"agentId":"a"},"hop":1}"#,
        )
        .unwrap();
        assert_eq!(frame.hop, Some(1));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(normalize_frame("not json").is_err());
        assert!(normalize_frame("[1,2,3]").is_err());
        assert!(normalize_frame(r#"{"id":"x"}"#).is_err());
        assert!(normalize_frame(r#"{"type":"chat"}"#).is_err());
        assert!(normalize_frame(r#"{"jsonrpc":"2.0","params":{}}"#).is_err());
    }
}
