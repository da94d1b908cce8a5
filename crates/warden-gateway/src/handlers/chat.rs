//! The `chat` request.
//!
//! Rate-limit admission happens before the provider call; the caller
//! waits (FIFO per key) rather than being refused, up to the request
//! deadline. Streaming responses emit `chat_stream` deltas and close
//! with `chat_stream_end`; a deadline expiring mid-stream closes the
//! stream with the partial content and `partial: true`.

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::debug;

use warden_audit::AuditEntry;
use warden_core::retry::RetryConfig;

use crate::error::{GatewayError, GatewayResult};
use crate::handlers::{Outbound, elapsed_ms};
use crate::protocol::{Frame, ServerMessage};
use crate::provider::{ChatRequest, complete_with_retry};
use crate::state::Gateway;

/// Handle one `chat` frame.
pub async fn handle(
    gateway: &Arc<Gateway>,
    client_id: &str,
    frame: &Frame,
    outbound: &Outbound,
) -> GatewayResult<ServerMessage> {
    let request: ChatRequest = serde_json::from_value(frame.payload.clone())
        .map_err(|e| GatewayError::validation(format!("invalid chat payload: {e}")))?;
    if request.messages.is_empty() {
        return Err(GatewayError::validation("chat requires at least one message"));
    }

    // Rate-limit key: the calling agent when given, else the client.
    let key = frame
        .payload
        .get("agentId")
        .and_then(serde_json::Value::as_str)
        .map_or_else(|| client_id.to_string(), str::to_string);
    let estimated = request.estimated_tokens();
    let deadline = std::time::Duration::from_millis(gateway.config.server.request_timeout_ms);

    let started = Instant::now();
    if tokio::time::timeout(deadline, gateway.rate_limiter.acquire(&key, estimated))
        .await
        .is_err()
    {
        gateway
            .audit
            .record(
                AuditEntry::failure(client_id, "chat.request", "chat", &frame.id)
                    .with_details(json!({"reason": "rate limit wait exceeded deadline"})),
            )
            .await;
        return Err(GatewayError::provider("deadline exceeded waiting for rate limit"));
    }

    let remaining = deadline.saturating_sub(started.elapsed());
    let outcome = if request.stream {
        stream_chat(gateway, &key, frame, &request, remaining, outbound).await
    } else {
        complete_chat(gateway, &key, frame, &request, remaining).await
    };

    match outcome {
        Ok(message) => {
            gateway
                .audit
                .record(
                    AuditEntry::success(client_id, "chat.request", "chat", &frame.id)
                        .with_details(json!({
                            "model": request.model,
                            "stream": request.stream,
                            "duration_ms": elapsed_ms(started),
                        })),
                )
                .await;
            gateway.metrics.incr("chat_total");
            Ok(message)
        },
        Err(e) => {
            gateway
                .audit
                .record(
                    AuditEntry::failure(client_id, "chat.request", "chat", &frame.id)
                        .with_details(json!({"reason": e.message})),
                )
                .await;
            Err(e)
        },
    }
}

async fn complete_chat(
    gateway: &Arc<Gateway>,
    key: &str,
    frame: &Frame,
    request: &ChatRequest,
    deadline: std::time::Duration,
) -> GatewayResult<ServerMessage> {
    let retry_config = RetryConfig::default();
    let response = tokio::time::timeout(
        deadline,
        complete_with_retry(gateway.provider.as_ref(), request, &retry_config),
    )
    .await
    .map_err(|_| GatewayError::provider("chat deadline exceeded"))?
    .map_err(|e| GatewayError::provider(e.message))?;

    gateway
        .rate_limiter
        .report_usage(key, request.estimated_tokens(), response.output_tokens)
        .await;

    Ok(ServerMessage::new(
        "chat_response",
        frame.id.clone(),
        json!({
            "content": response.content,
            "model": response.model,
            "usage": {
                "inputTokens": response.input_tokens,
                "outputTokens": response.output_tokens,
            },
        }),
    ))
}

async fn stream_chat(
    gateway: &Arc<Gateway>,
    key: &str,
    frame: &Frame,
    request: &ChatRequest,
    deadline: std::time::Duration,
    outbound: &Outbound,
) -> GatewayResult<ServerMessage> {
    let mut rx = gateway
        .provider
        .stream(request)
        .await
        .map_err(|e| GatewayError::provider(e.message))?;

    let started = Instant::now();
    let mut content = String::new();
    let mut partial = false;

    loop {
        let remaining = deadline.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            partial = true;
            break;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Ok(Some(delta)) => {
                content.push_str(&delta);
                let _ = outbound.send(ServerMessage::new(
                    "chat_stream",
                    frame.id.clone(),
                    json!({"delta": delta}),
                ));
            },
            Ok(None) => break,
            Err(_) => {
                // Deadline mid-stream: keep what arrived.
                debug!(id = %frame.id, "chat stream deadline; returning partial content");
                partial = true;
                break;
            },
        }
    }

    let output_tokens = u64::try_from(content.len().div_euclid(4).max(1)).unwrap_or(1);
    gateway
        .rate_limiter
        .report_usage(key, request.estimated_tokens(), output_tokens)
        .await;

    Ok(ServerMessage::new(
        "chat_stream_end",
        frame.id.clone(),
        json!({"content": content, "partial": partial}),
    ))
}
