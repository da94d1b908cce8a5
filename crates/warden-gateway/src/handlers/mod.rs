//! Request dispatch.
//!
//! One inbound frame produces exactly one response with the same id
//! (plus any `chat_stream`/`event` pushes through the outbound
//! channel), and exactly one audit entry. Handler panics are caught at
//! the task boundary and surfaced as `INTERNAL`.

pub mod agents;
pub mod chat;
pub mod tasks;

use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::error;

use warden_audit::AuditEntry;
use warden_events::SubscribeOptions;

use crate::error::{ErrorCode, GatewayError, GatewayResult};
use crate::protocol::{Frame, ServerMessage};
use crate::session::Session;
use crate::state::Gateway;

/// Outbound push channel for one connection.
pub type Outbound = mpsc::UnboundedSender<ServerMessage>;

/// Handle one authenticated frame.
pub async fn handle_frame(
    gateway: &Arc<Gateway>,
    session: &mut Session,
    frame: Frame,
    outbound: &Outbound,
) -> ServerMessage {
    gateway.metrics.incr("messages_total");
    let started = Instant::now();
    let id = frame.id.clone();

    let result = match frame.msg_type.as_str() {
        // Subscribe mutates session state; handled inline.
        "subscribe" => subscribe(gateway, session, &frame, outbound).await,
        _ => {
            let gateway_task = Arc::clone(gateway);
            let outbound_task = outbound.clone();
            let client_id = session.client_id.clone();
            let remote_addr = session.remote_addr.clone();
            let cancel = session.cancel.clone();
            let mut handle = tokio::spawn(async move {
                dispatch(&gateway_task, &client_id, remote_addr, frame, &outbound_task).await
            });
            tokio::select! {
                () = cancel.cancelled() => {
                    handle.abort();
                    Err(GatewayError::internal())
                },
                joined = &mut handle => match joined {
                    Ok(result) => result,
                    Err(join_error) => {
                        // A panic in a handler fails the request, never
                        // the dispatcher.
                        error!(error = %join_error, "request handler panicked");
                        gateway.metrics.incr("handler_panics_total");
                        gateway
                            .audit
                            .record(
                                AuditEntry::failure(&session.client_id, "request.panic", "request", &id)
                                    .with_details(json!({"reason": join_error.to_string()})),
                            )
                            .await;
                        Err(GatewayError::internal())
                    },
                },
            }
        },
    };

    gateway
        .metrics
        .observe_ms("request_duration_ms", elapsed_ms(started));
    match result {
        Ok(message) => message,
        Err(e) => {
            gateway.metrics.incr("errors_total");
            ServerMessage::error(&id, e.code, &e.message)
        },
    }
}

async fn dispatch(
    gateway: &Arc<Gateway>,
    client_id: &str,
    remote_addr: Option<String>,
    frame: Frame,
    outbound: &Outbound,
) -> GatewayResult<ServerMessage> {
    match frame.msg_type.as_str() {
        "chat" => chat::handle(gateway, client_id, &frame, outbound).await,
        "agent_spawn" => agents::spawn(gateway, client_id, remote_addr, &frame).await,
        "agent_terminate" => agents::terminate(gateway, client_id, &frame).await,
        "agent_status" => agents::status(gateway, client_id, &frame).await,
        "agent_task" => tasks::handle(gateway, client_id, &frame).await,
        other => {
            gateway
                .audit
                .record(
                    AuditEntry::failure(client_id, "request.rejected", "request", &frame.id)
                        .with_details(json!({"reason": format!("unknown type {other}")})),
                )
                .await;
            Err(GatewayError::validation(format!("unknown request type: {other}")))
        },
    }
}

/// Handle `subscribe`: append patterns to the session and register bus
/// forwarding. Idempotent per pattern.
async fn subscribe(
    gateway: &Arc<Gateway>,
    session: &mut Session,
    frame: &Frame,
    outbound: &Outbound,
) -> GatewayResult<ServerMessage> {
    let channels: Vec<String> = frame
        .payload
        .get("channels")
        .and_then(|c| serde_json::from_value(c.clone()).ok())
        .ok_or_else(|| GatewayError::validation("subscribe requires payload.channels"))?;

    for channel in &channels {
        if session.channels.contains(channel) {
            continue;
        }
        session.channels.push(channel.clone());
        let tx = outbound.clone();
        let subscription_id = gateway.bus.subscribe(
            channel.clone(),
            Arc::new(move |event: &warden_events::Event| {
                let _ = tx.send(ServerMessage::event(event));
            }),
            SubscribeOptions::default(),
        );
        session.bus_subscriptions.push(subscription_id);
    }

    gateway
        .audit
        .record(
            AuditEntry::success(&session.client_id, "stream.subscribe", "subscription", &frame.id)
                .with_details(json!({"channels": channels})),
        )
        .await;
    Ok(ServerMessage::new(
        "subscribe_result",
        frame.id.clone(),
        json!({"channels": session.channels}),
    ))
}

pub(crate) fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Map a [`GatewayError`] code for tests.
#[must_use]
pub fn error_code_of(message: &ServerMessage) -> Option<ErrorCode> {
    if message.msg_type != "error" {
        return None;
    }
    serde_json::from_value(message.payload.get("code")?.clone()).ok()
}
