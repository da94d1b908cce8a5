//! The HTTP surface and the stream endpoint.
//!
//! Routes:
//! - `GET /health`: component checks
//! - `POST /evaluate`: one-shot policy evaluation
//! - `GET /stats`: connection/message/decision counters
//! - `GET /audit`: recent audit entries
//! - `GET /metrics`: Prometheus text format
//! - `GET /ws`: the persistent full-duplex message stream

use std::collections::HashMap;
use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

use warden_audit::{AuditEntry, AuditFilter};
use warden_core::types::Timestamp;
use warden_policy::{FileOperation, Operation};

use crate::handlers::{self, Outbound};
use crate::normalize::normalize_frame;
use crate::protocol::ServerMessage;
use crate::session::Session;
use crate::state::{Gateway, GatewayConfigSummary};

/// Build the router.
pub fn router(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/evaluate", post(evaluate))
        .route("/stats", get(stats))
        .route("/audit", get(audit))
        .route("/metrics", get(metrics))
        .route("/ws", get(ws_upgrade))
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Response {
    // Probe the durable store with a cheap read.
    let db_ok = gateway.store.list_keys("cluster:nodes").await.is_ok();
    let status = if db_ok { "ok" } else { "degraded" };
    let body = json!({
        "status": status,
        "uptime": gateway.started_at.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "checks": {
            "db": if db_ok { "ok" } else { "error" },
            "bus": "ok",
            "store": if db_ok { "ok" } else { "error" },
        },
    });
    let code = if db_ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (code, axum::Json(body)).into_response()
}

async fn evaluate(
    State(gateway): State<Arc<Gateway>>,
    axum::Json(body): axum::Json<Value>,
) -> Response {
    let tool = body.get("tool").and_then(Value::as_str).unwrap_or_default();
    let args = body.get("args").cloned().unwrap_or(Value::Null);
    let agent_id = body
        .get("agentId")
        .and_then(Value::as_str)
        .map(str::to_string);

    let Some(operation) = http_operation(tool, &args, agent_id.clone()) else {
        return (
            StatusCode::BAD_REQUEST,
            axum::Json(json!({"error": format!("unknown tool: {tool}")})),
        )
            .into_response();
    };

    let evaluation = gateway.policy().evaluate(&operation);
    gateway.metrics.incr("decisions_total");
    gateway
        .audit
        .record(
            AuditEntry::success(
                agent_id.as_deref().unwrap_or("http"),
                "policy.evaluate",
                "tool",
                tool,
            )
            .with_details(json!({"decision": evaluation.decision, "reason": evaluation.reason})),
        )
        .await;

    axum::Json(json!({
        "decision": evaluation.decision,
        "reason": evaluation.reason,
        "matchedRule": evaluation.matched_rule_id,
    }))
    .into_response()
}

fn http_operation(tool: &str, args: &Value, agent_id: Option<String>) -> Option<Operation> {
    match tool {
        "shell" | "bash" | "exec" => Some(Operation::Shell {
            command: args.get("command").and_then(Value::as_str)?.to_string(),
            argv: Vec::new(),
            cwd: args.get("cwd").and_then(Value::as_str).map(str::to_string),
            agent_id,
        }),
        "fs.read" | "fs.write" | "fs.list" | "fs.delete" | "fs.create" => Some(Operation::File {
            path: args.get("path").and_then(Value::as_str)?.to_string(),
            operation: match tool {
                "fs.write" => FileOperation::Write,
                "fs.list" => FileOperation::List,
                "fs.delete" => FileOperation::Delete,
                "fs.create" => FileOperation::Create,
                _ => FileOperation::Read,
            },
            agent_id,
        }),
        "http" | "fetch" | "network" => Some(Operation::Network {
            host: args.get("host").and_then(Value::as_str).map(str::to_string),
            port: args
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
            scheme: args.get("scheme").and_then(Value::as_str).map(str::to_string),
            url: args.get("url").and_then(Value::as_str).map(str::to_string),
            agent_id,
        }),
        _ => None,
    }
}

async fn stats(State(gateway): State<Arc<Gateway>>) -> axum::Json<Value> {
    axum::Json(json!({
        "connections": gateway.metrics.gauge("connections"),
        "messages": gateway.metrics.counter("messages_total"),
        "decisions": gateway.metrics.counter("decisions_total"),
        "decisionsBlocked": gateway.metrics.counter("decisions_blocked_total"),
        "errors": gateway.metrics.counter("errors_total"),
        "agents": gateway.agents.len(),
        "sandboxes": gateway.sandboxes.len(),
        "config": GatewayConfigSummary::from(gateway.as_ref()),
    }))
}

async fn audit(
    State(gateway): State<Arc<Gateway>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let limit = params
        .get("limit")
        .and_then(|l| l.parse::<usize>().ok())
        .unwrap_or(50);
    let since = params
        .get("since")
        .and_then(|s| s.parse::<chrono::DateTime<chrono::Utc>>().ok())
        .map(Timestamp::from_datetime);

    match gateway
        .audit
        .query(&AuditFilter {
            since,
            limit: Some(limit),
            ..Default::default()
        })
        .await
    {
        Ok(entries) => axum::Json(json!({"entries": entries})).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            axum::Json(json!({"error": e.to_string()})),
        )
            .into_response(),
    }
}

async fn metrics(State(gateway): State<Arc<Gateway>>) -> Response {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.metrics.render(),
    )
        .into_response()
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(gateway): State<Arc<Gateway>>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, addr.to_string()))
}

/// Drive one client stream: auth gate, FIFO dispatch, event pushes,
/// idle timeout.
async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, remote_addr: String) {
    gateway.metrics.adjust_gauge("connections", 1);
    let (mut ws_sink, mut ws_stream) = socket.split();
    let mut session = Session::new(Some(remote_addr));

    // Outbound channel: responses, stream deltas, and event pushes all
    // funnel through the writer task.
    let (outbound_tx, mut outbound_rx): (Outbound, mpsc::UnboundedReceiver<ServerMessage>) =
        mpsc::unbounded_channel();

    let writer_cancel = session.cancel.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            if ws_sink.send(Message::Text(message.to_json())).await.is_err() {
                // Client is gone; cancel outstanding work.
                writer_cancel.cancel();
                break;
            }
        }
    });

    if !gateway.config.server.anonymous {
        let _ = outbound_tx.send(ServerMessage::auth_required());
    } else {
        session.authenticated = true;
    }

    let idle = std::time::Duration::from_secs(gateway.config.server.idle_timeout_secs.max(1));
    loop {
        let next = tokio::time::timeout(idle, ws_stream.next()).await;
        let message = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(e))) => {
                debug!(client = %session.client_id, error = %e, "stream read error");
                break;
            },
            Ok(None) => break,
            Err(_) => {
                info!(client = %session.client_id, "closing idle connection");
                break;
            },
        };

        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // axum answers pings automatically.
            _ => continue,
        };

        let frame = match normalize_frame(&text) {
            Ok(frame) => frame,
            Err(e) => {
                let _ = outbound_tx.send(ServerMessage::error("", e.code, &e.message));
                continue;
            },
        };

        // The auth gate: before anything else, only `auth` is served.
        if !session.authenticated {
            let response = if frame.msg_type == "auth" {
                let provided = frame
                    .payload
                    .get("token")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let mut accepted = gateway.config.server.auth_tokens.clone();
                if let Some(cluster_token) = &gateway.config.cluster.token {
                    accepted.push(cluster_token.clone());
                }
                if session.authenticate(provided, &accepted) {
                    gateway
                        .audit
                        .record(AuditEntry::success(
                            &session.client_id,
                            "auth.success",
                            "session",
                            &session.client_id,
                        ))
                        .await;
                    ServerMessage::auth_success(&frame.id)
                } else {
                    gateway
                        .audit
                        .record(AuditEntry::failure(
                            &session.client_id,
                            "auth.failed",
                            "session",
                            &session.client_id,
                        ))
                        .await;
                    // No retry path within a connection: answer, then
                    // close. The client reconnects to try again.
                    let _ = outbound_tx.send(ServerMessage::auth_failed(&frame.id));
                    break;
                }
            } else {
                ServerMessage::error(
                    &frame.id,
                    crate::error::ErrorCode::Auth,
                    "authenticate first",
                )
            };
            let _ = outbound_tx.send(response);
            continue;
        }

        // FIFO per client: one frame at a time, in arrival order.
        let response = handlers::handle_frame(&gateway, &mut session, frame, &outbound_tx).await;
        if outbound_tx.send(response).is_err() {
            break;
        }
    }

    // Disconnect: cancel outstanding work, drop subscriptions, then
    // let the writer drain whatever is already queued.
    session.cancel.cancel();
    for subscription in &session.bus_subscriptions {
        gateway.bus.unsubscribe(subscription);
    }
    drop(outbound_tx);
    let _ = tokio::time::timeout(std::time::Duration::from_secs(1), writer).await;
    gateway.metrics.adjust_gauge("connections", -1);
    debug!(client = %session.client_id, "connection closed");
}
