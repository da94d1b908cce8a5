//! Stream protocol tests: auth gate, format normalization, lifecycle
//! round-trips with event delivery, and the shell-to-file cross-check
//! over the wire.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::tungstenite::Message;

use warden_config::Config;
use warden_gateway::{Gateway, GatewayServer};

type WsClient = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

fn test_config(auth_token: Option<&str>, temp: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.server.port = 0;
    config.server.idle_timeout_secs = 30;
    config.audit.file_path = temp.join("audit.log");
    config.database.path = temp.join("state.db");
    config.permissions.signing_secret =
        Some("integration-test-signing-secret-000001".to_string());
    config.worker.terminate_grace_ms = 100;
    match auth_token {
        Some(token) => config.server.auth_tokens = vec![token.to_string()],
        None => config.server.anonymous = true,
    }
    config
}

async fn start_server(config: Config) -> (GatewayServer, Arc<Gateway>) {
    let gateway = Gateway::build(
        config,
        Arc::new(warden_gateway::EchoProvider::new()),
    )
    .await
    .expect("gateway build");
    let server = GatewayServer::start(Arc::clone(&gateway)).await.expect("server start");
    (server, gateway)
}

async fn connect(server: &GatewayServer) -> WsClient {
    let url = format!("ws://{}/ws", server.addr());
    let (client, _) = tokio_tungstenite::connect_async(url).await.expect("connect");
    client
}

async fn send(client: &mut WsClient, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send frame");
}

/// Read messages until one with `msg_type` arrives, collecting any
/// events seen along the way.
async fn read_until(client: &mut WsClient, msg_type: &str, events: &mut Vec<Value>) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(15), client.next())
            .await
            .expect("read timeout")
            .expect("stream closed")
            .expect("read error");
        let Message::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(&text).expect("invalid server json");
        if value["type"] == "event" {
            events.push(value);
            continue;
        }
        if value["type"] == msg_type {
            return value;
        }
    }
}

#[tokio::test]
async fn test_auth_gate() {
    let temp = tempfile::tempdir().unwrap();
    let (server, _gateway) = start_server(test_config(Some("stream-token"), temp.path())).await;
    let mut client = connect(&server).await;
    let mut events = Vec::new();

    // Greeting first.
    let greeting = read_until(&mut client, "auth_required", &mut events).await;
    assert_eq!(greeting["type"], "auth_required");

    // Requests before auth are refused but the connection survives.
    send(&mut client, json!({"type": "agent_status", "id": "q0"})).await;
    let refused = read_until(&mut client, "error", &mut events).await;
    assert_eq!(refused["payload"]["code"], "AUTH_ERROR");

    // Wrong token: the server answers and closes the connection
    // (no in-connection retry).
    send(&mut client, json!({"type": "auth", "id": "a0", "payload": {"token": "nope"}})).await;
    let failed = read_until(&mut client, "auth_failed", &mut events).await;
    assert_eq!(failed["id"], "a0");

    // Reconnect with the right token.
    let mut client = connect(&server).await;
    read_until(&mut client, "auth_required", &mut events).await;
    send(
        &mut client,
        json!({"type": "auth", "id": "a1", "payload": {"token": "stream-token"}}),
    )
    .await;
    let success = read_until(&mut client, "auth_success", &mut events).await;
    assert_eq!(success["id"], "a1");

    // Authenticated requests flow.
    send(&mut client, json!({"type": "agent_status", "id": "q1"})).await;
    let listed = read_until(&mut client, "agent_list", &mut events).await;
    assert_eq!(listed["id"], "q1");

    server.shutdown().await;
}

#[tokio::test]
async fn test_lifecycle_roundtrip_with_events() {
    // Acceptance scenario 3: spawn, observe agent.created, terminate,
    // observe agent.terminated, then status returns NOT_FOUND.
    let temp = tempfile::tempdir().unwrap();
    let (server, _gateway) = start_server(test_config(None, temp.path())).await;
    let mut client = connect(&server).await;
    let mut events = Vec::new();

    send(
        &mut client,
        json!({"type": "subscribe", "id": "sub1", "payload": {"channels": ["agent.lifecycle"]}}),
    )
    .await;
    read_until(&mut client, "subscribe_result", &mut events).await;

    // Spawn in the OpenClaw-style format: inline fields, requestId.
    send(
        &mut client,
        json!({
            "type": "agent_spawn",
            "requestId": "sp1",
            "manifest": {"id": "demo", "name": "Demo", "permissions": ["filesystem.read:/tmp"]},
        }),
    )
    .await;
    let spawned = read_until(&mut client, "agent_spawn_result", &mut events).await;
    assert_eq!(spawned["id"], "sp1");
    assert_eq!(spawned["payload"]["status"], "ready");
    let agent_id = spawned["payload"]["agentId"].as_str().unwrap().to_string();

    send(
        &mut client,
        json!({"type": "agent_terminate", "id": "t1", "payload": {"agentId": agent_id}}),
    )
    .await;
    let terminated = read_until(&mut client, "agent_terminate_result", &mut events).await;
    assert_eq!(terminated["payload"]["success"], true);

    // Status after termination: NOT_FOUND.
    send(
        &mut client,
        json!({"type": "agent_status", "id": "q2", "payload": {"agentId": agent_id}}),
    )
    .await;
    let missing = read_until(&mut client, "error", &mut events).await;
    assert_eq!(missing["payload"]["code"], "NOT_FOUND");

    // Give pushed events a beat to drain, then close and inspect.
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(200), client.next()).await
    {
        if let Ok(value) = serde_json::from_str::<Value>(&text) {
            if value["type"] == "event" {
                events.push(value);
            }
        }
    }
    let types: Vec<&str> = events
        .iter()
        .filter_map(|e| e["payload"]["type"].as_str())
        .collect();
    assert!(types.contains(&"agent.created"), "events: {types:?}");
    assert!(types.contains(&"agent.terminated"), "events: {types:?}");

    server.shutdown().await;
}

#[tokio::test]
async fn test_shell_file_cross_check_over_stream() {
    // Acceptance scenario 1, end to end.
    let temp = tempfile::tempdir().unwrap();
    let (server, gateway) = start_server(test_config(None, temp.path())).await;

    let rules = warden_policy::load_rule_set_str(
        r"
file:
  default: allow
  rules:
    - pattern: '**/.ssh/**'
      decision: block
shell:
  default: allow
  rules:
    - command_pattern: cat
      decision: allow
network:
  default: block
",
        warden_policy::RuleFileFormat::Yaml,
    )
    .unwrap();
    gateway.reload_policy(&rules).unwrap();

    let mut client = connect(&server).await;
    let mut events = Vec::new();

    send(
        &mut client,
        json!({
            "type": "agent_spawn",
            "id": "sp1",
            "payload": {"manifest": {"id": "A", "name": "A", "permissions": ["shell.execute"]}},
        }),
    )
    .await;
    let spawned = read_until(&mut client, "agent_spawn_result", &mut events).await;
    let agent_id = spawned["payload"]["agentId"].as_str().unwrap().to_string();

    send(
        &mut client,
        json!({
            "type": "agent_task",
            "id": "task1",
            "payload": {
                "agentId": agent_id,
                "task": {"type": "tool_call", "tool": "shell", "args": {"command": "cat /home/u/.ssh/id_rsa"}},
            },
        }),
    )
    .await;
    let result = read_until(&mut client, "agent_task_result", &mut events).await;
    assert_eq!(result["id"], "task1");
    assert_eq!(result["payload"]["status"], "error");
    let error = result["payload"]["error"].as_str().unwrap();
    assert!(error.starts_with("Tool denied:"), "got {error}");
    assert!(error.contains(".ssh"));

    // The denial is audited with the reason.
    let denials = gateway
        .audit
        .query(&warden_audit::AuditFilter {
            action: Some("tool.denied".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(denials.len(), 1);
    assert!(denials[0].details["reason"].as_str().unwrap().contains(".ssh"));

    server.shutdown().await;
}

#[tokio::test]
async fn test_jsonrpc_format_accepted() {
    let temp = tempfile::tempdir().unwrap();
    let (server, _gateway) = start_server(test_config(None, temp.path())).await;
    let mut client = connect(&server).await;
    let mut events = Vec::new();

    send(
        &mut client,
        json!({"jsonrpc": "2.0", "method": "agent_status", "params": null, "id": 42}),
    )
    .await;
    let listed = read_until(&mut client, "agent_list", &mut events).await;
    assert_eq!(listed["id"], "42");

    server.shutdown().await;
}

#[tokio::test]
async fn test_chat_over_stream() {
    let temp = tempfile::tempdir().unwrap();
    let (server, _gateway) = start_server(test_config(None, temp.path())).await;
    let mut client = connect(&server).await;
    let mut events = Vec::new();

    send(
        &mut client,
        json!({
            "type": "chat",
            "id": "c1",
            "payload": {"messages": [{"role": "user", "content": "ping"}]},
        }),
    )
    .await;
    let response = read_until(&mut client, "chat_response", &mut events).await;
    assert_eq!(response["id"], "c1");
    assert_eq!(response["payload"]["content"], "echo: ping");

    // Streaming variant: deltas then the end marker.
    send(
        &mut client,
        json!({
            "type": "chat",
            "id": "c2",
            "payload": {"messages": [{"role": "user", "content": "a b c"}], "stream": true},
        }),
    )
    .await;
    let mut deltas = String::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let Message::Text(text) = message else { continue };
        let value: Value = serde_json::from_str(&text).unwrap();
        match value["type"].as_str() {
            Some("chat_stream") => deltas.push_str(value["payload"]["delta"].as_str().unwrap()),
            Some("chat_stream_end") => {
                assert_eq!(value["payload"]["partial"], false);
                assert_eq!(value["payload"]["content"], "echo: a b c");
                break;
            },
            _ => {},
        }
    }
    assert_eq!(deltas, "echo: a b c");

    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frames_get_validation_errors() {
    let temp = tempfile::tempdir().unwrap();
    let (server, _gateway) = start_server(test_config(None, temp.path())).await;
    let mut client = connect(&server).await;
    let mut events = Vec::new();

    send(&mut client, json!({"no": "type"})).await;
    let error = read_until(&mut client, "error", &mut events).await;
    assert_eq!(error["payload"]["code"], "VALIDATION_ERROR");

    // Unknown request type.
    send(&mut client, json!({"type": "time_travel", "id": "x1"})).await;
    let error = read_until(&mut client, "error", &mut events).await;
    assert_eq!(error["id"], "x1");
    assert_eq!(error["payload"]["code"], "VALIDATION_ERROR");

    server.shutdown().await;
}
