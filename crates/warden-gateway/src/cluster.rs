//! Cluster routing.
//!
//! Dispatcher nodes share a database; every agent is pinned to its
//! owning node there. An operation on a non-local agent is forwarded
//! verbatim over a short-lived peer stream with an incremented hop
//! counter; two hops means the directory is inconsistent and the
//! forward is refused instead of looping.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use warden_core::types::{AgentId, NodeId, Timestamp};
use warden_storage::KvStore;

use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{Frame, ServerMessage};
use crate::state::Gateway;

const NS_NODES: &str = "cluster:nodes";
const NS_AGENT_PINS: &str = "agents";

/// Maximum hops before a forward is declared circular.
const MAX_HOPS: u8 = 2;

/// Peer call budget.
const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// The shared node directory.
pub struct NodeDirectory {
    store: Arc<dyn KvStore>,
}

impl NodeDirectory {
    /// Directory over the shared store.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    /// Register (or refresh) a node's connection URL.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn register(&self, node_id: &NodeId, url: &str) -> GatewayResult<()> {
        let record = json!({"url": url, "last_seen": Timestamp::now()});
        self.store
            .set(
                NS_NODES,
                node_id.as_str(),
                serde_json::to_vec(&record).unwrap_or_default(),
            )
            .await
            .map_err(|e| GatewayError::cluster(e.to_string()))
    }

    /// Look up a node's connection URL.
    pub async fn lookup(&self, node_id: &str) -> Option<String> {
        let bytes = self.store.get(NS_NODES, node_id).await.ok()??;
        let record: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
        record["url"].as_str().map(str::to_string)
    }
}

impl std::fmt::Debug for NodeDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeDirectory").finish_non_exhaustive()
    }
}

/// Pin an agent to this node in the shared directory.
pub async fn pin_agent(gateway: &Arc<Gateway>, agent_id: &AgentId, external_id: &str, state: &str) {
    let record = json!({
        "node_id": gateway.node_id.as_str(),
        "external_id": external_id,
        "state": state,
    });
    if let Err(e) = gateway
        .store
        .set(
            NS_AGENT_PINS,
            &agent_id.wire(),
            serde_json::to_vec(&record).unwrap_or_default(),
        )
        .await
    {
        warn!(agent = %agent_id, error = %e, "failed to pin agent in directory");
    }
}

/// Remove an agent's pin (termination).
pub async fn unpin_agent(gateway: &Arc<Gateway>, agent_id: &AgentId) {
    if let Err(e) = gateway.store.delete(NS_AGENT_PINS, &agent_id.wire()).await {
        warn!(agent = %agent_id, error = %e, "failed to unpin agent");
    }
}

/// The node an agent is pinned to, if any.
pub async fn pinned_node(gateway: &Arc<Gateway>, agent_id: &AgentId) -> Option<String> {
    let bytes = gateway
        .store
        .get(NS_AGENT_PINS, &agent_id.wire())
        .await
        .ok()??;
    let record: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    record["node_id"].as_str().map(str::to_string)
}

/// Forward `frame` to the node that owns its agent and relay the
/// response.
///
/// # Errors
///
/// `CLUSTER_FORWARD_FAILED` for circular forwards, unknown peers,
/// unreachable peers, and peer-side timeouts.
pub async fn forward_frame(
    gateway: &Arc<Gateway>,
    owner: &str,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let hop = frame.hop.unwrap_or(0);
    if hop >= MAX_HOPS {
        return Err(GatewayError::cluster(format!(
            "circular forward detected after {hop} hops"
        )));
    }

    let url = match gateway.directory.lookup(owner).await {
        Some(url) => url,
        None => gateway
            .config
            .cluster
            .peers
            .get(owner)
            .cloned()
            .ok_or_else(|| {
                GatewayError::cluster(format!("no connection url for node {owner}"))
            })?,
    };

    let mut forwarded = frame.clone();
    forwarded.hop = Some(hop.saturating_add(1));
    gateway.metrics.incr("cluster_forwards_total");
    debug!(node = owner, url = %url, id = %frame.id, "forwarding to peer");

    tokio::time::timeout(FORWARD_TIMEOUT, forward_once(gateway, &url, &forwarded))
        .await
        .map_err(|_| GatewayError::cluster(format!("peer {owner} timed out")))?
}

async fn forward_once(
    gateway: &Arc<Gateway>,
    url: &str,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let endpoint = format!("{}/ws", url.trim_end_matches('/'));
    let (mut socket, _) = connect_async(&endpoint)
        .await
        .map_err(|e| GatewayError::cluster(format!("peer unreachable: {e}")))?;

    // The peer greets with auth_required unless anonymous; answer with
    // the cluster token either way.
    if let Some(token) = &gateway.config.cluster.token {
        let auth = Frame::new("auth", uuid::Uuid::new_v4().to_string(), json!({"token": token}));
        socket
            .send(Message::Text(
                serde_json::to_string(&auth).unwrap_or_default(),
            ))
            .await
            .map_err(|e| GatewayError::cluster(format!("peer auth send failed: {e}")))?;
    }

    // Send the forwarded frame and wait for the response bearing its
    // id, skipping greetings, auth acks, and event pushes.
    socket
        .send(Message::Text(
            serde_json::to_string(frame).unwrap_or_default(),
        ))
        .await
        .map_err(|e| GatewayError::cluster(format!("peer send failed: {e}")))?;

    while let Some(message) = socket.next().await {
        let message = message.map_err(|e| GatewayError::cluster(format!("peer read failed: {e}")))?;
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(response) = serde_json::from_str::<ServerMessage>(&text) else {
            continue;
        };
        if response.msg_type == "auth_failed" {
            return Err(GatewayError::cluster("peer refused cluster credentials"));
        }
        if response.id == frame.id {
            let _ = socket.close(None).await;
            return Ok(response);
        }
    }
    Err(GatewayError::cluster("peer closed without responding"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_config::Config;
    use warden_storage::MemoryKvStore;

    #[tokio::test]
    async fn test_directory_roundtrip() {
        let directory = NodeDirectory::new(MemoryKvStore::shared());
        let node = NodeId::new("node-b");
        directory.register(&node, "ws://10.0.0.2:9800").await.unwrap();
        assert_eq!(
            directory.lookup("node-b").await.as_deref(),
            Some("ws://10.0.0.2:9800")
        );
        assert!(directory.lookup("node-z").await.is_none());
    }

    #[tokio::test]
    async fn test_pin_and_unpin() {
        let gateway = Gateway::for_tests(Config::default()).await;
        let agent_id = AgentId::new();
        pin_agent(&gateway, &agent_id, "ext", "ready").await;
        assert_eq!(
            pinned_node(&gateway, &agent_id).await.as_deref(),
            Some("node-1")
        );
        unpin_agent(&gateway, &agent_id).await;
        assert!(pinned_node(&gateway, &agent_id).await.is_none());
    }

    #[tokio::test]
    async fn test_circular_forward_refused() {
        let gateway = Gateway::for_tests(Config::default()).await;
        let mut frame = Frame::new("agent_status", "f-1", json!({"agentId": "x"}));
        frame.hop = Some(2);
        let err = forward_frame(&gateway, "node-b", &frame).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ClusterForwardFailed);
        assert!(err.message.contains("circular"));
    }

    #[tokio::test]
    async fn test_unknown_peer_fails() {
        let gateway = Gateway::for_tests(Config::default()).await;
        let frame = Frame::new("agent_status", "f-2", json!({"agentId": "x"}));
        let err = forward_frame(&gateway, "node-nowhere", &frame).await.unwrap_err();
        assert_eq!(err.code, crate::error::ErrorCode::ClusterForwardFailed);
    }
}
