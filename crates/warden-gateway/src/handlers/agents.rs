//! Agent lifecycle requests: `agent_spawn`, `agent_terminate`,
//! `agent_status`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use warden_audit::AuditEntry;
use warden_capabilities::{GrantRequest, Granter, Permission};
use warden_core::agent::{AgentEntry, AgentLimits};
use warden_core::lifecycle::{AgentState, LifecycleEvent};
use warden_core::manifest::AgentManifest;
use warden_core::types::AgentId;
use warden_events::Event;
use warden_sandbox::{ContainerNetwork, ContainerSpec, LaunchMode, SandboxConfig};

use crate::cluster;
use crate::error::{GatewayError, GatewayResult};
use crate::protocol::{Frame, ServerMessage};
use crate::state::Gateway;

/// Sign a manifest: keyed BLAKE3 over `id` and `name`, hex encoded.
/// Deployment tooling calls this when publishing manifests.
#[must_use]
pub fn sign_manifest(manifest: &AgentManifest, secret: &str) -> String {
    let key = blake3::derive_key("warden manifest signature v1", secret.as_bytes());
    let mut data = Vec::new();
    data.extend_from_slice(manifest.id.as_bytes());
    data.push(0);
    data.extend_from_slice(manifest.name.as_bytes());
    hex::encode(blake3::keyed_hash(&key, &data).as_bytes())
}

fn verify_manifest_signature(manifest: &AgentManifest, secret: &str) -> bool {
    let Some(signature) = &manifest.signature else {
        return false;
    };
    let expected = sign_manifest(manifest, secret);
    expected.as_bytes().ct_eq(signature.as_bytes()).into()
}

/// Handle `agent_spawn`.
#[allow(clippy::too_many_lines)]
pub async fn spawn(
    gateway: &Arc<Gateway>,
    client_id: &str,
    remote_addr: Option<String>,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let manifest: AgentManifest = frame
        .payload
        .get("manifest")
        .cloned()
        .ok_or_else(|| GatewayError::validation("agent_spawn requires payload.manifest"))
        .and_then(|m| {
            serde_json::from_value(m)
                .map_err(|e| GatewayError::validation(format!("invalid manifest: {e}")))
        })?;
    manifest
        .validate()
        .map_err(GatewayError::validation)?;

    // Production requires signed manifests.
    if gateway.config.hardening_enforced() {
        let secret = gateway
            .config
            .permissions
            .signing_secret
            .as_deref()
            .unwrap_or_default();
        if !verify_manifest_signature(&manifest, secret) {
            audit_spawn_failure(gateway, client_id, &frame.id, "manifest signature invalid").await;
            return Err(GatewayError::auth("manifest signature missing or invalid"));
        }
    }

    // One live agent per external id.
    if let Some(existing) = gateway.agents.find_by_external_id(&manifest.id).await {
        if !existing.lifecycle.state().is_terminal() {
            audit_spawn_failure(gateway, client_id, &frame.id, "duplicate external id").await;
            return Err(GatewayError::agent(format!(
                "agent with external id `{}` already exists",
                manifest.id
            )));
        }
    }

    // Parse requested permissions before creating anything.
    let mut permissions = Vec::with_capacity(manifest.permissions.len());
    for spec in &manifest.permissions {
        permissions.push(
            Permission::parse_spec(spec)
                .map_err(|e| GatewayError::validation(e.to_string()))?,
        );
    }

    let mut entry = AgentEntry::new(
        manifest.id.clone(),
        manifest.name.clone(),
        gateway.node_id.clone(),
    );
    entry.model.clone_from(&manifest.model);
    entry.entry_point.clone_from(&manifest.entry_point);
    entry.capabilities.clone_from(&manifest.capabilities);
    entry.mcp_servers.clone_from(&manifest.mcp_servers);
    entry.tools.clone_from(&manifest.tools);
    entry.permission_grants.clone_from(&manifest.permissions);
    if let Some(trust) = manifest.trust_level {
        entry.trust_level = trust;
    }
    entry.limits = merged_limits(gateway, manifest.limits.as_ref());
    let agent_id = entry.id.clone();

    // Grant the manifest permissions as one token.
    if !permissions.is_empty() {
        let token = gateway
            .capabilities
            .grant(
                GrantRequest {
                    agent_id: agent_id.clone(),
                    permissions,
                    duration_ms: gateway.config.permissions.token_duration_ms,
                    purpose: Some(format!("manifest grant for {}", manifest.id)),
                    delegatable: false,
                },
                &Granter::System,
            )
            .await
            .map_err(|e| GatewayError::agent(format!("grant failed: {e}")))?;
        entry.permission_token_id = Some(token.id);
    }

    gateway.agents.insert(entry);
    gateway.bus.publish(
        Event::new(
            warden_runtime::agents::LIFECYCLE_CHANNEL,
            "agent.created",
            json!({"externalId": manifest.id, "name": manifest.name}),
        )
        .with_agent(agent_id.wire()),
    );
    gateway
        .agents
        .transition(&agent_id, LifecycleEvent::Initialize, Some("spawn request".into()))
        .await
        .map_err(|e| GatewayError::agent(e.to_string()))?;

    // Start a sandbox when the agent brings its own worker.
    if let Some(entry_point) = &manifest.entry_point {
        let config = sandbox_config(gateway, &agent_id, entry_point.clone());
        if let Err(e) = gateway.sandboxes.create(config).await {
            warn!(agent = %agent_id, error = %e, "worker spawn failed");
            let _ = gateway
                .agents
                .transition(&agent_id, LifecycleEvent::Fail, Some(e.to_string()))
                .await;
            audit_spawn_failure(gateway, client_id, &frame.id, &e.to_string()).await;
            return Err(GatewayError::agent(format!("worker spawn failed: {e}")));
        }
        gateway
            .agents
            .update(&agent_id, |agent| agent.worker_ready = true)
            .await
            .map_err(|e| GatewayError::agent(e.to_string()))?;
    }

    gateway
        .agents
        .transition(&agent_id, LifecycleEvent::Ready, None)
        .await
        .map_err(|e| GatewayError::agent(e.to_string()))?;

    cluster::pin_agent(gateway, &agent_id, &manifest.id, "ready").await;

    let mut audit_entry = AuditEntry::success(client_id, "agent.spawn", "agent", agent_id.wire())
        .with_details(json!({
            "externalId": manifest.id,
            "name": manifest.name,
            "permissions": manifest.permissions,
        }));
    if let Some(addr) = remote_addr {
        audit_entry = audit_entry.with_ip(addr);
    }
    gateway.audit.record(audit_entry).await;
    gateway.metrics.incr("agents_spawned_total");
    info!(agent = %agent_id, external_id = %manifest.id, "agent spawned");

    Ok(ServerMessage::new(
        "agent_spawn_result",
        frame.id.clone(),
        json!({
            "agentId": agent_id.wire(),
            "externalId": manifest.id,
            "status": "ready",
        }),
    ))
}

async fn audit_spawn_failure(gateway: &Arc<Gateway>, client_id: &str, id: &str, reason: &str) {
    gateway
        .audit
        .record(
            AuditEntry::failure(client_id, "agent.spawn", "agent", id)
                .with_details(json!({"reason": reason})),
        )
        .await;
}

fn merged_limits(gateway: &Arc<Gateway>, overrides: Option<&warden_core::manifest::ManifestLimits>) -> AgentLimits {
    let config = &gateway.config;
    let mut limits = AgentLimits {
        memory_mb: config.worker.memory_mb,
        task_timeout_ms: config.worker.task_timeout_ms,
        max_errors: config.limits.max_agent_errors,
        max_restarts: config.limits.max_agent_restarts,
        requests_per_minute: config.limits.requests_per_minute,
        tokens_per_minute: u32::try_from(config.limits.tokens_per_minute).unwrap_or(u32::MAX),
        max_cost_usd: None,
    };
    if let Some(overrides) = overrides {
        if let Some(memory) = overrides.memory_mb {
            limits.memory_mb = memory;
        }
        if let Some(timeout) = overrides.task_timeout_ms {
            // Caller-supplied deadlines stay under the ceiling.
            limits.task_timeout_ms = timeout.min(config.worker.max_task_timeout_ms);
        }
        if let Some(errors) = overrides.max_errors {
            limits.max_errors = errors;
        }
        if let Some(restarts) = overrides.max_restarts {
            limits.max_restarts = restarts;
        }
        if let Some(rpm) = overrides.requests_per_minute {
            limits.requests_per_minute = rpm;
        }
        if let Some(tpm) = overrides.tokens_per_minute {
            limits.tokens_per_minute = tpm;
        }
        limits.max_cost_usd = overrides.max_cost_usd;
    }
    limits
}

pub(crate) fn sandbox_config(
    gateway: &Arc<Gateway>,
    agent_id: &AgentId,
    entry_point: Vec<String>,
) -> SandboxConfig {
    let worker = &gateway.config.worker;
    let launch = if worker.runtime == "docker" {
        let docker = &worker.docker;
        let network = if worker.disable_network || docker.network == "none" {
            ContainerNetwork::Disabled
        } else if let Some(proxy) = &worker.egress_proxy_url {
            ContainerNetwork::EgressProxy(proxy.clone())
        } else {
            ContainerNetwork::Default
        };
        LaunchMode::Container(ContainerSpec {
            image: worker.image.clone(),
            readonly_rootfs: docker.readonly_rootfs,
            drop_all_caps: docker.cap_drop_all,
            no_new_privileges: docker.no_new_privileges,
            seccomp_profile: docker.seccomp_profile.clone(),
            apparmor_profile: docker.apparmor_profile.clone(),
            pids_limit: docker.pids_limit,
            ulimits: docker.ulimits.clone(),
            storage_opt: docker.storage_opts.clone(),
            tmpfs: docker.tmpfs.clone(),
            network,
            memory_mb: worker.memory_mb,
        })
    } else {
        LaunchMode::Local
    };

    SandboxConfig {
        agent_id: agent_id.clone(),
        entry_point,
        capabilities: Vec::new(),
        memory_mb: worker.memory_mb,
        stack_kb: worker.stack_kb,
        startup_timeout: Duration::from_millis(worker.startup_timeout_ms),
        heartbeat_interval: Duration::from_millis(worker.heartbeat_interval_ms),
        max_missed_heartbeats: 3,
        terminate_grace: Duration::from_millis(worker.terminate_grace_ms),
        temp_root: std::env::temp_dir(),
        launch,
    }
}

/// Handle `agent_terminate`.
pub async fn terminate(
    gateway: &Arc<Gateway>,
    client_id: &str,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let agent_id = agent_id_of(&frame.payload)?;
    let Some(snapshot) = gateway.agents.snapshot(&agent_id).await else {
        return Err(GatewayError::not_found(format!("unknown agent {}", agent_id.wire())));
    };

    // Terminal, paused, and error states refuse termination requests.
    let state = snapshot.lifecycle.state();
    if matches!(state, AgentState::Terminated | AgentState::Paused | AgentState::Error) {
        gateway
            .audit
            .record(
                AuditEntry::failure(client_id, "agent.terminate", "agent", agent_id.wire())
                    .with_details(json!({"reason": format!("agent in state {state}")})),
            )
            .await;
        return Err(GatewayError::agent(format!("cannot terminate agent in state {state}")));
    }

    gateway
        .agents
        .transition(&agent_id, LifecycleEvent::Terminate, Some("terminate request".into()))
        .await
        .map_err(|e| GatewayError::agent(e.to_string()))?;

    // Shut down the worker (sends the shutdown IPC, escalates).
    match gateway.sandboxes.terminate(&agent_id).await {
        Ok(()) | Err(warden_sandbox::SandboxError::NotFound { .. }) => {},
        Err(e) => warn!(agent = %agent_id, error = %e, "sandbox terminate failed"),
    }

    let revoked = gateway
        .capabilities
        .revoke_all(&agent_id)
        .await
        .unwrap_or_else(|e| {
            warn!(agent = %agent_id, error = %e, "capability revocation failed");
            0
        });

    gateway.agents.remove(&agent_id);
    cluster::unpin_agent(gateway, &agent_id).await;

    gateway
        .audit
        .record(
            AuditEntry::success(client_id, "agent.terminate", "agent", agent_id.wire())
                .with_details(json!({"revokedTokens": revoked})),
        )
        .await;
    gateway.metrics.incr("agents_terminated_total");

    Ok(ServerMessage::new(
        "agent_terminate_result",
        frame.id.clone(),
        json!({"agentId": agent_id.wire(), "success": true}),
    ))
}

/// Handle `agent_status`.
pub async fn status(
    gateway: &Arc<Gateway>,
    client_id: &str,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let requested = frame.payload.get("agentId").and_then(Value::as_str);

    let Some(raw_id) = requested else {
        // No id: list every local agent.
        let entries = gateway.agents.snapshot_all().await;
        let agents: Vec<Value> = entries.iter().map(entry_summary).collect();
        gateway
            .audit
            .record(AuditEntry::success(client_id, "agent.status", "agent", "all"))
            .await;
        return Ok(ServerMessage::new(
            "agent_list",
            frame.id.clone(),
            json!({"agents": agents}),
        ));
    };

    let agent_id = AgentId::parse(raw_id)
        .map_err(|_| GatewayError::validation(format!("invalid agent id: {raw_id}")))?;

    if let Some(entry) = gateway.agents.snapshot(&agent_id).await {
        gateway
            .audit
            .record(AuditEntry::success(client_id, "agent.status", "agent", agent_id.wire()))
            .await;
        return Ok(ServerMessage::new(
            "agent_status",
            frame.id.clone(),
            entry_summary(&entry),
        ));
    }

    // Not local: consult the shared directory and forward to the
    // owning node.
    if let Some(owner) = cluster::pinned_node(gateway, &agent_id).await {
        if owner != gateway.node_id.as_str() {
            let response = cluster::forward_frame(gateway, &owner, frame).await?;
            gateway
                .audit
                .record(
                    AuditEntry::success(client_id, "agent.status", "agent", agent_id.wire())
                        .with_details(json!({"forwardedTo": owner})),
                )
                .await;
            return Ok(response);
        }
    }

    gateway
        .audit
        .record(
            AuditEntry::failure(client_id, "agent.status", "agent", agent_id.wire())
                .with_details(json!({"reason": "unknown agent"})),
        )
        .await;
    Err(GatewayError::not_found(format!("unknown agent {raw_id}")))
}

pub(crate) fn agent_id_of(payload: &Value) -> GatewayResult<AgentId> {
    let raw = payload
        .get("agentId")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("payload.agentId is required"))?;
    AgentId::parse(raw).map_err(|_| GatewayError::validation(format!("invalid agent id: {raw}")))
}

pub(crate) fn entry_summary(entry: &AgentEntry) -> Value {
    json!({
        "agentId": entry.id.wire(),
        "externalId": entry.external_id,
        "name": entry.name,
        "nodeId": entry.node_id.as_str(),
        "state": entry.lifecycle.state(),
        "startedAt": entry.started_at,
        "model": entry.model,
        "trustLevel": entry.trust_level,
        "errorCount": entry.error_count,
        "workerReady": entry.worker_ready,
        "tokenUsage": entry.token_usage,
        "costUsageUsd": entry.cost_usage_usd,
    })
}
