//! The `agent_task` request.
//!
//! Tool calls run through the policy engine and capability manager
//! before anything executes. Tasks in the gateway-handled set (memory
//! operations, tool registry, directory lookups, A2A delegation,
//! event emission) are served in-process; everything else goes to the
//! agent's sandbox worker. Failures count against the agent's error
//! threshold.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use warden_audit::AuditEntry;
use warden_capabilities::CapabilityCategory;
use warden_core::agent::AgentEntry;
use warden_core::lifecycle::{AgentState, LifecycleEvent};
use warden_core::types::AgentId;
use warden_events::Event;
use warden_policy::{Decision, FileOperation, Operation};

use crate::cluster;
use crate::error::{GatewayError, GatewayResult};
use crate::handlers::agents::{agent_id_of, entry_summary};
use crate::protocol::{Frame, ServerMessage};
use crate::state::Gateway;

/// KV namespace for per-agent memory.
const NS_AGENT_MEMORY: &str = "agent-memory";

/// Handle one `agent_task` frame.
pub async fn handle(
    gateway: &Arc<Gateway>,
    client_id: &str,
    frame: &Frame,
) -> GatewayResult<ServerMessage> {
    let agent_id = agent_id_of(&frame.payload)?;
    let task = frame
        .payload
        .get("task")
        .cloned()
        .ok_or_else(|| GatewayError::validation("payload.task is required"))?;
    let task_type = task
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::validation("task.type is required"))?
        .to_string();

    let Some(entry) = gateway.agents.snapshot(&agent_id).await else {
        // Maybe another node owns it.
        if let Some(owner) = cluster::pinned_node(gateway, &agent_id).await {
            if owner != gateway.node_id.as_str() {
                return cluster::forward_frame(gateway, &owner, frame).await;
            }
        }
        return Err(GatewayError::not_found(format!("unknown agent {}", agent_id.wire())));
    };

    let state = entry.lifecycle.state();
    if !matches!(state, AgentState::Ready | AgentState::Running) {
        return Err(GatewayError::agent(format!("agent is {state}, not accepting tasks")));
    }

    let outcome = if task_type == "tool_call" {
        tool_call(gateway, &agent_id, &task, &frame.id).await
    } else if is_gateway_handled(&task_type) {
        gateway_task(gateway, client_id, &agent_id, &entry, &task_type, &task, &frame.id).await
    } else {
        worker_task(gateway, &agent_id, &entry, &task).await
    };

    // One audit entry per task. Tool calls already audited their
    // decision (`tool.denied` / `tool.allowed`) inside the handler.
    let audited = task_type == "tool_call";
    let payload = match outcome {
        Ok(result) => {
            gateway.agents.record_task_success(&agent_id).await.ok();
            if !audited {
                gateway
                    .audit
                    .record(
                        AuditEntry::success(agent_id.wire(), "agent.task", "task", &task_type)
                            .with_details(json!({"requestId": frame.id})),
                    )
                    .await;
            }
            json!({"agentId": agent_id.wire(), "status": "ok", "result": result})
        },
        Err(TaskFailure::Denied(reason)) => {
            if !audited {
                gateway
                    .audit
                    .record(
                        AuditEntry::failure(agent_id.wire(), "agent.task", "task", &task_type)
                            .with_details(json!({"requestId": frame.id, "reason": reason})),
                    )
                    .await;
            }
            json!({"agentId": agent_id.wire(), "status": "error", "error": reason})
        },
        Err(TaskFailure::Failed(reason)) => {
            let (count, crossed) = gateway
                .agents
                .record_task_failure(&agent_id, &reason)
                .await
                .unwrap_or((0, false));
            debug!(agent = %agent_id, count, crossed, "task failure recorded");
            if !audited {
                gateway
                    .audit
                    .record(
                        AuditEntry::failure(agent_id.wire(), "agent.task", "task", &task_type)
                            .with_details(json!({"requestId": frame.id, "reason": reason})),
                    )
                    .await;
            }
            json!({"agentId": agent_id.wire(), "status": "error", "error": reason})
        },
    };

    gateway.metrics.incr("agent_tasks_total");
    Ok(ServerMessage::new("agent_task_result", frame.id.clone(), payload))
}

/// How a task failed: policy/permission denials never count against
/// the error threshold, execution failures do.
enum TaskFailure {
    Denied(String),
    Failed(String),
}

fn is_gateway_handled(task_type: &str) -> bool {
    task_type.starts_with("memory.")
        || task_type.starts_with("tools.")
        || task_type.starts_with("directory.")
        || task_type == "a2a.delegate"
        || task_type == "event.emit"
}

async fn tool_call(
    gateway: &Arc<Gateway>,
    agent_id: &AgentId,
    task: &Value,
    request_id: &str,
) -> Result<Value, TaskFailure> {
    let tool = task.get("tool").and_then(Value::as_str).unwrap_or_default();
    let args = task.get("args").cloned().unwrap_or(Value::Null);

    let Some(operation) = operation_for(tool, &args, agent_id) else {
        return Err(TaskFailure::Denied(format!("unknown tool: {tool}")));
    };

    // Policy first.
    let evaluation = gateway.policy().evaluate(&operation);
    gateway.metrics.incr("decisions_total");
    if evaluation.decision != Decision::Allow {
        let reason = format!("Tool denied: {}", evaluation.reason);
        gateway
            .audit
            .record(
                AuditEntry::failure(agent_id.wire(), "tool.denied", "tool", tool)
                    .with_details(json!({
                        "reason": evaluation.reason,
                        "matchedRule": evaluation.matched_rule_id,
                        "requestId": request_id,
                    })),
            )
            .await;
        gateway.metrics.incr("decisions_blocked_total");
        return Err(TaskFailure::Denied(reason));
    }

    // Then the capability grant.
    let (category, action, resource) = capability_for(&operation);
    let check = gateway
        .capabilities
        .check(agent_id, category, action, resource.as_deref());
    if !check.allowed {
        let reason = check.reason.unwrap_or_else(|| "no capability".to_string());
        gateway
            .audit
            .record(
                AuditEntry::failure(agent_id.wire(), "tool.denied", "tool", tool)
                    .with_details(json!({"reason": reason, "requestId": request_id})),
            )
            .await;
        return Err(TaskFailure::Denied(format!("Permission denied: {reason}")));
    }

    gateway
        .audit
        .record(
            AuditEntry::success(agent_id.wire(), "tool.allowed", "tool", tool)
                .with_details(json!({"requestId": request_id})),
        )
        .await;

    // The worker executes allowed tool calls when the agent owns one;
    // gateway-managed agents just receive the decision.
    if let Some(sandbox) = gateway.sandboxes.get(agent_id) {
        let deadline = gateway.effective_deadline(None);
        return match sandbox.execute(task.clone(), deadline).await {
            Ok(outcome) if outcome.success => Ok(outcome.result.unwrap_or(Value::Null)),
            Ok(outcome) => Err(TaskFailure::Failed(
                outcome.error.unwrap_or_else(|| "task failed".to_string()),
            )),
            Err(e) => Err(TaskFailure::Failed(e.to_string())),
        };
    }
    Ok(json!({"decision": "allow"}))
}

fn operation_for(tool: &str, args: &Value, agent_id: &AgentId) -> Option<Operation> {
    let agent = Some(agent_id.wire());
    match tool {
        "shell" | "bash" | "exec" => Some(Operation::Shell {
            command: args.get("command").and_then(Value::as_str)?.to_string(),
            argv: args
                .get("argv")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default(),
            cwd: args.get("cwd").and_then(Value::as_str).map(str::to_string),
            agent_id: agent,
        }),
        "fs.read" | "fs.write" | "fs.list" | "fs.delete" | "fs.create" => {
            let operation = match tool {
                "fs.write" => FileOperation::Write,
                "fs.list" => FileOperation::List,
                "fs.delete" => FileOperation::Delete,
                "fs.create" => FileOperation::Create,
                _ => FileOperation::Read,
            };
            Some(Operation::File {
                path: args.get("path").and_then(Value::as_str)?.to_string(),
                operation,
                agent_id: agent,
            })
        },
        "http" | "fetch" | "network" => Some(Operation::Network {
            host: args.get("host").and_then(Value::as_str).map(str::to_string),
            port: args
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok()),
            scheme: args.get("scheme").and_then(Value::as_str).map(str::to_string),
            url: args.get("url").and_then(Value::as_str).map(str::to_string),
            agent_id: agent,
        }),
        _ => None,
    }
}

fn capability_for(operation: &Operation) -> (CapabilityCategory, &'static str, Option<String>) {
    match operation {
        Operation::File {
            path, operation, ..
        } => {
            let action = match operation {
                FileOperation::Write => "write",
                FileOperation::List => "list",
                FileOperation::Delete => "delete",
                FileOperation::Create => "create",
                FileOperation::Read => "read",
            };
            (CapabilityCategory::Filesystem, action, Some(path.clone()))
        },
        Operation::Network { host, url, .. } => (
            CapabilityCategory::Network,
            "connect",
            host.clone().or_else(|| url.clone()),
        ),
        Operation::Shell { .. } => (CapabilityCategory::Shell, "execute", None),
    }
}

#[allow(clippy::too_many_arguments)]
async fn gateway_task(
    gateway: &Arc<Gateway>,
    client_id: &str,
    agent_id: &AgentId,
    entry: &AgentEntry,
    task_type: &str,
    task: &Value,
    request_id: &str,
) -> Result<Value, TaskFailure> {
    let result = match task_type {
        "memory.set" => {
            let key = string_field(task, "key")?;
            let value = task.get("value").cloned().unwrap_or(Value::Null);
            let namespace = format!("{NS_AGENT_MEMORY}:{}", agent_id.wire());
            let bytes = serde_json::to_vec(&value)
                .map_err(|e| TaskFailure::Failed(e.to_string()))?;
            gateway
                .store
                .set(&namespace, &key, bytes)
                .await
                .map_err(|e| TaskFailure::Failed(e.to_string()))?;
            json!({"stored": true})
        },
        "memory.get" => {
            let key = string_field(task, "key")?;
            let namespace = format!("{NS_AGENT_MEMORY}:{}", agent_id.wire());
            let value = gateway
                .store
                .get(&namespace, &key)
                .await
                .map_err(|e| TaskFailure::Failed(e.to_string()))?
                .and_then(|bytes| serde_json::from_slice(&bytes).ok())
                .unwrap_or(Value::Null);
            json!({"value": value})
        },
        "memory.delete" => {
            let key = string_field(task, "key")?;
            let namespace = format!("{NS_AGENT_MEMORY}:{}", agent_id.wire());
            gateway
                .store
                .delete(&namespace, &key)
                .await
                .map_err(|e| TaskFailure::Failed(e.to_string()))?;
            json!({"deleted": true})
        },
        "tools.list" => json!({"tools": entry.tools}),
        "directory.lookup" => {
            let agents: Vec<Value> = gateway
                .agents
                .snapshot_all()
                .await
                .iter()
                .map(entry_summary)
                .collect();
            json!({"agents": agents})
        },
        "event.emit" => {
            let channel = string_field(task, "channel")?;
            let event_type = string_field(task, "eventType")
                .or_else(|_| string_field(task, "event_type"))?;
            let data = task.get("data").cloned().unwrap_or(Value::Null);
            let outcome = gateway
                .bus
                .publish(Event::new(channel, event_type, data).with_agent(agent_id.wire()));
            json!({"delivered": outcome.delivered})
        },
        "a2a.delegate" => {
            // Delegate a task to another agent on this node, through
            // the same dispatch path (policy and capabilities apply to
            // the target).
            let target_raw = string_field(task, "targetAgentId")?;
            let inner_task = task
                .get("task")
                .cloned()
                .ok_or_else(|| TaskFailure::Denied("a2a.delegate requires task".to_string()))?;
            let inner_frame = Frame::new(
                "agent_task",
                format!("{request_id}:delegate"),
                json!({"agentId": target_raw, "task": inner_task}),
            );
            let response = Box::pin(handle(gateway, client_id, &inner_frame))
                .await
                .map_err(|e| TaskFailure::Failed(e.message))?;
            response.payload
        },
        other => {
            return Err(TaskFailure::Denied(format!("unsupported gateway task: {other}")));
        },
    };
    Ok(result)
}

fn string_field(task: &Value, field: &str) -> Result<String, TaskFailure> {
    task.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| TaskFailure::Denied(format!("task.{field} is required")))
}

async fn worker_task(
    gateway: &Arc<Gateway>,
    agent_id: &AgentId,
    entry: &AgentEntry,
    task: &Value,
) -> Result<Value, TaskFailure> {
    let Some(entry_point) = entry.entry_point.clone() else {
        return Err(TaskFailure::Denied(
            "agent has no worker entry point for this task".to_string(),
        ));
    };
    let sandbox = match gateway.sandboxes.get(agent_id) {
        Some(sandbox) if sandbox.state() != warden_sandbox::SandboxState::Terminated => sandbox,
        // Worker gone (crash or prior timeout): respawn under the
        // restart budget before failing the task.
        _ => {
            let backoff = gateway
                .agents
                .next_restart_backoff(agent_id)
                .await
                .map_err(|e| TaskFailure::Failed(e.to_string()))?
                .ok_or_else(|| {
                    TaskFailure::Failed("worker restart budget exhausted".to_string())
                })?;
            tokio::time::sleep(backoff).await;
            gateway.sandboxes.remove(agent_id);
            let config = crate::handlers::agents::sandbox_config(gateway, agent_id, entry_point);
            let sandbox = gateway
                .sandboxes
                .create(config)
                .await
                .map_err(|e| TaskFailure::Failed(format!("worker respawn failed: {e}")))?;
            debug!(agent = %agent_id, "worker respawned");
            sandbox
        },
    };

    let requested_ms = task.get("timeoutMs").and_then(Value::as_u64);
    let deadline = gateway.effective_deadline(requested_ms);

    gateway
        .agents
        .transition(agent_id, LifecycleEvent::Start, None)
        .await
        .map_err(|e| TaskFailure::Failed(e.to_string()))?;

    let outcome = sandbox.execute(task.clone(), deadline).await;

    // Back to ready; a threshold crossing may immediately re-fail it.
    let _ = gateway
        .agents
        .transition(agent_id, LifecycleEvent::Complete, None)
        .await;

    match outcome {
        Ok(result) if result.success => Ok(result.result.unwrap_or(Value::Null)),
        Ok(result) => Err(TaskFailure::Failed(
            result.error.unwrap_or_else(|| "task failed".to_string()),
        )),
        Err(e) => Err(TaskFailure::Failed(e.to_string())),
    }
}
