//! The agent manifest accepted by `agent_spawn`.
//!
//! Wire format uses camelCase field names; see the dispatcher's spawn
//! handler for validation beyond shape (signature checks, permission
//! parsing).

use serde::{Deserialize, Serialize};

use crate::types::TrustLevel;

/// Limits section of a manifest. All fields optional; unset fields fall
/// back to the configured defaults for the agent's trust level.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ManifestLimits {
    /// Worker heap cap in megabytes.
    pub memory_mb: Option<u64>,
    /// Per-task ceiling, milliseconds.
    pub task_timeout_ms: Option<u64>,
    /// Consecutive failures before `error`.
    pub max_errors: Option<u32>,
    /// Worker restart cap.
    pub max_restarts: Option<u32>,
    /// Requests per minute.
    pub requests_per_minute: Option<u32>,
    /// Tokens per minute.
    pub tokens_per_minute: Option<u32>,
    /// Spend ceiling in USD.
    pub max_cost_usd: Option<f64>,
}

/// Declarative description of an agent presented at spawn time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentManifest {
    /// Caller-chosen external identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Model for chat routing.
    #[serde(default)]
    pub model: Option<String>,
    /// Worker entry point: program followed by arguments.
    #[serde(default)]
    pub entry_point: Option<Vec<String>>,
    /// Declared capability names.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Permission specs in `category.action:resource` form.
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Structured permission grants (alternative to `permissions`).
    #[serde(default)]
    pub permission_grants: Vec<serde_json::Value>,
    /// MCP servers the agent may use.
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Tools the agent exposes.
    #[serde(default)]
    pub tools: Vec<String>,
    /// Agent-to-agent skills advertised.
    #[serde(default)]
    pub a2a_skills: Vec<String>,
    /// Requested trust level.
    #[serde(default)]
    pub trust_level: Option<TrustLevel>,
    /// Limit overrides.
    #[serde(default)]
    pub limits: Option<ManifestLimits>,
    /// Detached manifest signature (hex). Required under production
    /// hardening.
    #[serde(default)]
    pub signature: Option<String>,
}

impl AgentManifest {
    /// Shape-validate the manifest.
    ///
    /// # Errors
    ///
    /// Returns a human-readable message naming the first invalid field.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("manifest id must not be empty".into());
        }
        if self.name.trim().is_empty() {
            return Err("manifest name must not be empty".into());
        }
        if let Some(ep) = &self.entry_point {
            if ep.is_empty() {
                return Err("entryPoint must name a program".into());
            }
        }
        for spec in &self.permissions {
            if !spec.contains('.') {
                return Err(format!("malformed permission spec: {spec}"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_wire_shape() {
        let json = r#"{
            "id": "demo",
            "name": "Demo",
            "entryPoint": ["python3", "worker.py"],
            "permissions": ["filesystem.read:/tmp"],
            "trustLevel": "monitored-autonomous"
        }"#;
        let manifest: AgentManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.id, "demo");
        assert_eq!(
            manifest.entry_point.as_deref(),
            Some(&["python3".to_string(), "worker.py".to_string()][..])
        );
        manifest.validate().unwrap();
    }

    #[test]
    fn test_manifest_rejects_empty_id() {
        let manifest: AgentManifest =
            serde_json::from_str(r#"{"id": " ", "name": "Demo"}"#).unwrap();
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_manifest_rejects_malformed_permission() {
        let manifest: AgentManifest = serde_json::from_str(
            r#"{"id": "demo", "name": "Demo", "permissions": ["notaspec"]}"#,
        )
        .unwrap();
        assert!(manifest.validate().is_err());
    }
}
