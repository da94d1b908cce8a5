//! Worker environment construction.

use std::collections::HashMap;

use warden_core::env_policy::sanitize_env;
use warden_core::types::AgentId;

/// Build the environment for a worker process.
///
/// Starts from the sanitized parent environment (allowlist minus the
/// blocklist), then layers the sandbox-set variables on top. The
/// result is the *entire* environment; spawn sites must `env_clear`
/// first.
#[must_use]
pub fn build_worker_env(
    agent_id: &AgentId,
    capabilities: &[String],
    mode: &str,
    memory_mb: u64,
) -> HashMap<String, String> {
    let parent: Vec<(String, String)> = std::env::vars().collect();
    let mut env = sanitize_env(parent.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    env.insert("AGENT_ID".to_string(), agent_id.wire());
    env.insert("CAPABILITIES".to_string(), capabilities.join(","));
    env.insert("MODE".to_string(), mode.to_string());
    env.insert("WORKER_HEAP_LIMIT_MB".to_string(), memory_mb.to_string());
    env
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_vars_are_set() {
        let agent = AgentId::new();
        let env = build_worker_env(&agent, &["tools".to_string(), "memory".to_string()], "sandbox", 256);
        assert_eq!(env.get("AGENT_ID").map(String::as_str), Some(agent.wire().as_str()));
        assert_eq!(env.get("CAPABILITIES").map(String::as_str), Some("tools,memory"));
        assert_eq!(env.get("MODE").map(String::as_str), Some("sandbox"));
        assert_eq!(env.get("WORKER_HEAP_LIMIT_MB").map(String::as_str), Some("256"));
    }

    #[test]
    fn test_no_credential_leaks() {
        let env = build_worker_env(&AgentId::new(), &[], "sandbox", 128);
        for key in env.keys() {
            assert!(
                !warden_core::env_policy::is_blocked_worker_env(key),
                "blocked variable {key} leaked into worker env"
            );
        }
    }
}
