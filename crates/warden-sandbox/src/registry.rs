//! The sandbox registry.
//!
//! Maps `agent_id -> sandbox` and enforces at-most-one live sandbox
//! per agent. Everything outside this module holds agent ids, not
//! sandbox pointers.

use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use tracing::info;

use warden_core::types::AgentId;

use crate::error::{SandboxError, SandboxResult};
use crate::process::{ProcessSandbox, SandboxConfig, SandboxState};

/// Registry of live sandboxes.
#[derive(Default)]
pub struct SandboxRegistry {
    sandboxes: DashMap<AgentId, Arc<ProcessSandbox>>,
}

impl SandboxRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and spawn a sandbox for an agent.
    ///
    /// # Errors
    ///
    /// [`SandboxError::AlreadyExists`] when the agent already has a
    /// live sandbox, or any spawn failure (the failed sandbox is not
    /// registered).
    pub async fn create(&self, config: SandboxConfig) -> SandboxResult<Arc<ProcessSandbox>> {
        let agent_id = config.agent_id.clone();
        if let Some(existing) = self.sandboxes.get(&agent_id) {
            // A terminated leftover can be replaced; a live one cannot.
            if existing.state() != SandboxState::Terminated {
                return Err(SandboxError::AlreadyExists {
                    agent_id: agent_id.to_string(),
                });
            }
        }

        let sandbox = ProcessSandbox::new(config);
        sandbox.spawn().await?;
        self.sandboxes.insert(agent_id.clone(), Arc::clone(&sandbox));
        info!(agent = %agent_id, "sandbox registered");
        Ok(sandbox)
    }

    /// Look up an agent's sandbox.
    #[must_use]
    pub fn get(&self, agent_id: &AgentId) -> Option<Arc<ProcessSandbox>> {
        self.sandboxes.get(agent_id).map(|s| Arc::clone(&s))
    }

    /// Number of registered sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sandboxes.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sandboxes.is_empty()
    }

    /// Terminate and remove one agent's sandbox.
    ///
    /// # Errors
    ///
    /// [`SandboxError::NotFound`] when the agent has none.
    pub async fn terminate(&self, agent_id: &AgentId) -> SandboxResult<()> {
        let Some((_, sandbox)) = self.sandboxes.remove(agent_id) else {
            return Err(SandboxError::NotFound {
                agent_id: agent_id.to_string(),
            });
        };
        sandbox.terminate().await;
        info!(agent = %agent_id, "sandbox terminated and removed");
        Ok(())
    }

    /// Remove a sandbox entry without terminating (crash cleanup).
    pub fn remove(&self, agent_id: &AgentId) -> Option<Arc<ProcessSandbox>> {
        self.sandboxes.remove(agent_id).map(|(_, s)| s)
    }

    /// Terminate every sandbox, draining in parallel. Returns the
    /// number terminated.
    pub async fn terminate_all(&self) -> usize {
        let drained: Vec<Arc<ProcessSandbox>> = {
            let keys: Vec<AgentId> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
            keys.iter()
                .filter_map(|k| self.sandboxes.remove(k).map(|(_, s)| s))
                .collect()
        };
        let count = drained.len();
        join_all(drained.iter().map(|sandbox| {
            let sandbox = Arc::clone(sandbox);
            async move { sandbox.terminate().await }
        }))
        .await;
        info!(count, "terminated all sandboxes");
        count
    }
}

impl std::fmt::Debug for SandboxRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRegistry")
            .field("sandboxes", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ready_worker_config(temp: &std::path::Path, agent_id: AgentId) -> SandboxConfig {
        let script = concat!(
            "echo '{\"type\":\"ready\",\"id\":\"0\",\"ts\":0}'; ",
            "while read -r line; do ",
            "case \"$line\" in *heartbeat*) echo \"$line\" | sed 's/heartbeat/heartbeat_ack/' ;; ",
            "*terminate*) exit 0 ;; esac; done"
        );
        let mut config = SandboxConfig::local(
            agent_id,
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        );
        config.temp_root = temp.to_path_buf();
        config.memory_mb = 1024;
        config.startup_timeout = Duration::from_secs(5);
        config.terminate_grace = Duration::from_millis(300);
        config
    }

    #[tokio::test]
    async fn test_at_most_one_sandbox_per_agent() {
        let temp = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new();
        let agent = AgentId::new();

        registry
            .create(ready_worker_config(temp.path(), agent.clone()))
            .await
            .unwrap();
        let err = registry
            .create(ready_worker_config(temp.path(), agent.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::AlreadyExists { .. }));

        registry.terminate(&agent).await.unwrap();
        assert!(registry.get(&agent).is_none());
    }

    #[tokio::test]
    async fn test_terminate_unknown_agent() {
        let registry = SandboxRegistry::new();
        let err = registry.terminate(&AgentId::new()).await.unwrap_err();
        assert!(matches!(err, SandboxError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_terminate_all_drains() {
        let temp = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new();
        for _ in 0..3 {
            registry
                .create(ready_worker_config(temp.path(), AgentId::new()))
                .await
                .unwrap();
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.terminate_all().await, 3);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_replace_after_termination() {
        // Scenario: a timed-out sandbox is replaced on the next spawn.
        let temp = tempfile::tempdir().unwrap();
        let registry = SandboxRegistry::new();
        let agent = AgentId::new();

        let first = registry
            .create(ready_worker_config(temp.path(), agent.clone()))
            .await
            .unwrap();
        first.terminate().await;

        // Entry still present but terminated; create replaces it.
        let second = registry
            .create(ready_worker_config(temp.path(), agent.clone()))
            .await
            .unwrap();
        assert_eq!(second.state(), SandboxState::Ready);
        registry.terminate_all().await;
    }
}
