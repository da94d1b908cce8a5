//! Agent monitoring sweep.
//!
//! Registered as a scheduler job: reconciles agent records with the
//! sandbox registry. A non-terminal agent whose sandbox died moves to
//! `error` (and eventually through the restart path); a terminated
//! agent with a leftover sandbox gets it reaped.

use std::sync::Arc;

use tracing::{debug, warn};

use warden_core::lifecycle::{AgentState, LifecycleEvent};
use warden_sandbox::{SandboxRegistry, SandboxState};

use crate::agents::AgentRegistry;

/// One reconciliation pass. Returns the number of corrective actions
/// taken.
pub async fn sweep_agents(agents: &AgentRegistry, sandboxes: &Arc<SandboxRegistry>) -> usize {
    let mut actions = 0usize;

    for entry in agents.snapshot_all().await {
        let state = entry.lifecycle.state();
        let sandbox = sandboxes.get(&entry.id);

        match (state, sandbox) {
            // Running agent whose worker is gone: flag it.
            (AgentState::Running, Some(sandbox))
                if sandbox.state() == SandboxState::Terminated =>
            {
                warn!(agent = %entry.id, "worker died; transitioning agent to error");
                sandboxes.remove(&entry.id);
                if agents
                    .transition(
                        &entry.id,
                        LifecycleEvent::Fail,
                        Some("worker process died".to_string()),
                    )
                    .await
                    .is_ok()
                {
                    actions = actions.saturating_add(1);
                }
            },
            // Idle agent whose worker is gone: drop the dead sandbox so
            // the next task takes the restart path.
            (AgentState::Ready, Some(sandbox))
                if sandbox.state() == SandboxState::Terminated =>
            {
                debug!(agent = %entry.id, "removing dead sandbox of idle agent");
                sandboxes.remove(&entry.id);
                actions = actions.saturating_add(1);
            },
            // Terminated agent with a live sandbox: reap it.
            (AgentState::Terminated, Some(sandbox)) => {
                debug!(agent = %entry.id, "reaping sandbox of terminated agent");
                sandbox.terminate().await;
                sandboxes.remove(&entry.id);
                actions = actions.saturating_add(1);
            },
            _ => {},
        }
    }
    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::agent::AgentEntry;
    use warden_core::types::NodeId;
    use warden_events::EventBus;

    #[tokio::test]
    async fn test_sweep_with_no_sandboxes_is_quiet() {
        let agents = AgentRegistry::new(Arc::new(EventBus::new()));
        let sandboxes = Arc::new(SandboxRegistry::new());
        agents.insert(AgentEntry::new("a", "A", NodeId::new("n")));
        assert_eq!(sweep_agents(&agents, &sandboxes).await, 0);
    }
}
