//! The agent registry.
//!
//! Owns every agent record behind a per-agent async lock so that
//! lifecycle transitions for one agent never interleave. Every
//! transition is published synchronously on `agent.lifecycle` with
//! type `agent.<new state>`.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};

use warden_core::agent::AgentEntry;
use warden_core::lifecycle::{LifecycleEvent, TransitionRecord};
use warden_core::types::AgentId;
use warden_events::{Event, EventBus};

use crate::error::{RuntimeError, RuntimeResult};

/// Channel for lifecycle events.
pub const LIFECYCLE_CHANNEL: &str = "agent.lifecycle";

/// Channel for error-threshold alerts.
pub const ALERTS_CHANNEL: &str = "alerts";

/// Minimum restart backoff.
const RESTART_BACKOFF_FLOOR_MS: u64 = 500;

/// Maximum restart backoff.
const RESTART_BACKOFF_CEIL_MS: u64 = 60_000;

/// Registry of agent records.
pub struct AgentRegistry {
    agents: DashMap<AgentId, Arc<Mutex<AgentEntry>>>,
    bus: Arc<EventBus>,
}

impl AgentRegistry {
    /// Registry publishing on `bus`.
    #[must_use]
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            agents: DashMap::new(),
            bus,
        }
    }

    /// Insert a fresh record.
    pub fn insert(&self, entry: AgentEntry) {
        self.agents
            .insert(entry.id.clone(), Arc::new(Mutex::new(entry)));
    }

    /// Snapshot one agent's record.
    pub async fn snapshot(&self, agent_id: &AgentId) -> Option<AgentEntry> {
        let handle = self.handle(agent_id)?;
        Some(handle.lock().await.clone())
    }

    /// Snapshot every record.
    pub async fn snapshot_all(&self) -> Vec<AgentEntry> {
        let handles: Vec<Arc<Mutex<AgentEntry>>> =
            self.agents.iter().map(|e| Arc::clone(e.value())).collect();
        let mut entries = Vec::with_capacity(handles.len());
        for handle in handles {
            entries.push(handle.lock().await.clone());
        }
        entries
    }

    /// Find an agent by its caller-supplied external id.
    pub async fn find_by_external_id(&self, external_id: &str) -> Option<AgentEntry> {
        for entry in &self.agents {
            let agent = entry.value().lock().await;
            if agent.external_id == external_id {
                return Some(agent.clone());
            }
        }
        None
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Remove an agent record entirely.
    pub fn remove(&self, agent_id: &AgentId) -> bool {
        self.agents.remove(agent_id).is_some()
    }

    fn handle(&self, agent_id: &AgentId) -> Option<Arc<Mutex<AgentEntry>>> {
        self.agents.get(agent_id).map(|e| Arc::clone(e.value()))
    }

    /// Apply a lifecycle event to an agent, serialized per agent, and
    /// publish the transition.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AgentNotFound`] or the state machine's
    /// rejection (state unchanged).
    pub async fn transition(
        &self,
        agent_id: &AgentId,
        event: LifecycleEvent,
        reason: Option<String>,
    ) -> RuntimeResult<TransitionRecord> {
        let handle = self.handle(agent_id).ok_or_else(|| RuntimeError::AgentNotFound {
            agent_id: agent_id.to_string(),
        })?;
        let mut agent = handle.lock().await;
        let record = agent.lifecycle.apply(event, reason)?;
        info!(
            agent = %agent_id,
            from = %record.from,
            to = %record.to,
            event = %record.event,
            "agent transition"
        );
        self.publish_transition(agent_id, &record);
        Ok(record)
    }

    fn publish_transition(&self, agent_id: &AgentId, record: &TransitionRecord) {
        self.bus.publish(
            Event::new(
                LIFECYCLE_CHANNEL,
                format!("agent.{}", record.to.as_str()),
                json!({
                    "from": record.from,
                    "to": record.to,
                    "event": record.event,
                    "reason": record.reason,
                }),
            )
            .with_agent(agent_id.wire()),
        );
    }

    /// Mutate one agent's record under its lock.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AgentNotFound`].
    pub async fn update<F, T>(&self, agent_id: &AgentId, f: F) -> RuntimeResult<T>
    where
        F: FnOnce(&mut AgentEntry) -> T,
    {
        let handle = self.handle(agent_id).ok_or_else(|| RuntimeError::AgentNotFound {
            agent_id: agent_id.to_string(),
        })?;
        let mut agent = handle.lock().await;
        Ok(f(&mut agent))
    }

    /// Record a task failure. When the count crosses the agent's
    /// threshold the agent transitions to `error` and alerts are
    /// published. Returns `(count, crossed_threshold)`.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AgentNotFound`].
    pub async fn record_task_failure(
        &self,
        agent_id: &AgentId,
        error: &str,
    ) -> RuntimeResult<(u32, bool)> {
        let handle = self.handle(agent_id).ok_or_else(|| RuntimeError::AgentNotFound {
            agent_id: agent_id.to_string(),
        })?;
        let mut agent = handle.lock().await;
        let count = agent.record_error();
        let crossed = agent.errors_exceeded();
        if crossed {
            warn!(agent = %agent_id, count, "agent error threshold crossed");
            match agent.lifecycle.apply(
                LifecycleEvent::Fail,
                Some(format!("error threshold crossed: {error}")),
            ) {
                Ok(record) => self.publish_transition(agent_id, &record),
                // Already paused/error/terminal: the alert still goes
                // out, the state stays put.
                Err(e) => warn!(agent = %agent_id, error = %e, "threshold fail transition rejected"),
            }
            self.bus.publish(
                Event::new(
                    ALERTS_CHANNEL,
                    "agent.error.threshold",
                    json!({"count": count, "last_error": error}),
                )
                .with_agent(agent_id.wire()),
            );
        }
        Ok((count, crossed))
    }

    /// Record a task success: clears the consecutive error count.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AgentNotFound`].
    pub async fn record_task_success(&self, agent_id: &AgentId) -> RuntimeResult<()> {
        self.update(agent_id, AgentEntry::clear_errors).await
    }

    /// Bump the restart bookkeeping, returning the new backoff to wait
    /// before the next spawn attempt, or `None` when the restart cap
    /// is exhausted.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::AgentNotFound`].
    pub async fn next_restart_backoff(
        &self,
        agent_id: &AgentId,
    ) -> RuntimeResult<Option<std::time::Duration>> {
        self.update(agent_id, |agent| {
            if agent.restart_attempts >= agent.limits.max_restarts {
                return None;
            }
            agent.restart_attempts = agent.restart_attempts.saturating_add(1);
            agent.restart_backoff_ms = agent
                .restart_backoff_ms
                .saturating_mul(2)
                .clamp(RESTART_BACKOFF_FLOOR_MS, RESTART_BACKOFF_CEIL_MS);
            Some(std::time::Duration::from_millis(agent.restart_backoff_ms))
        })
        .await
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use warden_core::lifecycle::AgentState;
    use warden_core::types::NodeId;
    use warden_events::SubscribeOptions;

    fn registry_with_agent() -> (AgentRegistry, AgentId, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(Arc::clone(&bus));
        let entry = AgentEntry::new("demo", "Demo", NodeId::new("node-a"));
        let id = entry.id.clone();
        registry.insert(entry);
        (registry, id, bus)
    }

    #[tokio::test]
    async fn test_transition_publishes_lifecycle_event() {
        let (registry, id, bus) = registry_with_agent();
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(
            LIFECYCLE_CHANNEL,
            Arc::new(move |e: &Event| {
                seen_clone.lock().unwrap().push(e.event_type.clone());
            }),
            SubscribeOptions::default(),
        );

        registry
            .transition(&id, LifecycleEvent::Initialize, None)
            .await
            .unwrap();
        registry.transition(&id, LifecycleEvent::Ready, None).await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec!["agent.initializing".to_string(), "agent.ready".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_transition_is_rejected() {
        let (registry, id, _bus) = registry_with_agent();
        let err = registry
            .transition(&id, LifecycleEvent::Start, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Lifecycle(_)));
        let snapshot = registry.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.lifecycle.state(), AgentState::Created);
    }

    #[tokio::test]
    async fn test_unknown_agent() {
        let bus = Arc::new(EventBus::new());
        let registry = AgentRegistry::new(bus);
        let err = registry
            .transition(&AgentId::new(), LifecycleEvent::Initialize, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::AgentNotFound { .. }));
    }

    #[tokio::test]
    async fn test_error_threshold_fails_agent_and_alerts() {
        let (registry, id, bus) = registry_with_agent();
        registry
            .update(&id, |agent| agent.limits.max_errors = 2)
            .await
            .unwrap();
        registry.transition(&id, LifecycleEvent::Initialize, None).await.unwrap();
        registry.transition(&id, LifecycleEvent::Ready, None).await.unwrap();
        registry.transition(&id, LifecycleEvent::Start, None).await.unwrap();

        let alerts = Arc::new(StdMutex::new(Vec::new()));
        let alerts_clone = Arc::clone(&alerts);
        bus.subscribe(
            ALERTS_CHANNEL,
            Arc::new(move |e: &Event| {
                alerts_clone.lock().unwrap().push(e.event_type.clone());
            }),
            SubscribeOptions::default(),
        );

        let (count, crossed) = registry.record_task_failure(&id, "boom").await.unwrap();
        assert_eq!((count, crossed), (1, false));
        let (count, crossed) = registry.record_task_failure(&id, "boom again").await.unwrap();
        assert_eq!((count, crossed), (2, true));

        let snapshot = registry.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.lifecycle.state(), AgentState::Error);
        assert_eq!(*alerts.lock().unwrap(), vec!["agent.error.threshold".to_string()]);
    }

    #[tokio::test]
    async fn test_success_clears_errors() {
        let (registry, id, _bus) = registry_with_agent();
        registry.record_task_failure(&id, "x").await.unwrap();
        registry.record_task_success(&id).await.unwrap();
        let snapshot = registry.snapshot(&id).await.unwrap();
        assert_eq!(snapshot.error_count, 0);
    }

    #[tokio::test]
    async fn test_restart_backoff_grows_and_caps() {
        let (registry, id, _bus) = registry_with_agent();
        registry
            .update(&id, |agent| agent.limits.max_restarts = 3)
            .await
            .unwrap();

        let first = registry.next_restart_backoff(&id).await.unwrap().unwrap();
        let second = registry.next_restart_backoff(&id).await.unwrap().unwrap();
        let third = registry.next_restart_backoff(&id).await.unwrap().unwrap();
        assert!(second >= first);
        assert!(third >= second);

        // Cap exhausted.
        assert!(registry.next_restart_backoff(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_find_by_external_id() {
        let (registry, id, _bus) = registry_with_agent();
        let found = registry.find_by_external_id("demo").await.unwrap();
        assert_eq!(found.id, id);
        assert!(registry.find_by_external_id("missing").await.is_none());
    }
}
