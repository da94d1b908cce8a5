//! Distributed bus backend.
//!
//! Wraps the in-process bus and forwards every published event to an
//! external pub/sub transport under a channel-prefixed subject. Local
//! subscribers still receive in-process; remote subscribers receive
//! through the transport on their own node.

use std::sync::Arc;

use tracing::warn;

use crate::bus::{EventBus, PublishOutcome};
use crate::event::Event;

/// Publish-only seam to an external pub/sub system.
pub trait RemoteTransport: Send + Sync {
    /// Forward a serialized event under `subject`.
    ///
    /// # Errors
    ///
    /// Returns a transport-specific message; the bus logs and carries
    /// on (remote delivery is best-effort).
    fn forward(&self, subject: &str, payload: &[u8]) -> Result<(), String>;
}

/// An event bus that also forwards to an external transport.
pub struct DistributedEventBus {
    local: Arc<EventBus>,
    transport: Arc<dyn RemoteTransport>,
    subject_prefix: String,
}

impl DistributedEventBus {
    /// Wrap `local`, forwarding under `prefix.<channel>` subjects.
    #[must_use]
    pub fn new(
        local: Arc<EventBus>,
        transport: Arc<dyn RemoteTransport>,
        subject_prefix: impl Into<String>,
    ) -> Self {
        Self {
            local,
            transport,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// The wrapped in-process bus.
    #[must_use]
    pub fn local(&self) -> &Arc<EventBus> {
        &self.local
    }

    /// Publish locally, then forward.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        let subject = format!("{}.{}", self.subject_prefix, event.channel);
        let payload = serde_json::to_vec(&event).unwrap_or_default();
        let outcome = self.local.publish(event);
        if let Err(e) = self.transport.forward(&subject, &payload) {
            warn!(subject, error = %e, "remote event forward failed");
        }
        outcome
    }
}

impl std::fmt::Debug for DistributedEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedEventBus")
            .field("subject_prefix", &self.subject_prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        subjects: Mutex<Vec<String>>,
    }

    impl RemoteTransport for RecordingTransport {
        fn forward(&self, subject: &str, _payload: &[u8]) -> Result<(), String> {
            self.subjects.lock().unwrap().push(subject.to_string());
            Ok(())
        }
    }

    #[test]
    fn test_forwards_with_prefix() {
        let transport = Arc::new(RecordingTransport {
            subjects: Mutex::new(Vec::new()),
        });
        let bus = DistributedEventBus::new(
            Arc::new(EventBus::new()),
            Arc::clone(&transport) as Arc<dyn RemoteTransport>,
            "warden",
        );

        bus.publish(Event::new("agent.lifecycle", "agent.created", serde_json::Value::Null));
        assert_eq!(
            *transport.subjects.lock().unwrap(),
            vec!["warden.agent.lifecycle".to_string()]
        );
    }

    #[test]
    fn test_failing_transport_does_not_break_local_delivery() {
        struct FailingTransport;
        impl RemoteTransport for FailingTransport {
            fn forward(&self, _subject: &str, _payload: &[u8]) -> Result<(), String> {
                Err("unreachable".into())
            }
        }

        let local = Arc::new(EventBus::new());
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        local.subscribe(
            "*",
            Arc::new(move |_e: &Event| {
                count_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }),
            crate::subscriber::SubscribeOptions::default(),
        );

        let bus = DistributedEventBus::new(local, Arc::new(FailingTransport), "warden");
        let outcome = bus.publish(Event::new("x", "y", serde_json::Value::Null));
        assert_eq!(outcome.delivered, 1);
    }
}
