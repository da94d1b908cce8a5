//! Subscription types.

use std::sync::Arc;

use crate::event::Event;
use crate::pattern::channel_matches;
use warden_core::types::SubscriptionId;

/// A synchronous event handler.
///
/// Handlers run inline during `publish`; keep them short and hand
/// long work to a channel or task.
pub type EventHandler = Arc<dyn Fn(&Event) + Send + Sync>;

/// A predicate applied after pattern matching.
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Options for a subscription.
#[derive(Clone, Default)]
pub struct SubscribeOptions {
    /// Higher priorities are delivered first. Default 0.
    pub priority: i32,
    /// Remove the subscription after its first delivery.
    pub once: bool,
    /// Extra predicate on the event.
    pub filter: Option<EventFilter>,
    /// Pattern on the event type (same syntax as channel patterns).
    pub type_pattern: Option<String>,
}

impl std::fmt::Debug for SubscribeOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscribeOptions")
            .field("priority", &self.priority)
            .field("once", &self.once)
            .field("has_filter", &self.filter.is_some())
            .field("type_pattern", &self.type_pattern)
            .finish()
    }
}

/// One registered subscription.
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) id: SubscriptionId,
    pub(crate) pattern: String,
    pub(crate) options: SubscribeOptions,
    pub(crate) handler: EventHandler,
}

impl Subscription {
    /// Whether this subscription wants `event`.
    pub(crate) fn wants(&self, event: &Event) -> bool {
        if !channel_matches(&self.pattern, &event.channel) {
            return false;
        }
        if let Some(type_pattern) = &self.options.type_pattern {
            if !channel_matches(type_pattern, &event.event_type) {
                return false;
            }
        }
        if let Some(filter) = &self.options.filter {
            if !filter(event) {
                return false;
            }
        }
        true
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("pattern", &self.pattern)
            .field("options", &self.options)
            .finish()
    }
}
