//! The event bus.

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace, warn};

use warden_core::types::{SubscriptionId, Timestamp};

use crate::event::Event;
use crate::pattern::channel_matches;
use crate::subscriber::{EventHandler, SubscribeOptions, Subscription};

/// Default bounded history capacity.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Subscribers the event was delivered to.
    pub delivered: usize,
    /// Handlers that panicked and were skipped.
    pub failed: usize,
}

/// Filter for history queries.
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    /// Channel pattern.
    pub channel: Option<String>,
    /// Type pattern.
    pub event_type: Option<String>,
    /// Only events at or after this time.
    pub since: Option<Timestamp>,
    /// Keep only the most recent `limit` matches.
    pub limit: Option<usize>,
}

/// Options for a replay.
#[derive(Debug, Clone, Default)]
pub struct ReplayOptions {
    /// Only events at or after this time.
    pub since: Option<Timestamp>,
    /// Only these event types (exact), when non-empty.
    pub types: Vec<String>,
}

/// Channel pub/sub with wildcard patterns, priority fan-out, bounded
/// history, and replay.
///
/// The subscriber list is copy-on-write: `subscribe`/`unsubscribe`
/// build a new `Arc<Vec<_>>` under a brief write lock, while `publish`
/// clones the `Arc` and walks it lock-free.
pub struct EventBus {
    subscribers: RwLock<Arc<Vec<Subscription>>>,
    history: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl EventBus {
    /// Bus with the default history capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_HISTORY_CAPACITY)
    }

    /// Bus with a custom history capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(Vec::new())),
            history: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity: capacity.max(1),
        }
    }

    fn snapshot(&self) -> Arc<Vec<Subscription>> {
        Arc::clone(
            &self
                .subscribers
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
        )
    }

    fn swap<F>(&self, edit: F)
    where
        F: FnOnce(&mut Vec<Subscription>),
    {
        let mut guard = self
            .subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut next: Vec<Subscription> = guard.as_ref().clone();
        edit(&mut next);
        // Keep delivery order: descending priority, insertion order on
        // ties (stable sort).
        next.sort_by_key(|s| std::cmp::Reverse(s.options.priority));
        *guard = Arc::new(next);
    }

    /// Publish an event: synchronous fan-out to matching subscribers in
    /// priority order, then append to history.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        trace!(channel = %event.channel, event_type = %event.event_type, "publishing event");

        let subscribers = self.snapshot();
        let mut delivered = 0usize;
        let mut failed = 0usize;
        let mut spent_once: Vec<SubscriptionId> = Vec::new();

        for subscription in subscribers.iter() {
            if !subscription.wants(&event) {
                continue;
            }
            if subscription.options.once && spent_once.contains(&subscription.id) {
                continue;
            }
            let handler = Arc::clone(&subscription.handler);
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(()) => delivered = delivered.saturating_add(1),
                Err(_) => {
                    failed = failed.saturating_add(1);
                    warn!(
                        subscription = %subscription.id,
                        channel = %event.channel,
                        "event handler panicked; skipping"
                    );
                },
            }
            if subscription.options.once {
                spent_once.push(subscription.id.clone());
            }
        }

        // `once` subscribers are removed after dispatch, whether their
        // handler succeeded or panicked.
        if !spent_once.is_empty() {
            self.swap(|subs| subs.retain(|s| !spent_once.contains(&s.id)));
        }

        {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if history.len() >= self.capacity {
                history.pop_front();
            }
            history.push_back(event);
        }

        debug!(delivered, failed, "event published");
        PublishOutcome { delivered, failed }
    }

    /// Register a subscriber. Returns its id.
    pub fn subscribe(
        &self,
        pattern: impl Into<String>,
        handler: EventHandler,
        options: SubscribeOptions,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        let subscription = Subscription {
            id: id.clone(),
            pattern: pattern.into(),
            options,
            handler,
        };
        self.swap(|subs| subs.push(subscription));
        id
    }

    /// Remove a subscription. Returns `false` when unknown.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut removed = false;
        self.swap(|subs| {
            let before = subs.len();
            subs.retain(|s| &s.id != id);
            removed = subs.len() != before;
        });
        removed
    }

    /// Remove every subscription registered with exactly `pattern`.
    /// Returns the count removed.
    pub fn unsubscribe_all(&self, pattern: &str) -> usize {
        let mut removed = 0usize;
        self.swap(|subs| {
            let before = subs.len();
            subs.retain(|s| s.pattern != pattern);
            removed = before.saturating_sub(subs.len());
        });
        removed
    }

    /// Current subscriber count.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.snapshot().len()
    }

    /// Query the bounded history ring, publication order.
    #[must_use]
    pub fn history(&self, query: &HistoryQuery) -> Vec<Event> {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let matches: Vec<Event> = history
            .iter()
            .filter(|e| {
                query
                    .channel
                    .as_deref()
                    .is_none_or(|p| channel_matches(p, &e.channel))
            })
            .filter(|e| {
                query
                    .event_type
                    .as_deref()
                    .is_none_or(|p| channel_matches(p, &e.event_type))
            })
            .filter(|e| query.since.is_none_or(|since| e.timestamp >= since))
            .cloned()
            .collect();
        match query.limit {
            Some(limit) if matches.len() > limit => {
                matches[matches.len().saturating_sub(limit)..].to_vec()
            },
            _ => matches,
        }
    }

    /// Redeliver history to one subscription, oldest first. Returns the
    /// number of events delivered.
    ///
    /// A `once` subscription receives at most one replayed event and is
    /// then removed, same as for live delivery.
    pub fn replay(&self, subscription_id: &SubscriptionId, options: &ReplayOptions) -> usize {
        let Some(subscription) = self
            .snapshot()
            .iter()
            .find(|s| &s.id == subscription_id)
            .cloned()
        else {
            return 0;
        };

        let events: Vec<Event> = {
            let history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            history
                .iter()
                .filter(|e| options.since.is_none_or(|since| e.timestamp >= since))
                .filter(|e| {
                    options.types.is_empty() || options.types.contains(&e.event_type)
                })
                .filter(|e| subscription.wants(e))
                .cloned()
                .collect()
        };

        let mut delivered = 0usize;
        for event in &events {
            let handler = Arc::clone(&subscription.handler);
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_ok() {
                delivered = delivered.saturating_add(1);
            }
            if subscription.options.once {
                self.unsubscribe(subscription_id);
                break;
            }
        }
        delivered
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> EventHandler {
        Arc::new(move |_e: &Event| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    fn event(channel: &str, event_type: &str) -> Event {
        Event::new(channel, event_type, serde_json::Value::Null)
    }

    #[test]
    fn test_publish_and_receive() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "agent.lifecycle",
            counting_handler(Arc::clone(&count)),
            SubscribeOptions::default(),
        );

        let outcome = bus.publish(event("agent.lifecycle", "agent.created"));
        assert_eq!(outcome.delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Non-matching channel is not delivered.
        bus.publish(event("alerts", "alert.raised"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_priority_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (name, priority) in [("low", -5), ("high", 10), ("mid", 0)] {
            let order = Arc::clone(&order);
            bus.subscribe(
                "*",
                Arc::new(move |_e: &Event| {
                    order.lock().unwrap().push(name);
                }),
                SubscribeOptions {
                    priority,
                    ..Default::default()
                },
            );
        }

        bus.publish(event("x", "y"));
        assert_eq!(*order.lock().unwrap(), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_once_subscriber_fires_at_most_once() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "agent.*",
            counting_handler(Arc::clone(&count)),
            SubscribeOptions {
                once: true,
                ..Default::default()
            },
        );

        bus.publish(event("agent.lifecycle", "agent.created"));
        bus.publish(event("agent.lifecycle", "agent.ready"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_panicking_handler_is_skipped() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            "*",
            Arc::new(|_e: &Event| panic!("handler bug")),
            SubscribeOptions {
                priority: 10,
                ..Default::default()
            },
        );
        bus.subscribe("*", counting_handler(Arc::clone(&count)), SubscribeOptions::default());

        let outcome = bus.publish(event("x", "y"));
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_type_pattern_and_filter() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe(
            "agent.lifecycle",
            counting_handler(Arc::clone(&count)),
            SubscribeOptions {
                type_pattern: Some("agent.created".into()),
                filter: Some(Arc::new(|e: &Event| e.agent_id.is_some())),
                ..Default::default()
            },
        );

        bus.publish(event("agent.lifecycle", "agent.ready"));
        bus.publish(event("agent.lifecycle", "agent.created"));
        bus.publish(
            Event::new("agent.lifecycle", "agent.created", serde_json::Value::Null)
                .with_agent("a1"),
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let id = bus.subscribe("*", counting_handler(Arc::clone(&count)), SubscribeOptions::default());

        assert!(bus.unsubscribe(&id));
        assert!(!bus.unsubscribe(&id));
        bus.publish(event("x", "y"));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unsubscribe_all_by_pattern() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.subscribe("agent.*", counting_handler(Arc::clone(&count)), SubscribeOptions::default());
        bus.subscribe("agent.*", counting_handler(Arc::clone(&count)), SubscribeOptions::default());
        bus.subscribe("alerts", counting_handler(Arc::clone(&count)), SubscribeOptions::default());

        assert_eq!(bus.unsubscribe_all("agent.*"), 2);
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_history_ring_is_bounded() {
        let bus = EventBus::with_capacity(3);
        for i in 0..5 {
            bus.publish(event("c", &format!("t{i}")));
        }
        let all = bus.history(&HistoryQuery::default());
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].event_type, "t2");
        assert_eq!(all[2].event_type, "t4");
    }

    #[test]
    fn test_history_filters() {
        let bus = EventBus::new();
        bus.publish(event("agent.lifecycle", "agent.created"));
        bus.publish(event("alerts", "alert.raised"));
        bus.publish(event("agent.lifecycle", "agent.ready"));

        let lifecycle = bus.history(&HistoryQuery {
            channel: Some("agent.lifecycle".into()),
            ..Default::default()
        });
        assert_eq!(lifecycle.len(), 2);

        let limited = bus.history(&HistoryQuery {
            channel: Some("agent.lifecycle".into()),
            limit: Some(1),
            ..Default::default()
        });
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].event_type, "agent.ready");
    }

    #[test]
    fn test_replay_in_order() {
        // Scenario 5: publish two lifecycle events, subscribe after the
        // fact, replay since before the first.
        let bus = EventBus::new();
        let before = Timestamp::now();
        bus.publish(event("agent.lifecycle", "agent.created"));
        bus.publish(event("agent.lifecycle", "agent.ready"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let id = bus.subscribe(
            "agent.lifecycle",
            Arc::new(move |e: &Event| {
                seen_clone.lock().unwrap().push(e.event_type.clone());
            }),
            SubscribeOptions::default(),
        );

        let count = bus.replay(
            &id,
            &ReplayOptions {
                since: Some(before),
                types: vec![],
            },
        );
        assert_eq!(count, 2);
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["agent.created".to_string(), "agent.ready".to_string()]
        );
    }

    #[test]
    fn test_replay_unknown_subscription() {
        let bus = EventBus::new();
        bus.publish(event("x", "y"));
        assert_eq!(bus.replay(&SubscriptionId::new(), &ReplayOptions::default()), 0);
    }
}
