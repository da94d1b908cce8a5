//! Warden Events - channel pub/sub with wildcard patterns, bounded
//! history, and replay.
//!
//! Events live on dotted channels (`agent.lifecycle`). Subscribers
//! register a channel pattern, an optional type pattern and filter, a
//! priority, and a handler. Publication fans out synchronously in
//! descending priority order; a panicking handler is logged and
//! skipped, never propagated. The subscriber set is copy-on-write so
//! publishing never takes a lock.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod bus;
pub mod distributed;
pub mod event;
pub mod pattern;
pub mod subscriber;

pub use bus::{EventBus, HistoryQuery, PublishOutcome, ReplayOptions};
pub use distributed::{DistributedEventBus, RemoteTransport};
pub use event::Event;
pub use pattern::channel_matches;
pub use subscriber::{EventHandler, SubscribeOptions};
