//! Warden Runtime - the coordination layer.
//!
//! Hosts the token-bucket rate limiter (local and store-backed), the
//! no-overlap job scheduler, and the agent registry that serializes
//! lifecycle transitions, tracks error thresholds, and publishes
//! every transition on the event bus.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod agents;
pub mod error;
pub mod monitor;
pub mod ratelimit;
pub mod scheduler;

pub use agents::AgentRegistry;
pub use error::{RuntimeError, RuntimeResult};
pub use monitor::sweep_agents;
pub use ratelimit::{
    BucketSnapshot, LocalRateLimiter, RateLimitConfig, RateLimiter, StoreRateLimiter,
};
pub use scheduler::{LockProvider, Scheduler};
