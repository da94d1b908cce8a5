//! Warden Core - Foundation types for the Warden agent control plane.
//!
//! This crate provides:
//! - Newtype identifiers used throughout the runtime
//! - The agent lifecycle state machine and transition history
//! - Agent records, limits, and usage accounting
//! - The agent manifest accepted at spawn time
//! - The environment sanitization policy for spawned workers
//! - Retry utilities with jittered exponential backoff

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod prelude;

pub mod agent;
pub mod env_policy;
pub mod error;
pub mod lifecycle;
pub mod manifest;
pub mod retry;
pub mod types;

pub use agent::{AgentEntry, AgentLimits, TokenUsage, UsageWindow, WorkerTask};
pub use error::{CoreError, CoreResult};
pub use lifecycle::{
    AgentState, LifecycleError, LifecycleEvent, LifecycleMachine, TransitionRecord,
};
pub use manifest::{AgentManifest, ManifestLimits};
pub use retry::{RetryConfig, retry};
pub use types::{AgentId, EventId, NodeId, RequestId, SubscriptionId, Timestamp, TokenId, TrustLevel};
