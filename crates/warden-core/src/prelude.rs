//! Convenience re-exports for downstream crates.

pub use crate::agent::{AgentEntry, AgentLimits, TokenUsage};
pub use crate::error::{CoreError, CoreResult};
pub use crate::lifecycle::{AgentState, LifecycleEvent, LifecycleMachine};
pub use crate::manifest::AgentManifest;
pub use crate::types::{AgentId, EventId, NodeId, RequestId, Timestamp, TokenId, TrustLevel};
