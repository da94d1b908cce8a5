//! Runtime error types.

use thiserror::Error;

use warden_core::lifecycle::LifecycleError;

/// Result alias for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors from the coordination layer.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// No such agent.
    #[error("agent not found: {agent_id}")]
    AgentNotFound {
        /// The missing agent.
        agent_id: String,
    },

    /// A lifecycle transition was rejected.
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    /// A job id was registered twice.
    #[error("job already registered: {job_id}")]
    JobExists {
        /// The duplicate id.
        job_id: String,
    },

    /// No such job.
    #[error("job not found: {job_id}")]
    JobNotFound {
        /// The missing id.
        job_id: String,
    },

    /// The store-backed rate limiter hit a storage failure.
    #[error("rate limit store error: {0}")]
    Store(String),
}
