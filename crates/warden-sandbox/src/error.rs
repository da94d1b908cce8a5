//! Sandbox error types.

use thiserror::Error;

/// Result alias for sandbox operations.
pub type SandboxResult<T> = Result<T, SandboxError>;

/// Errors from sandbox lifecycle and execution.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The worker process could not be started.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The worker did not report ready within the startup timeout.
    #[error("worker did not become ready within {timeout_ms} ms")]
    StartupTimeout {
        /// The configured startup timeout.
        timeout_ms: u64,
    },

    /// The sandbox has been terminated.
    #[error("sandbox is terminated")]
    Terminated,

    /// The IPC channel to the worker broke.
    #[error("worker ipc failed: {0}")]
    Ipc(String),

    /// A working-directory path escaped the temp root.
    #[error("working directory {path} escapes the sandbox root")]
    WorkdirEscape {
        /// The offending path.
        path: String,
    },

    /// The working directory could not be created or removed.
    #[error("working directory error: {0}")]
    Workdir(#[from] std::io::Error),

    /// A sandbox already exists for this agent.
    #[error("sandbox already exists for agent {agent_id}")]
    AlreadyExists {
        /// The agent with the duplicate sandbox.
        agent_id: String,
    },

    /// No sandbox registered for this agent.
    #[error("no sandbox for agent {agent_id}")]
    NotFound {
        /// The agent without a sandbox.
        agent_id: String,
    },

    /// The entry point configuration is unusable.
    #[error("invalid entry point: {0}")]
    InvalidEntryPoint(String),
}
