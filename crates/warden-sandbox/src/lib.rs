//! Warden Sandbox - OS-process isolation for agent code.
//!
//! A sandbox hosts one agent's worker in a separate OS process with a
//! sanitized environment, memory and stack ceilings, a heartbeat, and
//! a private working directory under a namespaced temp root. The
//! parent speaks a typed JSON-lines protocol over the worker's
//! stdin/stdout. An optional container launch mode wraps the worker in
//! a locked-down `docker run` instead.
//!
//! The registry owns sandboxes by agent id; everything else refers to
//! them through the id, never through a direct pointer.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod container;
pub mod env;
pub mod error;
pub mod ipc;
pub mod process;
pub mod registry;
pub mod workdir;

pub use container::{ContainerNetwork, ContainerSpec};
pub use env::build_worker_env;
pub use error::{SandboxError, SandboxResult};
pub use ipc::{MessageKind, WorkerMessage};
pub use process::{ExecuteOutcome, LaunchMode, ProcessSandbox, SandboxConfig, SandboxState};
pub use registry::SandboxRegistry;
