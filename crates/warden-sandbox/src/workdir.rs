//! Per-agent working directories.
//!
//! Every sandbox gets a fresh directory under
//! `<temp root>/warden-workers/<agent uuid>/`. The path is rebuilt
//! from the agent id (never from caller input) and verified to stay
//! under the root before any removal.

use std::path::{Path, PathBuf};

use warden_core::types::AgentId;

use crate::error::{SandboxError, SandboxResult};

/// Namespace directory under the temp root.
const WORKERS_DIR: &str = "warden-workers";

/// The working directory path for an agent (not created yet).
#[must_use]
pub fn workdir_path(temp_root: &Path, agent_id: &AgentId) -> PathBuf {
    temp_root.join(WORKERS_DIR).join(agent_id.0.to_string())
}

/// Create the working directory for an agent.
///
/// # Errors
///
/// [`SandboxError::Workdir`] on filesystem failure.
pub fn create_workdir(temp_root: &Path, agent_id: &AgentId) -> SandboxResult<PathBuf> {
    let path = workdir_path(temp_root, agent_id);
    std::fs::create_dir_all(&path)?;
    Ok(path)
}

/// Remove a working directory, refusing anything outside the root.
///
/// # Errors
///
/// [`SandboxError::WorkdirEscape`] when `path` does not live under
/// `<temp root>/warden-workers/`, [`SandboxError::Workdir`] on
/// filesystem failure.
pub fn remove_workdir(temp_root: &Path, path: &Path) -> SandboxResult<()> {
    if !path.exists() {
        return Ok(());
    }
    let root = temp_root.join(WORKERS_DIR);
    // Resolve symlinks before comparing; a link inside the root must
    // not smuggle a deletion outside it.
    let canonical = path.canonicalize()?;
    let canonical_root = root.canonicalize().unwrap_or(root);
    if !canonical.starts_with(&canonical_root) {
        return Err(SandboxError::WorkdirEscape {
            path: path.display().to_string(),
        });
    }
    std::fs::remove_dir_all(&canonical)?;
    Ok(())
}
