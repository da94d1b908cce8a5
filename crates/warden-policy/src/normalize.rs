//! Path and host normalization.
//!
//! Normalization is purely lexical so the engine stays free of I/O.
//! Callers that evaluate paths which exist on disk must canonicalize
//! them first (resolving symlinks); only then is lexical `..` collapse
//! safe against link-hopping escapes.

use std::path::{Component, Path, PathBuf};

/// Normalize a path for rule matching.
///
/// - `~` and `~/...` expand against `home` when provided.
/// - `.` components are dropped.
/// - `..` pops the previous component; it never climbs above the root,
///   so an escape attempt collapses to the root instead of bypassing
///   rules anchored there.
#[must_use]
pub fn normalize_path(raw: &str, home: Option<&Path>) -> PathBuf {
    let expanded: PathBuf = if raw == "~" {
        home.map_or_else(|| PathBuf::from(raw), Path::to_path_buf)
    } else if let Some(rest) = raw.strip_prefix("~/") {
        home.map_or_else(|| PathBuf::from(raw), |h| h.join(rest))
    } else {
        PathBuf::from(raw)
    };

    let mut out = PathBuf::new();
    for component in expanded.components() {
        match component {
            Component::CurDir => {},
            Component::ParentDir => {
                // Never pop past the root.
                if !matches!(
                    out.components().next_back(),
                    None | Some(Component::RootDir | Component::Prefix(_))
                ) {
                    out.pop();
                }
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Normalize a hostname: lowercase, strip one trailing dot.
#[must_use]
pub fn normalize_host(raw: &str) -> String {
    let lower = raw.trim().to_ascii_lowercase();
    lower.strip_suffix('.').unwrap_or(&lower).to_string()
}
