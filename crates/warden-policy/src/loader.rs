//! Rule-set file loading.
//!
//! A rule-set file is a YAML or JSON document with top-level `file`,
//! `network`, and `shell` sections. The format is chosen by extension
//! (`.yaml`/`.yml`/`.json`), falling back to YAML, which also parses
//! JSON documents.

use std::path::Path;

use tracing::info;

use crate::error::{PolicyError, PolicyResult};
use crate::rules::RuleSet;

/// Supported rule file formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleFileFormat {
    /// YAML (also accepts JSON documents).
    Yaml,
    /// Strict JSON.
    Json,
}

impl RuleFileFormat {
    /// Choose the format from a file extension.
    #[must_use]
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parse a rule set from a string.
///
/// # Errors
///
/// Returns [`PolicyError::ParseError`] for malformed documents,
/// including unknown fields (fail closed on typos).
pub fn load_rule_set_str(content: &str, format: RuleFileFormat) -> PolicyResult<RuleSet> {
    match format {
        RuleFileFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| PolicyError::ParseError(e.to_string()))
        },
        RuleFileFormat::Json => {
            serde_json::from_str(content).map_err(|e| PolicyError::ParseError(e.to_string()))
        },
    }
}

/// Load a rule set from a file.
///
/// # Errors
///
/// Returns [`PolicyError::ReadError`] if the file cannot be read, or
/// [`PolicyError::ParseError`] for malformed documents.
pub fn load_rule_set(path: impl AsRef<Path>) -> PolicyResult<RuleSet> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| PolicyError::ReadError {
        path: path.display().to_string(),
        source,
    })?;
    let set = load_rule_set_str(&content, RuleFileFormat::from_path(path))?;
    info!(
        path = %path.display(),
        file_rules = set.file.rules.len(),
        network_rules = set.network.rules.len(),
        shell_rules = set.shell.rules.len(),
        "loaded rule set"
    );
    Ok(set)
}
