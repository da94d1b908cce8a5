//! Secret redaction.
//!
//! Redaction runs once, before any sink receives an entry. Keys whose
//! names match a secret pattern have their values replaced recursively
//! through nested objects and arrays. The pattern list is configurable
//! so deployments can extend it without a rebuild.

use regex::Regex;
use serde_json::Value;

/// Replacement text for redacted values.
pub const REDACTED: &str = "[REDACTED]";

/// Default secret key patterns.
const DEFAULT_PATTERNS: &[&str] = &[
    r"(?i)secret",
    r"(?i)token",
    r"(?i)password",
    r"(?i)api[-_]?key",
    r"(?i)authorization",
    r"(?i)private[-_]?key",
    r"(?i)credential",
];

/// Redacts secret-bearing keys from detail payloads.
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    /// Redactor with the default pattern set.
    #[must_use]
    pub fn new() -> Self {
        Self::with_patterns(DEFAULT_PATTERNS.iter().map(|s| (*s).to_string()))
    }

    /// Redactor with custom patterns; invalid patterns are dropped with
    /// a warning rather than disabling redaction entirely.
    #[must_use]
    pub fn with_patterns(patterns: impl IntoIterator<Item = String>) -> Self {
        let compiled = patterns
            .into_iter()
            .filter_map(|p| match Regex::new(&p) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    tracing::warn!(pattern = %p, error = %e, "dropping invalid redaction pattern");
                    None
                },
            })
            .collect();
        Self { patterns: compiled }
    }

    /// Whether a key name looks secret-bearing.
    #[must_use]
    pub fn is_secret_key(&self, key: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(key))
    }

    /// Redact a value tree in place.
    pub fn redact(&self, value: &mut Value) {
        match value {
            Value::Object(map) => {
                for (key, nested) in map.iter_mut() {
                    if self.is_secret_key(key) {
                        *nested = Value::String(REDACTED.to_string());
                    } else {
                        self.redact(nested);
                    }
                }
            },
            Value::Array(items) => {
                for item in items.iter_mut() {
                    self.redact(item);
                }
            },
            _ => {},
        }
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}
