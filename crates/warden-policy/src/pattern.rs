//! Compiled glob patterns for paths and hosts.
//!
//! Path globs use `/` as the separator: `*` stays within one path
//! component, `**` crosses components, `?` matches one character.
//!
//! Host globs treat DNS labels the way path globs treat components:
//! `*.example.com` matches `api.example.com` but not `a.b.example.com`;
//! `**.example.com` matches any depth. Internally the dots are mapped
//! to `/` so the same matcher semantics apply.

use globset::{Glob, GlobBuilder, GlobMatcher};

use crate::error::{PolicyError, PolicyResult};

/// A compiled glob over normalized absolute paths.
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    matcher: GlobMatcher,
}

impl PathPattern {
    /// Compile a path glob.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] if the glob is malformed.
    pub fn new(pattern: &str) -> PolicyResult<Self> {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| PolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `path` matches.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        self.matcher.is_match(path)
    }
}

/// A compiled glob over DNS hostnames.
#[derive(Debug, Clone)]
pub struct HostPattern {
    source: String,
    matcher: GlobMatcher,
}

impl HostPattern {
    /// Compile a host glob.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] if the glob is malformed.
    pub fn new(pattern: &str) -> PolicyResult<Self> {
        // Map label separators to `/` so `*` stays within one label.
        let translated = pattern.to_ascii_lowercase().replace('.', "/");
        let glob = GlobBuilder::new(&translated)
            .literal_separator(true)
            .build()
            .map_err(|e| PolicyError::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether the (already normalized) `host` matches.
    #[must_use]
    pub fn matches(&self, host: &str) -> bool {
        self.matcher.is_match(host.replace('.', "/"))
    }
}

/// A compiled glob for shell command patterns (no separator handling;
/// `*` crosses everything, suitable for whole-command-line matching).
#[derive(Debug, Clone)]
pub struct CommandPattern {
    source: String,
    matcher: GlobMatcher,
}

impl CommandPattern {
    /// Compile a command glob.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::InvalidPattern`] if the glob is malformed.
    pub fn new(pattern: &str) -> PolicyResult<Self> {
        let glob = Glob::new(pattern).map_err(|e| PolicyError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })?;
        Ok(Self {
            source: pattern.to_string(),
            matcher: glob.compile_matcher(),
        })
    }

    /// The original pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether `candidate` matches.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.matcher.is_match(candidate)
    }
}
