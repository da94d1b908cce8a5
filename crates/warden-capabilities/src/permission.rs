//! The permission model.
//!
//! A permission is `{category, actions, resource}`. Resources without
//! glob characters match exactly and as a `/`-separated prefix; globbed
//! resources match through the same `**`/`*`/`?` semantics as policy
//! path patterns.

use std::collections::BTreeSet;

use globset::GlobBuilder;
use serde::{Deserialize, Serialize};

use crate::error::{CapabilityError, CapabilityResult};

/// The operation classes a permission can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityCategory {
    /// File reads and writes.
    Filesystem,
    /// Outbound network access.
    Network,
    /// Shell command execution.
    Shell,
    /// Tool invocation.
    Tools,
    /// Agent memory operations.
    Memory,
    /// LLM completions.
    Llm,
    /// Secret material access.
    Secrets,
    /// Operations on other agents.
    Agents,
    /// Administrative operations.
    Admin,
    /// Control-plane internals.
    System,
    /// Skill invocation.
    Skill,
    /// Social / messaging surfaces.
    Social,
}

impl CapabilityCategory {
    /// The wire name of the category.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Shell => "shell",
            Self::Tools => "tools",
            Self::Memory => "memory",
            Self::Llm => "llm",
            Self::Secrets => "secrets",
            Self::Agents => "agents",
            Self::Admin => "admin",
            Self::System => "system",
            Self::Skill => "skill",
            Self::Social => "social",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "filesystem" | "fs" => Some(Self::Filesystem),
            "network" => Some(Self::Network),
            "shell" => Some(Self::Shell),
            "tools" => Some(Self::Tools),
            "memory" => Some(Self::Memory),
            "llm" => Some(Self::Llm),
            "secrets" => Some(Self::Secrets),
            "agents" => Some(Self::Agents),
            "admin" => Some(Self::Admin),
            "system" => Some(Self::System),
            "skill" => Some(Self::Skill),
            "social" => Some(Self::Social),
            _ => None,
        }
    }
}

impl std::fmt::Display for CapabilityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One granted permission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permission {
    /// The operation class.
    pub category: CapabilityCategory,
    /// Action names within the category (e.g. `read`, `write`).
    pub actions: BTreeSet<String>,
    /// Resource scope; `None` covers every resource in the category.
    #[serde(default)]
    pub resource: Option<String>,
}

impl Permission {
    /// Build a permission over a single action.
    #[must_use]
    pub fn new(
        category: CapabilityCategory,
        actions: impl IntoIterator<Item = impl Into<String>>,
        resource: Option<String>,
    ) -> Self {
        Self {
            category,
            actions: actions.into_iter().map(Into::into).collect(),
            resource,
        }
    }

    /// Parse a compact spec: `category.action:resource` or
    /// `category.action` (action may be a `+`-joined list).
    ///
    /// # Errors
    ///
    /// [`CapabilityError::MalformedSpec`] for anything else.
    pub fn parse_spec(spec: &str) -> CapabilityResult<Self> {
        let malformed = || CapabilityError::MalformedSpec {
            spec: spec.to_string(),
        };
        let (head, resource) = match spec.split_once(':') {
            Some((head, resource)) if !resource.is_empty() => (head, Some(resource.to_string())),
            Some(_) => return Err(malformed()),
            None => (spec, None),
        };
        let (category, actions) = head.split_once('.').ok_or_else(malformed)?;
        let category = CapabilityCategory::parse(category).ok_or_else(malformed)?;
        let actions: BTreeSet<String> = actions
            .split('+')
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        if actions.is_empty() {
            return Err(malformed());
        }
        Ok(Self {
            category,
            actions,
            resource,
        })
    }

    /// Whether this permission covers `(category, action, resource)`.
    #[must_use]
    pub fn covers(&self, category: CapabilityCategory, action: &str, resource: Option<&str>) -> bool {
        if self.category != category || !self.actions.contains(action) {
            return false;
        }
        match (&self.resource, resource) {
            (None, _) => true,
            // A scoped permission cannot cover an unscoped request.
            (Some(_), None) => false,
            (Some(granted), Some(requested)) => resource_matches(granted, requested),
        }
    }

    /// Whether this permission's scope is a superset of `other`'s.
    ///
    /// Used for delegation checks: categories must match, the action
    /// set must contain the other's, and every resource the other can
    /// reach must be covered here. Glob-vs-glob containment is
    /// approximated by pattern equality.
    #[must_use]
    pub fn is_superset_of(&self, other: &Self) -> bool {
        if self.category != other.category || !self.actions.is_superset(&other.actions) {
            return false;
        }
        match (&self.resource, &other.resource) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(theirs)) => {
                mine == theirs || (!has_glob(theirs) && resource_matches(mine, theirs))
            },
        }
    }
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(String::as_str).collect();
        write!(f, "{}.{}", self.category, actions.join("+"))?;
        if let Some(resource) = &self.resource {
            write!(f, ":{resource}")?;
        }
        Ok(())
    }
}

/// Whether `pattern` contains glob metacharacters.
#[must_use]
pub fn has_glob(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// Match a granted resource against a requested one.
///
/// Literal patterns match exactly and as a `/`-separated prefix;
/// glob patterns match with `/` as the separator (`*` stays within a
/// segment, `**` crosses segments).
#[must_use]
pub fn resource_matches(granted: &str, requested: &str) -> bool {
    if !has_glob(granted) {
        return granted == requested
            || requested
                .strip_prefix(granted)
                .is_some_and(|rest| rest.starts_with('/'));
    }
    GlobBuilder::new(granted)
        .literal_separator(true)
        .build()
        .map(|g| g.compile_matcher().is_match(requested))
        .unwrap_or(false)
}

/// Expand a filesystem permission's literal resource into its glob
/// twin: `P` becomes `{P, P/**}`. Globbed resources are kept verbatim;
/// other categories pass through unchanged.
#[must_use]
pub fn expand_filesystem_resource(permission: &Permission) -> Vec<Permission> {
    let Some(resource) = &permission.resource else {
        return vec![permission.clone()];
    };
    if permission.category != CapabilityCategory::Filesystem || has_glob(resource) {
        return vec![permission.clone()];
    }
    let twin = Permission {
        category: permission.category,
        actions: permission.actions.clone(),
        resource: Some(format!("{}/**", resource.trim_end_matches('/'))),
    };
    vec![permission.clone(), twin]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_spec_with_resource() {
        let p = Permission::parse_spec("filesystem.read:/tmp").unwrap();
        assert_eq!(p.category, CapabilityCategory::Filesystem);
        assert!(p.actions.contains("read"));
        assert_eq!(p.resource.as_deref(), Some("/tmp"));
    }

    #[test]
    fn test_parse_spec_multi_action() {
        let p = Permission::parse_spec("filesystem.read+write:/workspace").unwrap();
        assert!(p.actions.contains("read"));
        assert!(p.actions.contains("write"));
    }

    #[test]
    fn test_parse_spec_without_resource() {
        let p = Permission::parse_spec("llm.complete").unwrap();
        assert_eq!(p.category, CapabilityCategory::Llm);
        assert!(p.resource.is_none());
    }

    #[test]
    fn test_parse_spec_rejects_garbage() {
        assert!(Permission::parse_spec("noaction").is_err());
        assert!(Permission::parse_spec("bogus.read").is_err());
        assert!(Permission::parse_spec("filesystem.read:").is_err());
    }

    #[test]
    fn test_literal_resource_prefix_matching() {
        assert!(resource_matches("/workspace", "/workspace"));
        assert!(resource_matches("/workspace", "/workspace/src/app.ts"));
        assert!(!resource_matches("/workspace", "/workspace2/x"));
        assert!(!resource_matches("/workspace", "/other"));
    }

    #[test]
    fn test_glob_resource_matching() {
        assert!(resource_matches("/workspace/**", "/workspace/src/app.ts"));
        assert!(!resource_matches("/workspace/*", "/workspace/src/app.ts"));
        assert!(resource_matches("mcp://*", "mcp://filesystem"));
    }

    #[test]
    fn test_covers() {
        let p = Permission::parse_spec("filesystem.read:/workspace").unwrap();
        assert!(p.covers(CapabilityCategory::Filesystem, "read", Some("/workspace/a")));
        assert!(!p.covers(CapabilityCategory::Filesystem, "write", Some("/workspace/a")));
        assert!(!p.covers(CapabilityCategory::Network, "read", Some("/workspace/a")));
        assert!(!p.covers(CapabilityCategory::Filesystem, "read", None));
    }

    #[test]
    fn test_unscoped_permission_covers_everything_in_category() {
        let p = Permission::parse_spec("agents.spawn").unwrap();
        assert!(p.covers(CapabilityCategory::Agents, "spawn", None));
        assert!(p.covers(CapabilityCategory::Agents, "spawn", Some("agent-x")));
    }

    #[test]
    fn test_superset() {
        let broad = Permission::parse_spec("filesystem.read+write:/workspace").unwrap();
        let narrow = Permission::parse_spec("filesystem.read:/workspace/src").unwrap();
        assert!(broad.is_superset_of(&narrow));
        assert!(!narrow.is_superset_of(&broad));

        let unscoped = Permission::parse_spec("filesystem.read").unwrap();
        assert!(unscoped.is_superset_of(&narrow));
    }

    #[test]
    fn test_filesystem_expansion() {
        let p = Permission::parse_spec("filesystem.read:/workspace").unwrap();
        let expanded = expand_filesystem_resource(&p);
        assert_eq!(expanded.len(), 2);
        assert_eq!(expanded[1].resource.as_deref(), Some("/workspace/**"));

        // Globbed resources are kept verbatim.
        let globbed = Permission::parse_spec("filesystem.read:/workspace/*").unwrap();
        assert_eq!(expand_filesystem_resource(&globbed).len(), 1);

        // Other categories are untouched.
        let net = Permission::parse_spec("network.connect:api.example.com").unwrap();
        assert_eq!(expand_filesystem_resource(&net).len(), 1);
    }

    #[test]
    fn test_display_roundtrip() {
        let p = Permission::parse_spec("filesystem.read+write:/tmp").unwrap();
        let shown = p.to_string();
        let reparsed = Permission::parse_spec(&shown).unwrap();
        assert_eq!(p, reparsed);
    }
}
