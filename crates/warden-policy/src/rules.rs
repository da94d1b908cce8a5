//! Rule and rule-set types.
//!
//! A rule set has three ordered rule lists (file, network, shell), each
//! with a default decision. Rules are matched in priority order
//! (descending, declaration order breaking ties); the first match wins.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Permit the operation.
    Allow,
    /// Refuse the operation.
    #[default]
    Block,
    /// Refuse unless an out-of-band approval exists.
    ApprovalRequired,
}

impl Decision {
    /// Of two decisions, the stricter one (block > `approval_required`
    /// > allow).
    #[must_use]
    pub fn stricter(self, other: Self) -> Self {
        use Decision::{Allow, ApprovalRequired, Block};
        match (self, other) {
            (Block, _) | (_, Block) => Block,
            (ApprovalRequired, _) | (_, ApprovalRequired) => ApprovalRequired,
            (Allow, Allow) => Allow,
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allow => write!(f, "allow"),
            Self::Block => write!(f, "block"),
            Self::ApprovalRequired => write!(f, "approval_required"),
        }
    }
}

/// File operations a rule can cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileOperation {
    /// Read file contents.
    Read,
    /// Modify an existing file.
    Write,
    /// Enumerate a directory.
    List,
    /// Remove a file.
    Delete,
    /// Create a new file.
    Create,
}

impl std::fmt::Display for FileOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::List => "list",
            Self::Delete => "delete",
            Self::Create => "create",
        };
        write!(f, "{s}")
    }
}

/// A rule over file paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRule {
    /// Stable rule id; assigned positionally when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// Glob over the normalized absolute path (`**`, `*`, `?`).
    pub pattern: String,
    /// Operations this rule covers; empty/omitted means all.
    #[serde(default)]
    pub operations: BTreeSet<FileOperation>,
    /// The decision when this rule matches.
    #[serde(default)]
    pub decision: Decision,
    /// Reason attached to the decision.
    #[serde(default)]
    pub reason: Option<String>,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

/// An inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortRange {
    /// First port in the range.
    pub start: u16,
    /// Last port in the range (inclusive).
    pub end: u16,
}

impl PortRange {
    /// A range covering exactly one port.
    #[must_use]
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    /// Whether `port` falls inside the range.
    #[must_use]
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

/// A rule over network destinations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkRule {
    /// Stable rule id; assigned positionally when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// Glob over DNS labels (`*` matches one label, `**` any depth).
    pub host_pattern: String,
    /// Port range the rule covers; omitted means any port.
    #[serde(default)]
    pub ports: Option<PortRange>,
    /// URL scheme the rule covers; omitted means any scheme.
    #[serde(default)]
    pub scheme: Option<String>,
    /// The decision when this rule matches.
    #[serde(default)]
    pub decision: Decision,
    /// Reason attached to the decision.
    #[serde(default)]
    pub reason: Option<String>,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

/// A rule over shell commands.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellRule {
    /// Stable rule id; assigned positionally when omitted.
    #[serde(default)]
    pub id: Option<String>,
    /// Glob matched against `argv[0]`'s basename and against the whole
    /// command line.
    pub command_pattern: String,
    /// The decision when this rule matches.
    #[serde(default)]
    pub decision: Decision,
    /// Reason attached to the decision.
    #[serde(default)]
    pub reason: Option<String>,
    /// Higher priorities are evaluated first.
    #[serde(default)]
    pub priority: i32,
}

/// One domain's rules plus its default decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DomainRules<R> {
    /// Decision when no rule matches. Defaults to block (fail closed).
    pub default: Decision,
    /// Ordered rules.
    pub rules: Vec<R>,
}

impl<R> Default for DomainRules<R> {
    fn default() -> Self {
        Self {
            default: Decision::Block,
            rules: Vec::new(),
        }
    }
}

/// The complete rule set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RuleSet {
    /// File path rules.
    pub file: DomainRules<FileRule>,
    /// Network destination rules.
    pub network: DomainRules<NetworkRule>,
    /// Shell command rules.
    pub shell: DomainRules<ShellRule>,
}

impl RuleSet {
    /// A rule set that allows everything by default (development only).
    #[must_use]
    pub fn allow_all() -> Self {
        Self {
            file: DomainRules {
                default: Decision::Allow,
                rules: Vec::new(),
            },
            network: DomainRules {
                default: Decision::Allow,
                rules: Vec::new(),
            },
            shell: DomainRules {
                default: Decision::Allow,
                rules: Vec::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_block() {
        let rules: DomainRules<FileRule> = DomainRules::default();
        assert_eq!(rules.default, Decision::Block);
        assert!(rules.rules.is_empty());
    }

    #[test]
    fn test_stricter_ordering() {
        assert_eq!(Decision::Allow.stricter(Decision::Block), Decision::Block);
        assert_eq!(
            Decision::Allow.stricter(Decision::ApprovalRequired),
            Decision::ApprovalRequired
        );
        assert_eq!(
            Decision::Block.stricter(Decision::ApprovalRequired),
            Decision::Block
        );
        assert_eq!(Decision::Allow.stricter(Decision::Allow), Decision::Allow);
    }

    #[test]
    fn test_port_range() {
        let range = PortRange { start: 80, end: 443 };
        assert!(range.contains(80));
        assert!(range.contains(443));
        assert!(!range.contains(8080));
        assert!(PortRange::single(22).contains(22));
    }

    #[test]
    fn test_rule_set_deserializes_with_defaults() {
        let set: RuleSet = serde_yaml::from_str("file:\n  default: allow\n").unwrap();
        assert_eq!(set.file.default, Decision::Allow);
        assert_eq!(set.network.default, Decision::Block);
        assert_eq!(set.shell.default, Decision::Block);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<RuleSet, _> = serde_yaml::from_str("bogus: {}\n");
        assert!(result.is_err());
    }
}
