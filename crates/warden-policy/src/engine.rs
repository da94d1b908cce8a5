//! The policy decision engine.
//!
//! Rules are compiled once into matchers; evaluation walks the compiled
//! lists in priority order and returns the first match, falling through
//! to the domain default. Shell operations additionally run the
//! cross-domain check: file arguments of known file-touching commands
//! are evaluated under the file rules, and any file block overrides the
//! shell decision.

use std::path::{Path, PathBuf};

use crate::error::PolicyResult;
use crate::normalize::{normalize_host, normalize_path};
use crate::pattern::{CommandPattern, HostPattern, PathPattern};
use crate::rules::{Decision, FileOperation, FileRule, NetworkRule, RuleSet, ShellRule};
use crate::shell::{self, TokenizeError};

/// An operation submitted for evaluation.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Operation {
    /// A file access.
    File {
        /// Path as supplied by the caller.
        path: String,
        /// The requested operation.
        operation: FileOperation,
        /// Acting agent, for decision records.
        #[serde(default)]
        agent_id: Option<String>,
    },
    /// A network access.
    Network {
        /// Destination host.
        #[serde(default)]
        host: Option<String>,
        /// Destination port.
        #[serde(default)]
        port: Option<u16>,
        /// URL scheme.
        #[serde(default)]
        scheme: Option<String>,
        /// Full URL; host/port/scheme are derived from it when absent.
        #[serde(default)]
        url: Option<String>,
        /// Acting agent, for decision records.
        #[serde(default)]
        agent_id: Option<String>,
    },
    /// A shell command.
    Shell {
        /// The command line.
        command: String,
        /// Pre-tokenized argv; when non-empty it is used as-is instead
        /// of tokenizing `command`.
        #[serde(default)]
        argv: Vec<String>,
        /// Working directory, used to absolutize relative path args.
        #[serde(default)]
        cwd: Option<String>,
        /// Acting agent, for decision records.
        #[serde(default)]
        agent_id: Option<String>,
    },
}

/// The result of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Evaluation {
    /// The decision.
    pub decision: Decision,
    /// Human-readable reason.
    pub reason: String,
    /// Id of the rule that matched, if any.
    pub matched_rule_id: Option<String>,
}

impl Evaluation {
    fn blocked_invalid() -> Self {
        Self {
            decision: Decision::Block,
            reason: "invalid operation".to_string(),
            matched_rule_id: None,
        }
    }
}

struct CompiledFileRule {
    id: String,
    pattern: PathPattern,
    operations: std::collections::BTreeSet<FileOperation>,
    decision: Decision,
    reason: Option<String>,
}

struct CompiledNetworkRule {
    id: String,
    host: HostPattern,
    ports: Option<crate::rules::PortRange>,
    scheme: Option<String>,
    decision: Decision,
    reason: Option<String>,
}

struct CompiledShellRule {
    id: String,
    pattern: CommandPattern,
    decision: Decision,
    reason: Option<String>,
}

/// The compiled, immutable policy engine.
///
/// Rebuild a new engine on config reload and swap the `Arc`; readers
/// never observe a partial rule set.
pub struct PolicyEngine {
    file_rules: Vec<CompiledFileRule>,
    file_default: Decision,
    network_rules: Vec<CompiledNetworkRule>,
    network_default: Decision,
    shell_rules: Vec<CompiledShellRule>,
    shell_default: Decision,
    home: Option<PathBuf>,
}

/// Sort rule indices by descending priority, declaration order breaking
/// ties (stable sort).
fn priority_order<T>(rules: &[T], priority: impl Fn(&T) -> i32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rules.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(priority(&rules[i])));
    order
}

impl PolicyEngine {
    /// Compile a rule set.
    ///
    /// # Errors
    ///
    /// Returns the first pattern compilation failure.
    pub fn new(rule_set: &RuleSet) -> PolicyResult<Self> {
        let mut file_rules = Vec::with_capacity(rule_set.file.rules.len());
        for idx in priority_order(&rule_set.file.rules, |r: &FileRule| r.priority) {
            let rule = &rule_set.file.rules[idx];
            file_rules.push(CompiledFileRule {
                id: rule.id.clone().unwrap_or_else(|| format!("file-{idx}")),
                pattern: PathPattern::new(&rule.pattern)?,
                operations: rule.operations.clone(),
                decision: rule.decision,
                reason: rule.reason.clone(),
            });
        }

        let mut network_rules = Vec::with_capacity(rule_set.network.rules.len());
        for idx in priority_order(&rule_set.network.rules, |r: &NetworkRule| r.priority) {
            let rule = &rule_set.network.rules[idx];
            network_rules.push(CompiledNetworkRule {
                id: rule.id.clone().unwrap_or_else(|| format!("network-{idx}")),
                host: HostPattern::new(&rule.host_pattern)?,
                ports: rule.ports,
                scheme: rule.scheme.as_ref().map(|s| s.to_ascii_lowercase()),
                decision: rule.decision,
                reason: rule.reason.clone(),
            });
        }

        let mut shell_rules = Vec::with_capacity(rule_set.shell.rules.len());
        for idx in priority_order(&rule_set.shell.rules, |r: &ShellRule| r.priority) {
            let rule = &rule_set.shell.rules[idx];
            shell_rules.push(CompiledShellRule {
                id: rule.id.clone().unwrap_or_else(|| format!("shell-{idx}")),
                pattern: CommandPattern::new(&rule.command_pattern)?,
                decision: rule.decision,
                reason: rule.reason.clone(),
            });
        }

        Ok(Self {
            file_rules,
            file_default: rule_set.file.default,
            network_rules,
            network_default: rule_set.network.default,
            shell_rules,
            shell_default: rule_set.shell.default,
            home: None,
        })
    }

    /// Set the home directory used for `~` expansion.
    #[must_use]
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = Some(home.into());
        self
    }

    /// Evaluate one operation. Pure; no I/O.
    #[must_use]
    pub fn evaluate(&self, operation: &Operation) -> Evaluation {
        match operation {
            Operation::File {
                path, operation, ..
            } => self.evaluate_file(path, *operation),
            Operation::Network {
                host,
                port,
                scheme,
                url,
                ..
            } => self.evaluate_network(host.as_deref(), *port, scheme.as_deref(), url.as_deref()),
            Operation::Shell {
                command, argv, cwd, ..
            } => self.evaluate_shell(command, argv, cwd.as_deref()),
        }
    }

    fn evaluate_file(&self, raw_path: &str, operation: FileOperation) -> Evaluation {
        if raw_path.trim().is_empty() {
            return Evaluation::blocked_invalid();
        }
        let path = normalize_path(raw_path, self.home.as_deref());
        let path_str = path.to_string_lossy();

        for rule in &self.file_rules {
            let covers_op = rule.operations.is_empty() || rule.operations.contains(&operation);
            if covers_op && rule.pattern.matches(&path_str) {
                return Evaluation {
                    decision: rule.decision,
                    reason: rule.reason.clone().unwrap_or_else(|| {
                        format!("file {} — {}", rule.decision, rule.pattern.as_str())
                    }),
                    matched_rule_id: Some(rule.id.clone()),
                };
            }
        }
        Evaluation {
            decision: self.file_default,
            reason: format!("file default {}", self.file_default),
            matched_rule_id: None,
        }
    }

    fn evaluate_network(
        &self,
        host: Option<&str>,
        port: Option<u16>,
        scheme: Option<&str>,
        url: Option<&str>,
    ) -> Evaluation {
        // Derive missing parts from the URL without pulling in a parser:
        // scheme://host[:port]/...
        let (mut host, mut port, mut scheme) = (
            host.map(str::to_string),
            port,
            scheme.map(str::to_string),
        );
        if let Some(url) = url {
            if let Some((parsed_scheme, rest)) = url.split_once("://") {
                scheme.get_or_insert_with(|| parsed_scheme.to_string());
                let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
                let authority = authority.rsplit('@').next().unwrap_or(authority);
                let (h, p) = match authority.rsplit_once(':') {
                    Some((h, p)) if p.chars().all(|c| c.is_ascii_digit()) && !p.is_empty() => {
                        (h, p.parse::<u16>().ok())
                    },
                    _ => (authority, None),
                };
                if !h.is_empty() {
                    host.get_or_insert_with(|| h.to_string());
                }
                if port.is_none() {
                    port = p;
                }
            }
        }

        let Some(host) = host.filter(|h| !h.trim().is_empty()) else {
            return Evaluation::blocked_invalid();
        };
        let host = normalize_host(&host);
        let scheme = scheme.map(|s| s.to_ascii_lowercase());

        for rule in &self.network_rules {
            if !rule.host.matches(&host) {
                continue;
            }
            // A port/scheme constraint only matches when the operation
            // declares one and it fits.
            if let Some(range) = rule.ports {
                match port {
                    Some(p) if range.contains(p) => {},
                    _ => continue,
                }
            }
            if let Some(rule_scheme) = &rule.scheme {
                match &scheme {
                    Some(s) if s == rule_scheme => {},
                    _ => continue,
                }
            }
            return Evaluation {
                decision: rule.decision,
                reason: rule.reason.clone().unwrap_or_else(|| {
                    format!("network {} — {}", rule.decision, rule.host.as_str())
                }),
                matched_rule_id: Some(rule.id.clone()),
            };
        }
        Evaluation {
            decision: self.network_default,
            reason: format!("network default {}", self.network_default),
            matched_rule_id: None,
        }
    }

    fn evaluate_shell(&self, command: &str, argv: &[String], cwd: Option<&str>) -> Evaluation {
        let segments = if argv.is_empty() {
            match shell::tokenize(command) {
                Ok(segments) => segments,
                Err(TokenizeError::Empty | TokenizeError::UnterminatedQuote) => {
                    return Evaluation::blocked_invalid();
                },
            }
        } else {
            vec![shell::CommandSegment {
                argv: argv.to_vec(),
            }]
        };

        let mut overall: Option<Evaluation> = None;
        for segment in &segments {
            // Cross-domain check first: a file block always wins.
            for access in shell::implied_file_access(segment) {
                let path = absolutize(&access.path, cwd);
                for op in &access.operations {
                    let file_eval = self.evaluate_file(&path, *op);
                    if file_eval.decision == Decision::Block {
                        return file_eval;
                    }
                }
            }

            let eval = self.evaluate_shell_segment(segment);
            overall = Some(match overall {
                None => eval,
                Some(prev) if eval.decision.stricter(prev.decision) == eval.decision => {
                    if eval.decision == prev.decision { prev } else { eval }
                },
                Some(prev) => prev,
            });
        }
        overall.unwrap_or_else(Evaluation::blocked_invalid)
    }

    fn evaluate_shell_segment(&self, segment: &shell::CommandSegment) -> Evaluation {
        let Some(basename) = segment.basename() else {
            return Evaluation::blocked_invalid();
        };
        let line = segment.line();

        for rule in &self.shell_rules {
            if rule.pattern.matches(basename) || rule.pattern.matches(&line) {
                return Evaluation {
                    decision: rule.decision,
                    reason: rule.reason.clone().unwrap_or_else(|| {
                        format!("shell {} — {}", rule.decision, rule.pattern.as_str())
                    }),
                    matched_rule_id: Some(rule.id.clone()),
                };
            }
        }
        Evaluation {
            decision: self.shell_default,
            reason: format!("shell default {}", self.shell_default),
            matched_rule_id: None,
        }
    }
}

fn absolutize(path: &str, cwd: Option<&str>) -> String {
    if path.starts_with('/') || path.starts_with('~') {
        return path.to_string();
    }
    match cwd {
        Some(cwd) => Path::new(cwd).join(path).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}
