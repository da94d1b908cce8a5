//! Warden Policy - the policy decision engine.
//!
//! Evaluates file, network, and shell operations against an ordered
//! rule set with per-domain defaults. First match wins; no match falls
//! through to the domain default; missing configuration fails closed.
//!
//! The engine is pure: same rule set and same operation always produce
//! the same decision, and evaluation performs no I/O. Path symlink
//! resolution is the caller's responsibility (see [`normalize`]).

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod engine;
pub mod error;
pub mod loader;
pub mod normalize;
pub mod pattern;
pub mod rules;
pub mod shell;

pub use engine::{Evaluation, Operation, PolicyEngine};
pub use error::{PolicyError, PolicyResult};
pub use loader::{load_rule_set, load_rule_set_str, RuleFileFormat};
pub use rules::{
    Decision, DomainRules, FileOperation, FileRule, NetworkRule, PortRange, RuleSet, ShellRule,
};
