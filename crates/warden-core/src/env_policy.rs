//! Environment variable policy for sandboxed worker processes.
//!
//! Workers are started with an explicitly constructed environment:
//! a variable passes through only if it is on the allowlist AND not on
//! the blocklist. The sandbox then adds its own variables (`AGENT_ID`,
//! `CAPABILITIES`, `MODE`) on top.
//!
//! All spawn sites MUST build their environment through
//! [`sanitize_env`] rather than maintaining inline lists.

use std::collections::HashMap;

/// Variables that must never reach a worker, regardless of allowlists.
const BLOCKED_WORKER_ENV: &[&str] = &[
    // Provider credentials
    "OPENAI_API_KEY",
    "ANTHROPIC_API_KEY",
    "GEMINI_API_KEY",
    "COHERE_API_KEY",
    "HUGGINGFACE_TOKEN",
    // Cloud credentials
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GOOGLE_APPLICATION_CREDENTIALS",
    "AZURE_CLIENT_SECRET",
    "AZURE_TENANT_ID",
    // Forge tokens
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "GITLAB_TOKEN",
    // SSH agent
    "SSH_AUTH_SOCK",
    "SSH_AGENT_PID",
    // Control-plane secrets
    "PERMISSION_SIGNING_SECRET",
    "DATABASE_URL",
    // Execution control / code injection
    "NODE_OPTIONS",
    "NODE_PATH",
    "PYTHONSTARTUP",
    "PERL5LIB",
    "RUBYLIB",
    "BASH_ENV",
    "JAVA_TOOL_OPTIONS",
    "_JAVA_OPTIONS",
];

/// Prefixes blocked entirely (case-insensitive).
const BLOCKED_PREFIXES: &[&str] = &[
    "ld_",   // Linux dynamic linker
    "dyld_", // macOS dynamic linker
    "aws_", "azure_", "gcp_", // cloud credential families
    "warden_internal_",
];

/// Variables allowed through to workers when present.
const ALLOWED_WORKER_ENV: &[&str] = &[
    "PATH", "HOME", "USER", "SHELL", "TERM", "TZ", "LANG", "LC_ALL", "LC_CTYPE", "TMPDIR",
];

/// Returns `true` if `key` must not be passed to a worker.
#[must_use]
pub fn is_blocked_worker_env(key: &str) -> bool {
    if BLOCKED_WORKER_ENV.iter().any(|k| k.eq_ignore_ascii_case(key)) {
        return true;
    }
    let lower = key.to_ascii_lowercase();
    BLOCKED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// Returns `true` if `key` is on the pass-through allowlist.
#[must_use]
pub fn is_allowed_worker_env(key: &str) -> bool {
    ALLOWED_WORKER_ENV.iter().any(|k| k.eq_ignore_ascii_case(key))
}

/// Build a worker environment from the parent's.
///
/// Keeps allowlisted variables that are not blocked; drops everything
/// else. The result is a fresh map the caller extends with sandbox-set
/// variables.
#[must_use]
pub fn sanitize_env<'a, I>(parent: I) -> HashMap<String, String>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    parent
        .into_iter()
        .filter(|(k, _)| is_allowed_worker_env(k) && !is_blocked_worker_env(k))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
