//! The production hardening gate.
//!
//! Evaluated at startup when hardening is enforced (explicitly or by
//! the `production` environment label). Every check runs so the
//! operator sees the complete list; any failed *required* check
//! aborts startup before a listener is opened.

use serde::Serialize;

use crate::types::Config;

/// One evaluated check.
#[derive(Debug, Clone, Serialize)]
pub struct HardeningCheck {
    /// Stable check name.
    pub name: &'static str,
    /// Why the check failed.
    pub message: String,
    /// Required checks abort startup; optional ones log warnings.
    pub required: bool,
}

/// The gate's full result.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HardeningReport {
    /// Failed required checks.
    pub failures: Vec<HardeningCheck>,
    /// Failed optional checks.
    pub warnings: Vec<HardeningCheck>,
}

impl HardeningReport {
    /// Whether startup may proceed.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.failures.is_empty()
    }

    fn required(&mut self, name: &'static str, message: impl Into<String>) {
        self.failures.push(HardeningCheck {
            name,
            message: message.into(),
            required: true,
        });
    }

    fn optional(&mut self, name: &'static str, message: impl Into<String>) {
        self.warnings.push(HardeningCheck {
            name,
            message: message.into(),
            required: false,
        });
    }
}

/// Placeholder secrets that must never reach production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "changeme",
    "change-me",
    "secret",
    "dev-secret",
    "development",
    "insecure",
    "test",
];

/// Evaluate every hardening check against `config`.
#[must_use]
#[allow(clippy::too_many_lines)]
pub fn evaluate_hardening(config: &Config) -> HardeningReport {
    let mut report = HardeningReport::default();

    // Container runtime.
    if config.worker.runtime != "docker" {
        if config.allow_unsafe_local_workers {
            report.optional(
                "worker_runtime",
                "bare-process workers permitted by ALLOW_UNSAFE_LOCAL_WORKERS",
            );
        } else {
            report.required(
                "worker_runtime",
                format!(
                    "container runtime required in production (got `{}`); set AGENT_WORKER_RUNTIME=docker or ALLOW_UNSAFE_LOCAL_WORKERS",
                    config.worker.runtime
                ),
            );
        }
    }

    // Container lockdown flags (only meaningful with a container
    // runtime, but evaluated unconditionally so the report is
    // complete).
    let docker = &config.worker.docker;
    if !docker.readonly_rootfs {
        report.required("docker_readonly_rootfs", "read-only root filesystem disabled");
    }
    if !docker.no_new_privileges {
        report.required("docker_no_new_privileges", "no-new-privileges disabled");
    }
    if !docker.cap_drop_all {
        report.required("docker_cap_drop", "capabilities are not dropped");
    }
    if docker.seccomp_profile.is_none() {
        report.required("docker_seccomp", "no seccomp profile configured");
    }
    if docker.apparmor_profile.is_none() {
        report.optional("docker_apparmor", "no AppArmor profile configured");
    }
    if docker.pids_limit.is_none() {
        report.required("docker_pids_limit", "no pids limit configured");
    }
    if docker.ulimits.is_empty() {
        report.required("docker_ulimits", "no ulimits configured");
    }
    if docker.storage_opts.is_none() {
        report.required("docker_storage", "no storage quota configured");
    }

    // Egress policy: fully disabled network, or a declared proxy.
    let egress_ok = (config.worker.disable_network && docker.network == "none")
        || config.worker.egress_proxy_url.is_some();
    if !egress_ok {
        report.required(
            "egress_policy",
            "network must be disabled or AGENT_EGRESS_PROXY_URL must be set",
        );
    }

    // Log level.
    let level = config.logging.level.to_ascii_lowercase();
    if level == "debug" || level == "trace" {
        report.required("log_level", format!("log level `{level}` leaks detail in production"));
    }

    // Signing secret.
    match config.permissions.signing_secret.as_deref() {
        None => report.required("signing_secret", "PERMISSION_SIGNING_SECRET is not set"),
        Some(secret) if secret.len() < 32 => {
            report.required(
                "signing_secret",
                format!("signing secret is {} chars; at least 32 required", secret.len()),
            );
        },
        Some(secret)
            if PLACEHOLDER_SECRETS
                .iter()
                .any(|p| secret.to_ascii_lowercase().contains(p)) =>
        {
            report.required("signing_secret", "signing secret looks like a placeholder");
        },
        Some(_) => {},
    }

    // Database SSL for remote databases.
    if let Some(url) = &config.database.url {
        let local = url.contains("localhost") || url.contains("127.0.0.1");
        if !local && !config.database.ssl {
            report.required("database_ssl", "remote database without DATABASE_SSL");
        }
    }

    // Policy default must fail closed.
    if config.policy.default_decision != "block" {
        report.required(
            "policy_default",
            format!(
                "policy default must be `block` in production (got `{}`)",
                config.policy.default_decision
            ),
        );
    }

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn production_ready() -> Config {
        let mut config = Config::default();
        config.environment = "production".to_string();
        config.worker.runtime = "docker".to_string();
        config.permissions.signing_secret =
            Some("a-long-random-production-signing-secret-42".to_string());
        config
    }

    #[test]
    fn test_production_ready_passes() {
        let report = evaluate_hardening(&production_ready());
        assert!(report.ok(), "unexpected failures: {:?}", report.failures);
        // AppArmor missing is only a warning.
        assert!(report.warnings.iter().any(|w| w.name == "docker_apparmor"));
    }

    #[test]
    fn test_scenario_local_runtime_no_proxy_fails() {
        // Scenario 6: hardening on, local runtime, no egress proxy.
        let mut config = Config::default();
        config.enforce_production_hardening = true;
        config.worker.runtime = "local".to_string();
        config.worker.disable_network = false;
        config.worker.egress_proxy_url = None;

        let report = evaluate_hardening(&config);
        assert!(!report.ok());
        let names: Vec<&str> = report.failures.iter().map(|f| f.name).collect();
        assert!(names.contains(&"worker_runtime"));
        assert!(names.contains(&"egress_policy"));
        assert!(names.contains(&"signing_secret"));
    }

    #[test]
    fn test_unsafe_local_workers_escape_hatch() {
        let mut config = production_ready();
        config.worker.runtime = "local".to_string();
        config.allow_unsafe_local_workers = true;
        let report = evaluate_hardening(&config);
        assert!(report.ok());
        assert!(report.warnings.iter().any(|w| w.name == "worker_runtime"));
    }

    #[test]
    fn test_weak_secret_fails() {
        let mut config = production_ready();
        config.permissions.signing_secret = Some("short".to_string());
        assert!(!evaluate_hardening(&config).ok());

        config.permissions.signing_secret =
            Some("dev-secret-dev-secret-dev-secret-dev".to_string());
        let report = evaluate_hardening(&config);
        assert!(report
            .failures
            .iter()
            .any(|f| f.name == "signing_secret" && f.message.contains("placeholder")));
    }

    #[test]
    fn test_debug_logging_fails() {
        let mut config = production_ready();
        config.logging.level = "debug".to_string();
        assert!(!evaluate_hardening(&config).ok());
    }

    #[test]
    fn test_remote_database_needs_ssl() {
        let mut config = production_ready();
        config.database.url = Some("postgres://warden@db.internal:5432/warden".to_string());
        config.database.ssl = false;
        assert!(!evaluate_hardening(&config).ok());

        config.database.ssl = true;
        assert!(evaluate_hardening(&config).ok());

        // Local databases are exempt.
        config.database.url = Some("postgres://warden@localhost/warden".to_string());
        config.database.ssl = false;
        assert!(evaluate_hardening(&config).ok());
    }

    #[test]
    fn test_permissive_policy_default_fails() {
        let mut config = production_ready();
        config.policy.default_decision = "allow".to_string();
        let report = evaluate_hardening(&config);
        assert!(report.failures.iter().any(|f| f.name == "policy_default"));
    }

    #[test]
    fn test_missing_container_flags_fail() {
        let mut config = production_ready();
        config.worker.docker.readonly_rootfs = false;
        config.worker.docker.pids_limit = None;
        let report = evaluate_hardening(&config);
        let names: Vec<&str> = report.failures.iter().map(|f| f.name).collect();
        assert!(names.contains(&"docker_readonly_rootfs"));
        assert!(names.contains(&"docker_pids_limit"));
    }
}
