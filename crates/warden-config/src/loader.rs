//! Layered configuration loading.
//!
//! Order, later layers winning:
//! 1. Built-in defaults ([`Config::default`])
//! 2. Config file (`warden.yaml` / `warden.json`, or `--config`)
//! 3. Environment variables (the documented `WARDEN`/`AGENT_*` set)
//! 4. CLI flag overrides ([`Overrides`])

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::secrets::SecretResolver;
use crate::types::Config;

/// CLI flag overrides applied as the final layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--host`
    pub host: Option<String>,
    /// `--port`
    pub port: Option<u16>,
    /// `--rules`
    pub rules_file: Option<std::path::PathBuf>,
    /// `--log-level`
    pub log_level: Option<String>,
    /// `--environment`
    pub environment: Option<String>,
}

/// Load configuration from an optional file, the process environment,
/// and CLI overrides.
///
/// # Errors
///
/// File read/parse failures, unusable environment values, or secret
/// resolution failures.
pub fn load(
    config_file: Option<&Path>,
    overrides: &Overrides,
    resolver: &SecretResolver,
) -> ConfigResult<Config> {
    let env: HashMap<String, String> = std::env::vars().collect();
    load_from(config_file, &env, overrides, resolver)
}

/// [`load`] with an explicit environment map (tests).
///
/// # Errors
///
/// Same as [`load`].
pub fn load_from(
    config_file: Option<&Path>,
    env: &HashMap<String, String>,
    overrides: &Overrides,
    resolver: &SecretResolver,
) -> ConfigResult<Config> {
    // 1. Defaults.
    let mut config = Config::default();

    // 2. File.
    if let Some(path) = config_file {
        config = parse_file(path)?;
        info!(path = %path.display(), "loaded config file");
    }

    // 3. Environment.
    apply_env(&mut config, env)?;

    // 4. Flags.
    if let Some(host) = &overrides.host {
        config.server.host.clone_from(host);
    }
    if let Some(port) = overrides.port {
        config.server.port = port;
    }
    if let Some(rules) = &overrides.rules_file {
        config.policy.rules_file = Some(rules.clone());
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level.clone_from(level);
    }
    if let Some(environment) = &overrides.environment {
        config.environment.clone_from(environment);
    }

    // Resolve the signing secret reference, if configured.
    if config.permissions.signing_secret.is_none() {
        if let Some(reference) = config.permissions.signing_secret_ref.clone() {
            config.permissions.signing_secret = Some(resolver.resolve(&reference)?);
        }
    }

    Ok(config)
}

fn parse_file(path: &Path) -> ConfigResult<Config> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadError {
        path: path.display().to_string(),
        source,
    })?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    } else {
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.display().to_string(),
            message: e.to_string(),
        })
    }
}

fn truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn parse_var<T: std::str::FromStr>(env: &HashMap<String, String>, var: &str) -> ConfigResult<Option<T>> {
    match env.get(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvValue {
                var: var.to_string(),
                message: format!("cannot parse `{raw}`"),
            }),
    }
}

#[allow(clippy::too_many_lines)]
fn apply_env(config: &mut Config, env: &HashMap<String, String>) -> ConfigResult<()> {
    if let Some(secret) = env.get("PERMISSION_SIGNING_SECRET") {
        config.permissions.signing_secret = Some(secret.clone());
    }
    if let Some(duration) = parse_var::<u64>(env, "PERMISSION_TOKEN_DURATION_MS")? {
        config.permissions.token_duration_ms = Some(duration);
    }
    if let Some(errors) = parse_var::<u32>(env, "MAX_AGENT_ERRORS")? {
        config.limits.max_agent_errors = errors;
    }
    if let Some(restarts) = parse_var::<u32>(env, "MAX_AGENT_RESTARTS")? {
        config.limits.max_agent_restarts = restarts;
    }
    if let Some(timeout) = parse_var::<u64>(env, "MAX_AGENT_TASK_TIMEOUT_MS")? {
        config.worker.max_task_timeout_ms = timeout;
    }
    if let Some(runtime) = env.get("AGENT_WORKER_RUNTIME") {
        config.worker.runtime = runtime.clone();
    }
    if let Some(image) = env.get("AGENT_WORKER_IMAGE") {
        config.worker.image = image.clone();
    }
    if let Some(disable) = env.get("AGENT_WORKER_DISABLE_NETWORK") {
        config.worker.disable_network = truthy(disable);
    }
    if let Some(proxy) = env.get("AGENT_EGRESS_PROXY_URL") {
        config.worker.egress_proxy_url = Some(proxy.clone());
    }
    if let Some(enforce) = env.get("ENFORCE_PRODUCTION_HARDENING") {
        config.enforce_production_hardening = truthy(enforce);
    }
    if let Some(allow) = env.get("ALLOW_UNSAFE_LOCAL_WORKERS") {
        config.allow_unsafe_local_workers = truthy(allow);
    }

    // Container lockdown flags.
    if let Some(readonly) = env.get("AGENT_WORKER_DOCKER_READONLY") {
        config.worker.docker.readonly_rootfs = truthy(readonly);
    }
    if let Some(nnp) = env.get("AGENT_WORKER_DOCKER_NO_NEW_PRIVS") {
        config.worker.docker.no_new_privileges = truthy(nnp);
    }
    if let Some(cap_drop) = env.get("AGENT_WORKER_DOCKER_CAP_DROP") {
        config.worker.docker.cap_drop_all = truthy(cap_drop);
    }
    if let Some(seccomp) = env.get("AGENT_WORKER_DOCKER_SECCOMP") {
        config.worker.docker.seccomp_profile =
            (!seccomp.trim().is_empty()).then(|| seccomp.clone());
    }
    if let Some(apparmor) = env.get("AGENT_WORKER_DOCKER_APPARMOR") {
        config.worker.docker.apparmor_profile =
            (!apparmor.trim().is_empty()).then(|| apparmor.clone());
    }
    if let Some(pids) = parse_var::<u32>(env, "AGENT_WORKER_DOCKER_PIDS_LIMIT")? {
        config.worker.docker.pids_limit = Some(pids);
    }
    if let Some(ulimits) = env.get("AGENT_WORKER_DOCKER_ULIMITS") {
        config.worker.docker.ulimits = ulimits
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(storage) = env.get("AGENT_WORKER_DOCKER_STORAGE_OPTS") {
        config.worker.docker.storage_opts =
            (!storage.trim().is_empty()).then(|| storage.clone());
    }
    if let Some(tmpfs) = env.get("AGENT_WORKER_DOCKER_TMPFS") {
        config.worker.docker.tmpfs = (!tmpfs.trim().is_empty()).then(|| tmpfs.clone());
    }
    if let Some(network) = env.get("AGENT_WORKER_DOCKER_NETWORK") {
        config.worker.docker.network = network.clone();
    }

    if let Some(level) = env.get("LOG_LEVEL") {
        config.logging.level = level.clone();
    }
    if let Some(url) = env.get("DATABASE_URL") {
        config.database.url = Some(url.clone());
    }
    if let Some(ssl) = env.get("DATABASE_SSL") {
        config.database.ssl = truthy(ssl);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.yaml");
        std::fs::write(&path, "logging:\n  level: warn\nworker:\n  runtime: local\n").unwrap();

        let env = env_of(&[("LOG_LEVEL", "debug"), ("AGENT_WORKER_RUNTIME", "docker")]);
        let config = load_from(
            Some(&path),
            &env,
            &Overrides::default(),
            &SecretResolver::new(),
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.worker.runtime, "docker");
    }

    #[test]
    fn test_flags_override_env() {
        let env = env_of(&[("LOG_LEVEL", "debug")]);
        let overrides = Overrides {
            log_level: Some("error".to_string()),
            port: Some(7000),
            ..Default::default()
        };
        let config = load_from(None, &env, &overrides, &SecretResolver::new()).unwrap();
        assert_eq!(config.logging.level, "error");
        assert_eq!(config.server.port, 7000);
    }

    #[test]
    fn test_documented_env_set() {
        let env = env_of(&[
            ("PERMISSION_SIGNING_SECRET", "0123456789abcdef0123456789abcdef"),
            ("PERMISSION_TOKEN_DURATION_MS", "60000"),
            ("MAX_AGENT_ERRORS", "7"),
            ("ENFORCE_PRODUCTION_HARDENING", "true"),
            ("AGENT_WORKER_DISABLE_NETWORK", "0"),
            ("AGENT_EGRESS_PROXY_URL", "http://proxy:3128"),
            ("AGENT_WORKER_DOCKER_PIDS_LIMIT", "64"),
            ("DATABASE_SSL", "on"),
        ]);
        let config = load_from(None, &env, &Overrides::default(), &SecretResolver::new()).unwrap();
        assert_eq!(
            config.permissions.signing_secret.as_deref(),
            Some("0123456789abcdef0123456789abcdef")
        );
        assert_eq!(config.permissions.token_duration_ms, Some(60_000));
        assert_eq!(config.limits.max_agent_errors, 7);
        assert!(config.enforce_production_hardening);
        assert!(!config.worker.disable_network);
        assert_eq!(config.worker.docker.pids_limit, Some(64));
        assert!(config.database.ssl);
    }

    #[test]
    fn test_bad_env_value_errors() {
        let env = env_of(&[("MAX_AGENT_ERRORS", "lots")]);
        let err = load_from(None, &env, &Overrides::default(), &SecretResolver::new()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnvValue { .. }));
    }

    #[test]
    fn test_secret_ref_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let secret_path = dir.path().join("signing.key");
        std::fs::write(&secret_path, "file-provided-signing-secret-000001").unwrap();

        let config_path = dir.path().join("warden.yaml");
        std::fs::write(
            &config_path,
            format!(
                "permissions:\n  signing_secret_ref:\n    type: file\n    key: {}\n",
                secret_path.display()
            ),
        )
        .unwrap();

        let config = load_from(
            Some(&config_path),
            &HashMap::new(),
            &Overrides::default(),
            &SecretResolver::new(),
        )
        .unwrap();
        assert_eq!(
            config.permissions.signing_secret.as_deref(),
            Some("file-provided-signing-secret-000001")
        );
    }

    #[test]
    fn test_missing_secret_ref_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("warden.yaml");
        std::fs::write(
            &config_path,
            "permissions:\n  signing_secret_ref:\n    type: file\n    key: /nonexistent\n",
        )
        .unwrap();

        let err = load_from(
            Some(&config_path),
            &HashMap::new(),
            &Overrides::default(),
            &SecretResolver::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::SecretResolution { .. }));
    }
}
