//! Secret references and resolution.
//!
//! Config files never hold secret material directly in production;
//! they hold references resolved at startup through registered
//! providers. The `vault` provider is a seam: deployments inject
//! their own implementation, and an unresolvable reference aborts
//! startup.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};

/// An indirect secret reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretRef {
    /// Provider kind: `env`, `file`, or `vault`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Provider-specific key (variable name, path, vault key).
    pub key: String,
    /// Vault address or mount, for the vault provider.
    #[serde(default)]
    pub vault: Option<String>,
}

/// A secret provider.
pub trait SecretProvider: Send + Sync {
    /// Resolve `reference` to the secret value.
    ///
    /// # Errors
    ///
    /// A provider-specific message when the secret cannot be read.
    fn resolve(&self, reference: &SecretRef) -> Result<String, String>;
}

struct EnvProvider;

impl SecretProvider for EnvProvider {
    fn resolve(&self, reference: &SecretRef) -> Result<String, String> {
        std::env::var(&reference.key).map_err(|_| format!("variable {} not set", reference.key))
    }
}

struct FileProvider;

impl SecretProvider for FileProvider {
    fn resolve(&self, reference: &SecretRef) -> Result<String, String> {
        std::fs::read_to_string(&reference.key)
            .map(|s| s.trim_end().to_string())
            .map_err(|e| e.to_string())
    }
}

/// Registry of secret providers.
pub struct SecretResolver {
    providers: HashMap<String, Box<dyn SecretProvider>>,
}

impl SecretResolver {
    /// Resolver with the built-in `env` and `file` providers.
    #[must_use]
    pub fn new() -> Self {
        let mut providers: HashMap<String, Box<dyn SecretProvider>> = HashMap::new();
        providers.insert("env".to_string(), Box::new(EnvProvider));
        providers.insert("file".to_string(), Box::new(FileProvider));
        Self { providers }
    }

    /// Register (or replace) a provider for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, provider: Box<dyn SecretProvider>) {
        self.providers.insert(kind.into(), provider);
    }

    /// Resolve one reference.
    ///
    /// # Errors
    ///
    /// [`ConfigError::SecretResolution`] for unknown providers or
    /// provider failures.
    pub fn resolve(&self, reference: &SecretRef) -> ConfigResult<String> {
        let provider = self.providers.get(&reference.kind).ok_or_else(|| {
            ConfigError::SecretResolution {
                provider: reference.kind.clone(),
                key: reference.key.clone(),
                message: format!("provider `{}` not configured", reference.kind),
            }
        })?;
        provider
            .resolve(reference)
            .map_err(|message| ConfigError::SecretResolution {
                provider: reference.kind.clone(),
                key: reference.key.clone(),
                message,
            })
    }
}

impl Default for SecretResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SecretResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.providers.keys().collect();
        kinds.sort();
        f.debug_struct("SecretResolver").field("providers", &kinds).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_provider() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("secret");
        std::fs::write(&path, "the-secret-value\n").unwrap();

        let resolver = SecretResolver::new();
        let value = resolver
            .resolve(&SecretRef {
                kind: "file".to_string(),
                key: path.display().to_string(),
                vault: None,
            })
            .unwrap();
        assert_eq!(value, "the-secret-value");
    }

    #[test]
    fn test_missing_file_errors() {
        let resolver = SecretResolver::new();
        let err = resolver
            .resolve(&SecretRef {
                kind: "file".to_string(),
                key: "/nonexistent/secret".to_string(),
                vault: None,
            })
            .unwrap_err();
        assert!(matches!(err, ConfigError::SecretResolution { .. }));
    }

    #[test]
    fn test_vault_requires_registration() {
        let resolver = SecretResolver::new();
        let err = resolver
            .resolve(&SecretRef {
                kind: "vault".to_string(),
                key: "kv/warden/signing".to_string(),
                vault: Some("https://vault.internal".to_string()),
            })
            .unwrap_err();
        assert!(err.to_string().contains("not configured"));

        struct StaticVault;
        impl SecretProvider for StaticVault {
            fn resolve(&self, _reference: &SecretRef) -> Result<String, String> {
                Ok("vault-secret".to_string())
            }
        }

        let mut resolver = SecretResolver::new();
        resolver.register("vault", Box::new(StaticVault));
        let value = resolver
            .resolve(&SecretRef {
                kind: "vault".to_string(),
                key: "kv/warden/signing".to_string(),
                vault: None,
            })
            .unwrap();
        assert_eq!(value, "vault-secret");
    }

    #[test]
    fn test_secret_ref_wire_shape() {
        let reference: SecretRef =
            serde_yaml::from_str("type: env\nkey: PERMISSION_SIGNING_SECRET\n").unwrap();
        assert_eq!(reference.kind, "env");
        assert_eq!(reference.key, "PERMISSION_SIGNING_SECRET");
    }
}
