//! The capability manager: grant, check, revoke.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info};

use warden_core::types::{AgentId, Timestamp, TokenId};
use warden_storage::KvStore;

use crate::error::{CapabilityError, CapabilityResult};
use crate::permission::{CapabilityCategory, Permission, expand_filesystem_resource};
use crate::store::CapabilityStore;
use crate::token::{CapabilityToken, SigningSecrets};

/// Who is asking for a grant.
#[derive(Debug, Clone)]
pub enum Granter {
    /// The trusted control-plane identity; may grant anything.
    System,
    /// Another agent; must hold a superset of what it grants, on a
    /// token marked delegatable.
    Agent(AgentId),
}

impl Granter {
    fn label(&self) -> String {
        match self {
            Self::System => "system".to_string(),
            Self::Agent(id) => id.wire(),
        }
    }
}

/// A grant request.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    /// The receiving agent.
    pub agent_id: AgentId,
    /// Permissions to grant; one token covers all of them.
    pub permissions: Vec<Permission>,
    /// Lifetime in milliseconds; `None` = until revoked.
    pub duration_ms: Option<u64>,
    /// Free-form purpose for the audit trail.
    pub purpose: Option<String>,
    /// Whether the receiver may delegate (one level, never further).
    pub delegatable: bool,
}

/// The outcome of a capability check.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CheckResult {
    /// Whether some active token satisfies the request.
    pub allowed: bool,
    /// The most specific refusal reason observed, when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CheckResult {
    fn allowed() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    fn denied(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

/// Issues, verifies, and revokes capability tokens.
pub struct CapabilityManager {
    store: CapabilityStore,
    secrets: SigningSecrets,
    /// Default token lifetime when a request does not set one.
    default_duration_ms: Option<u64>,
}

impl CapabilityManager {
    /// In-memory manager.
    #[must_use]
    pub fn new(secrets: SigningSecrets, default_duration_ms: Option<u64>) -> Self {
        Self {
            store: CapabilityStore::in_memory(),
            secrets,
            default_duration_ms,
        }
    }

    /// Manager with a durable token mirror.
    #[must_use]
    pub fn with_persistence(
        secrets: SigningSecrets,
        default_duration_ms: Option<u64>,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            store: CapabilityStore::with_persistence(kv),
            secrets,
            default_duration_ms,
        }
    }

    /// Restore persisted tokens.
    ///
    /// # Errors
    ///
    /// Propagates [`CapabilityError::Persistence`].
    pub async fn load_persisted(&self) -> CapabilityResult<usize> {
        self.store.load_persisted().await
    }

    /// The backing store (for diagnostics).
    #[must_use]
    pub fn store(&self) -> &CapabilityStore {
        &self.store
    }

    /// Grant a token.
    ///
    /// `system` may grant anything. An agent granter must hold an
    /// active, delegatable token whose permissions are a superset of
    /// every requested permission; tokens minted through delegation
    /// are themselves non-delegatable, so chains stop at one level.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::GranterNotAuthorized`] when the superset
    /// check fails, or a persistence error.
    pub async fn grant(
        &self,
        request: GrantRequest,
        granted_by: &Granter,
    ) -> CapabilityResult<CapabilityToken> {
        let mut delegated = false;
        if let Granter::Agent(granter_id) = granted_by {
            self.check_superset(granter_id, &request.permissions)?;
            delegated = true;
        }

        let expanded: Vec<Permission> = request
            .permissions
            .iter()
            .flat_map(|p| expand_filesystem_resource(p))
            .collect();

        let duration_ms = request.duration_ms.or(self.default_duration_ms);
        let expires_at = duration_ms.map(|ms| {
            let ttl = Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX));
            Timestamp::from_datetime(
                chrono::Utc::now()
                    .checked_add_signed(ttl)
                    .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC),
            )
        });

        // A delegated token must not be re-delegatable.
        let delegatable = request.delegatable && !delegated;

        let token = CapabilityToken::create(
            request.agent_id.clone(),
            expanded,
            granted_by.label(),
            expires_at,
            request.purpose.clone(),
            delegatable,
            &self.secrets,
        );
        info!(
            token = %token.id,
            agent = %token.agent_id,
            granted_by = %token.granted_by,
            permissions = token.permissions.len(),
            "granted capability token"
        );
        self.store.add(token.clone()).await?;
        Ok(token)
    }

    fn check_superset(
        &self,
        granter_id: &AgentId,
        requested: &[Permission],
    ) -> CapabilityResult<()> {
        let granter_tokens: Vec<CapabilityToken> = self
            .store
            .tokens_for(granter_id)
            .into_iter()
            .filter(|t| {
                t.delegatable && !t.is_expired() && t.verify(&self.secrets).is_ok()
            })
            .collect();

        for wanted in requested {
            let covered = granter_tokens.iter().any(|token| {
                token
                    .permissions
                    .iter()
                    .any(|held| held.is_superset_of(wanted))
            });
            if !covered {
                return Err(CapabilityError::GranterNotAuthorized {
                    reason: format!("no delegatable superset for {wanted}"),
                });
            }
        }
        Ok(())
    }

    /// Check whether `agent_id` may perform `action` in `category` on
    /// `resource`.
    #[must_use]
    pub fn check(
        &self,
        agent_id: &AgentId,
        category: CapabilityCategory,
        action: &str,
        resource: Option<&str>,
    ) -> CheckResult {
        let tokens = self.store.tokens_for(agent_id);
        let mut reason: Option<String> = None;

        for token in &tokens {
            let permission_matches = token
                .permissions
                .iter()
                .any(|p| p.covers(category, action, resource));
            if !permission_matches {
                continue;
            }
            if token.is_expired() {
                reason = Some("expired".to_string());
                continue;
            }
            if token.verify(&self.secrets).is_err() {
                reason = Some("invalid signature".to_string());
                continue;
            }
            return CheckResult::allowed();
        }

        // Lazy pruning: drop whatever expired while we looked.
        let pruned = self.store.prune_expired_for(agent_id);
        if pruned > 0 {
            debug!(agent = %agent_id, pruned, "pruned expired capability tokens");
        }

        match reason {
            Some(reason) => CheckResult::denied(reason),
            None => CheckResult::denied(format!(
                "no capability for {category}.{action}{}",
                resource.map(|r| format!(":{r}")).unwrap_or_default()
            )),
        }
    }

    /// Revoke one token.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::TokenNotFound`] for unknown ids, or a
    /// persistence error.
    pub async fn revoke(&self, token_id: &TokenId) -> CapabilityResult<()> {
        if self.store.revoke(token_id).await? {
            info!(token = %token_id, "revoked capability token");
            Ok(())
        } else {
            Err(CapabilityError::TokenNotFound {
                token_id: token_id.to_string(),
            })
        }
    }

    /// Revoke every token an agent holds (used at termination).
    ///
    /// # Errors
    ///
    /// Propagates persistence errors.
    pub async fn revoke_all(&self, agent_id: &AgentId) -> CapabilityResult<usize> {
        let count = self.store.revoke_all(agent_id).await?;
        if count > 0 {
            info!(agent = %agent_id, count, "revoked all capability tokens");
        }
        Ok(count)
    }

    /// Drop expired tokens everywhere (scheduler job).
    #[must_use]
    pub fn prune_expired(&self) -> usize {
        self.store.prune_expired()
    }
}

impl std::fmt::Debug for CapabilityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityManager")
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}
