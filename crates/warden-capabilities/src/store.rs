//! In-memory capability token storage with an optional persistence
//! mirror.
//!
//! The store itself is synchronous with small critical sections: the
//! hot `check` path takes the read lock, clones the candidate tokens,
//! and validates them outside the lock. Persistence writes go through
//! the async [`KvStore`] mirror and are awaited by the manager.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use tracing::warn;

use warden_core::types::{AgentId, TokenId};
use warden_storage::KvStore;

use crate::error::{CapabilityError, CapabilityResult};
use crate::token::CapabilityToken;

const NS_TOKENS: &str = "caps:tokens";
const NS_REVOKED: &str = "caps:revoked";

/// Token storage keyed by agent.
pub struct CapabilityStore {
    /// Active tokens grouped by owning agent.
    tokens: RwLock<HashMap<AgentId, Vec<CapabilityToken>>>,
    /// Revoked token ids (fast refusal).
    revoked: RwLock<HashSet<TokenId>>,
    /// Durable mirror, when configured.
    persistence: Option<Arc<dyn KvStore>>,
}

impl CapabilityStore {
    /// In-memory only store.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            persistence: None,
        }
    }

    /// Store mirrored into `kv`; call [`Self::load_persisted`] after
    /// construction to restore surviving tokens.
    #[must_use]
    pub fn with_persistence(kv: Arc<dyn KvStore>) -> Self {
        Self {
            tokens: RwLock::new(HashMap::new()),
            revoked: RwLock::new(HashSet::new()),
            persistence: Some(kv),
        }
    }

    /// Restore persisted tokens and the revocation set.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::Persistence`] when the mirror cannot be read.
    pub async fn load_persisted(&self) -> CapabilityResult<usize> {
        let Some(kv) = &self.persistence else {
            return Ok(0);
        };

        let revoked_keys = kv
            .list_keys(NS_REVOKED)
            .await
            .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
        {
            let mut revoked = self.revoked.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            for key in revoked_keys {
                if let Ok(id) = TokenId::parse(&key) {
                    revoked.insert(id);
                }
            }
        }

        let mut restored = 0usize;
        let token_keys = kv
            .list_keys(NS_TOKENS)
            .await
            .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
        for key in token_keys {
            let Some(bytes) = kv
                .get(NS_TOKENS, &key)
                .await
                .map_err(|e| CapabilityError::Persistence(e.to_string()))?
            else {
                continue;
            };
            match serde_json::from_slice::<CapabilityToken>(&bytes) {
                Ok(token) => {
                    if !self.is_revoked(&token.id) && !token.is_expired() {
                        self.insert_local(token);
                        restored = restored.saturating_add(1);
                    }
                },
                Err(e) => warn!(key, error = %e, "skipping undecodable persisted token"),
            }
        }
        Ok(restored)
    }

    fn insert_local(&self, token: CapabilityToken) {
        let mut tokens = self.tokens.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens.entry(token.agent_id.clone()).or_default().push(token);
    }

    /// Add a token.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::Persistence`] when the mirror write fails;
    /// the in-memory insert still happened.
    pub async fn add(&self, token: CapabilityToken) -> CapabilityResult<()> {
        self.insert_local(token.clone());
        if let Some(kv) = &self.persistence {
            let bytes = serde_json::to_vec(&token)
                .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
            kv.set(NS_TOKENS, &token.id.0.to_string(), bytes)
                .await
                .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
        }
        Ok(())
    }

    /// Snapshot the active (non-revoked) tokens for an agent.
    #[must_use]
    pub fn tokens_for(&self, agent_id: &AgentId) -> Vec<CapabilityToken> {
        let revoked = self.revoked.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tokens = self.tokens.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens
            .get(agent_id)
            .map(|list| {
                list.iter()
                    .filter(|t| !revoked.contains(&t.id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Look up a token anywhere in the store.
    #[must_use]
    pub fn get(&self, token_id: &TokenId) -> Option<CapabilityToken> {
        let tokens = self.tokens.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        tokens
            .values()
            .flat_map(|list| list.iter())
            .find(|t| &t.id == token_id)
            .cloned()
    }

    /// Whether a token id has been revoked.
    #[must_use]
    pub fn is_revoked(&self, token_id: &TokenId) -> bool {
        self.revoked
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(token_id)
    }

    /// Revoke one token. Returns `false` if the token was unknown.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::Persistence`] when the mirror write fails.
    pub async fn revoke(&self, token_id: &TokenId) -> CapabilityResult<bool> {
        let known = {
            let mut tokens = self.tokens.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            let mut found = false;
            for list in tokens.values_mut() {
                let before = list.len();
                list.retain(|t| &t.id != token_id);
                found |= list.len() != before;
            }
            found
        };
        self.revoked
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(token_id.clone());

        if let Some(kv) = &self.persistence {
            let key = token_id.0.to_string();
            kv.set(NS_REVOKED, &key, vec![1u8])
                .await
                .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
            let _ = kv.delete(NS_TOKENS, &key).await;
        }
        Ok(known)
    }

    /// Revoke every token an agent holds. Returns the count revoked.
    ///
    /// # Errors
    ///
    /// [`CapabilityError::Persistence`] when the mirror write fails.
    pub async fn revoke_all(&self, agent_id: &AgentId) -> CapabilityResult<usize> {
        let removed: Vec<TokenId> = {
            let mut tokens = self.tokens.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            tokens
                .remove(agent_id)
                .map(|list| list.into_iter().map(|t| t.id).collect())
                .unwrap_or_default()
        };
        {
            let mut revoked = self.revoked.write().unwrap_or_else(std::sync::PoisonError::into_inner);
            for id in &removed {
                revoked.insert(id.clone());
            }
        }
        if let Some(kv) = &self.persistence {
            for id in &removed {
                let key = id.0.to_string();
                kv.set(NS_REVOKED, &key, vec![1u8])
                    .await
                    .map_err(|e| CapabilityError::Persistence(e.to_string()))?;
                let _ = kv.delete(NS_TOKENS, &key).await;
            }
        }
        Ok(removed.len())
    }

    /// Drop expired tokens for one agent (lazy pruning on the check
    /// path). Returns the number pruned.
    pub fn prune_expired_for(&self, agent_id: &AgentId) -> usize {
        let mut tokens = self.tokens.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(list) = tokens.get_mut(agent_id) else {
            return 0;
        };
        let before = list.len();
        list.retain(|t| !t.is_expired());
        before.saturating_sub(list.len())
    }

    /// Drop expired tokens everywhere. Returns the number pruned.
    pub fn prune_expired(&self) -> usize {
        let mut tokens = self.tokens.write().unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut pruned = 0usize;
        for list in tokens.values_mut() {
            let before = list.len();
            list.retain(|t| !t.is_expired());
            pruned = pruned.saturating_add(before.saturating_sub(list.len()));
        }
        pruned
    }
}

impl std::fmt::Debug for CapabilityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token_count: usize = self
            .tokens
            .read()
            .map(|t| t.values().map(Vec::len).sum())
            .unwrap_or(0);
        let revoked_count = self.revoked.read().map(|r| r.len()).unwrap_or(0);
        f.debug_struct("CapabilityStore")
            .field("tokens", &token_count)
            .field("revoked", &revoked_count)
            .field("has_persistence", &self.persistence.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Permission;
    use crate::token::SigningSecrets;
    use warden_storage::MemoryKvStore;

    fn secrets() -> SigningSecrets {
        SigningSecrets::single("store-test-secret-0000000000000001")
    }

    fn token_for(agent: &AgentId) -> CapabilityToken {
        CapabilityToken::create(
            agent.clone(),
            vec![Permission::parse_spec("tools.invoke").unwrap()],
            "system",
            None,
            None,
            false,
            &secrets(),
        )
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let store = CapabilityStore::in_memory();
        let agent = AgentId::new();
        store.add(token_for(&agent)).await.unwrap();
        store.add(token_for(&agent)).await.unwrap();
        assert_eq!(store.tokens_for(&agent).len(), 2);
        assert!(store.tokens_for(&AgentId::new()).is_empty());
    }

    #[tokio::test]
    async fn test_revoke_removes_token() {
        let store = CapabilityStore::in_memory();
        let agent = AgentId::new();
        let token = token_for(&agent);
        let id = token.id.clone();
        store.add(token).await.unwrap();

        assert!(store.revoke(&id).await.unwrap());
        assert!(store.tokens_for(&agent).is_empty());
        assert!(store.is_revoked(&id));
        // Unknown token revokes return false.
        assert!(!store.revoke(&TokenId::new()).await.unwrap());
    }

    #[tokio::test]
    async fn test_revoke_all() {
        let store = CapabilityStore::in_memory();
        let agent = AgentId::new();
        store.add(token_for(&agent)).await.unwrap();
        store.add(token_for(&agent)).await.unwrap();
        assert_eq!(store.revoke_all(&agent).await.unwrap(), 2);
        assert!(store.tokens_for(&agent).is_empty());
    }

    #[tokio::test]
    async fn test_persistence_roundtrip() {
        let kv = MemoryKvStore::shared();
        let agent = AgentId::new();
        let token = token_for(&agent);
        let id = token.id.clone();

        {
            let store = CapabilityStore::with_persistence(Arc::clone(&kv));
            store.add(token).await.unwrap();
        }

        // A fresh store over the same KV sees the token again.
        let store = CapabilityStore::with_persistence(Arc::clone(&kv));
        assert_eq!(store.load_persisted().await.unwrap(), 1);
        assert!(store.get(&id).is_some());

        // Revocation survives reloads too.
        store.revoke(&id).await.unwrap();
        let store2 = CapabilityStore::with_persistence(kv);
        assert_eq!(store2.load_persisted().await.unwrap(), 0);
        assert!(store2.is_revoked(&id));
    }
}
