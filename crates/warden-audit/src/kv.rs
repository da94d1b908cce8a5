//! Durable KV-backed sink with query support.
//!
//! Keys are `"{unix_millis:020}-{uuid}"` so lexicographic order is
//! chronological; queries sort descending and page from the newest
//! end.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use warden_storage::KvStore;

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};
use crate::sink::{AuditFilter, AuditQuery, AuditSink};

const NS_AUDIT: &str = "audit";

/// Durable audit sink over a [`KvStore`].
pub struct KvSink {
    store: Arc<dyn KvStore>,
}

impl KvSink {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self { store }
    }

    fn key_for(entry: &AuditEntry) -> String {
        // Negative pre-epoch timestamps are clamped; audit entries are
        // always created "now".
        let millis = u64::try_from(entry.timestamp.unix_millis()).unwrap_or(0);
        format!("{millis:020}-{}", Uuid::new_v4())
    }
}

#[async_trait]
impl AuditSink for KvSink {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn write(&self, entry: &AuditEntry) -> AuditResult<()> {
        let bytes = serde_json::to_vec(entry).map_err(|e| AuditError::WriteFailed {
            sink: "database".to_string(),
            message: e.to_string(),
        })?;
        self.store
            .set(NS_AUDIT, &Self::key_for(entry), bytes)
            .await
            .map_err(|e| AuditError::WriteFailed {
                sink: "database".to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl AuditQuery for KvSink {
    async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditEntry>> {
        let mut keys = self
            .store
            .list_keys(NS_AUDIT)
            .await
            .map_err(|e| AuditError::QueryFailed(e.to_string()))?;
        // Newest first.
        keys.sort_by(|a, b| b.cmp(a));

        let mut matched = 0usize;
        let mut results = Vec::new();
        for key in keys {
            let Some(bytes) = self
                .store
                .get(NS_AUDIT, &key)
                .await
                .map_err(|e| AuditError::QueryFailed(e.to_string()))?
            else {
                continue;
            };
            let Ok(entry) = serde_json::from_slice::<AuditEntry>(&bytes) else {
                continue;
            };
            if !filter.matches(&entry) {
                continue;
            }
            matched = matched.saturating_add(1);
            if matched <= filter.offset {
                continue;
            }
            results.push(entry);
            if let Some(limit) = filter.limit {
                if results.len() >= limit {
                    break;
                }
            }
        }
        Ok(results)
    }
}

impl std::fmt::Debug for KvSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSink").finish_non_exhaustive()
    }
}
