//! The sink multiplexer.
//!
//! Redacts once, then fans out to every configured sink. A failing
//! sink is logged and skipped so one slow or broken backend cannot
//! block the rest.

use std::sync::Arc;

use tracing::warn;

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};
use crate::redact::Redactor;
use crate::sink::{AuditFilter, AuditQuery, AuditSink};

/// Fan-out audit writer with a single query backend.
pub struct MultiSink {
    sinks: Vec<Arc<dyn AuditSink>>,
    queryable: Option<Arc<dyn AuditQuery>>,
    redactor: Redactor,
}

impl MultiSink {
    /// Build an empty multiplexer with the default redactor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sinks: Vec::new(),
            queryable: None,
            redactor: Redactor::new(),
        }
    }

    /// Replace the redactor.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Add a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Register the query backend (usually the durable sink).
    #[must_use]
    pub fn with_query_backend(mut self, backend: Arc<dyn AuditQuery>) -> Self {
        self.queryable = Some(backend);
        self
    }

    /// Redact and record one entry across every sink, best-effort.
    pub async fn record(&self, mut entry: AuditEntry) {
        self.redactor.redact(&mut entry.details);
        for sink in &self.sinks {
            if let Err(e) = sink.write(&entry).await {
                warn!(sink = sink.name(), error = %e, "audit sink write failed");
            }
        }
    }

    /// Query stored entries newest-first.
    ///
    /// # Errors
    ///
    /// [`AuditError::NotQueryable`] when no durable backend is
    /// registered, otherwise the backend's failure.
    pub async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditEntry>> {
        match &self.queryable {
            Some(backend) => backend.query(filter).await,
            None => Err(AuditError::NotQueryable),
        }
    }

    /// Number of configured sinks.
    #[must_use]
    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }
}

impl Default for MultiSink {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MultiSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiSink")
            .field("sinks", &self.sink_count())
            .field("queryable", &self.queryable.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KvSink;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use warden_storage::MemoryKvStore;

    struct RecordingSink {
        entries: Mutex<Vec<AuditEntry>>,
    }

    #[async_trait]
    impl AuditSink for RecordingSink {
        fn name(&self) -> &'static str {
            "recording"
        }

        async fn write(&self, entry: &AuditEntry) -> AuditResult<()> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl AuditSink for FailingSink {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn write(&self, _entry: &AuditEntry) -> AuditResult<()> {
            Err(AuditError::WriteFailed {
                sink: "failing".to_string(),
                message: "disk on fire".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_redaction_happens_before_sinks() {
        let recording = Arc::new(RecordingSink {
            entries: Mutex::new(Vec::new()),
        });
        let multi = MultiSink::new().with_sink(Arc::clone(&recording) as Arc<dyn AuditSink>);

        let entry = AuditEntry::success("system", "capability.grant", "capability", "t-1")
            .with_details(serde_json::json!({"api_key": "sk-123", "purpose": "test"}));
        multi.record(entry).await;

        let seen = recording.entries.lock().unwrap();
        assert_eq!(seen[0].details["api_key"], crate::redact::REDACTED);
        assert_eq!(seen[0].details["purpose"], "test");
    }

    #[tokio::test]
    async fn test_failing_sink_does_not_block_others() {
        let recording = Arc::new(RecordingSink {
            entries: Mutex::new(Vec::new()),
        });
        let multi = MultiSink::new()
            .with_sink(Arc::new(FailingSink))
            .with_sink(Arc::clone(&recording) as Arc<dyn AuditSink>);

        multi
            .record(AuditEntry::success("system", "x.y", "r", "1"))
            .await;
        assert_eq!(recording.entries.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_query_via_backend() {
        let kv_sink = Arc::new(KvSink::new(MemoryKvStore::shared()));
        let multi = MultiSink::new()
            .with_sink(Arc::clone(&kv_sink) as Arc<dyn AuditSink>)
            .with_query_backend(kv_sink as Arc<dyn AuditQuery>);

        multi
            .record(AuditEntry::success("system", "agent.spawn", "agent", "a-1"))
            .await;
        let results = multi.query(&AuditFilter::default()).await.unwrap();
        assert_eq!(results.len(), 1);

        let none = MultiSink::new();
        assert!(matches!(
            none.query(&AuditFilter::default()).await,
            Err(AuditError::NotQueryable)
        ));
    }
}
