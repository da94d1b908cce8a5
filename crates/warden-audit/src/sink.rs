//! Sink traits and the query filter.

use async_trait::async_trait;

use warden_core::types::Timestamp;

use crate::entry::AuditEntry;
use crate::error::AuditResult;

/// An audit sink. Entries arrive already redacted.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// The sink's name, used in failure logs.
    fn name(&self) -> &'static str;

    /// Append one entry.
    ///
    /// # Errors
    ///
    /// Sink-specific write failures; the multiplexer treats them as
    /// best-effort and never blocks other sinks on them.
    async fn write(&self, entry: &AuditEntry) -> AuditResult<()>;
}

/// Query filter over stored entries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    /// Match this actor exactly.
    pub actor: Option<String>,
    /// Match this action exactly.
    pub action: Option<String>,
    /// Match this resource id exactly.
    pub target: Option<String>,
    /// Entries at or after this time.
    pub since: Option<Timestamp>,
    /// Entries at or before this time.
    pub until: Option<Timestamp>,
    /// Page size.
    pub limit: Option<usize>,
    /// Entries to skip from the newest end.
    pub offset: usize,
}

impl AuditFilter {
    /// Whether `entry` passes the filter (paging not applied here).
    #[must_use]
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.actor.as_deref().is_none_or(|a| entry.actor == a)
            && self.action.as_deref().is_none_or(|a| entry.action == a)
            && self.target.as_deref().is_none_or(|t| entry.resource_id == t)
            && self.since.is_none_or(|s| entry.timestamp >= s)
            && self.until.is_none_or(|u| entry.timestamp <= u)
    }
}

/// Optional query capability on a durable sink.
#[async_trait]
pub trait AuditQuery: Send + Sync {
    /// Query entries newest-first.
    ///
    /// # Errors
    ///
    /// Sink-specific read failures.
    async fn query(&self, filter: &AuditFilter) -> AuditResult<Vec<AuditEntry>>;
}
