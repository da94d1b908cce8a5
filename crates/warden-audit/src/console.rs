//! Console sink: one structured tracing line per entry.

use async_trait::async_trait;
use tracing::info;

use crate::entry::AuditEntry;
use crate::error::AuditResult;
use crate::sink::AuditSink;

/// Writes entries as structured log lines under the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSink;

impl ConsoleSink {
    /// Create the sink.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditSink for ConsoleSink {
    fn name(&self) -> &'static str {
        "console"
    }

    async fn write(&self, entry: &AuditEntry) -> AuditResult<()> {
        info!(
            target: "audit",
            actor = %entry.actor,
            action = %entry.action,
            resource_type = %entry.resource_type,
            resource_id = %entry.resource_id,
            outcome = %entry.outcome,
            details = %entry.details,
            "audit"
        );
        Ok(())
    }
}
