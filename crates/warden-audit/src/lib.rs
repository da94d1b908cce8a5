//! Warden Audit - append-only record of decisions and lifecycle events.
//!
//! Every security-relevant operation produces exactly one audit entry.
//! Entries pass through secret redaction before any sink sees them,
//! then fan out to the configured sinks (console, rotating JSON-lines
//! file, durable KV). Writes are best-effort: a failing sink is logged
//! and never blocks the others.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod console;
pub mod entry;
pub mod error;
pub mod file;
pub mod kv;
pub mod multi;
pub mod redact;
pub mod sink;

pub use console::ConsoleSink;
pub use entry::{AuditEntry, AuditOutcome};
pub use error::{AuditError, AuditResult};
pub use file::FileSink;
pub use kv::KvSink;
pub use multi::MultiSink;
pub use redact::Redactor;
pub use sink::{AuditFilter, AuditQuery, AuditSink};
