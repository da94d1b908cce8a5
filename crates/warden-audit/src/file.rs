//! Rotating JSON-lines file sink.
//!
//! A single writer task owns the file handle; `write` pushes onto a
//! bounded in-memory queue and returns immediately. When the queue is
//! full the oldest entry is dropped and counted, so a slow disk can
//! never stall the dispatcher. Rotation renames `audit.log` to
//! `audit.log.1` once the size cap is crossed.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::entry::AuditEntry;
use crate::error::{AuditError, AuditResult};
use crate::sink::AuditSink;

/// Default queue bound.
const DEFAULT_QUEUE_CAPACITY: usize = 4096;

/// Log a dropped-entry warning every this many drops.
const DROP_WARN_EVERY: u64 = 100;

struct Shared {
    queue: Mutex<VecDeque<AuditEntry>>,
    notify: Notify,
    dropped: AtomicU64,
    capacity: usize,
}

/// Rotating JSON-lines sink with a single writer task.
pub struct FileSink {
    shared: Arc<Shared>,
    path: PathBuf,
}

impl FileSink {
    /// Open the sink, spawning its writer task.
    ///
    /// `max_bytes` is the rotation threshold for the active file.
    ///
    /// # Errors
    ///
    /// [`AuditError::OpenFailed`] if the parent directory cannot be
    /// created.
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64) -> AuditResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AuditError::OpenFailed {
                path: path.display().to_string(),
                source,
            })?;
        }
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::with_capacity(DEFAULT_QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            capacity: DEFAULT_QUEUE_CAPACITY,
        });

        let writer_shared = Arc::clone(&shared);
        let writer_path = path.clone();
        tokio::spawn(async move {
            writer_loop(writer_shared, writer_path, max_bytes).await;
        });

        Ok(Self { shared, path })
    }

    /// Entries dropped because the queue was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// The active file path.
    #[must_use]
    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Wait until the queue has drained (tests and shutdown).
    pub async fn flush(&self) {
        loop {
            let empty = {
                let queue = self
                    .shared
                    .queue
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                queue.is_empty()
            };
            if empty {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
    }
}

async fn writer_loop(shared: Arc<Shared>, path: PathBuf, max_bytes: u64) {
    loop {
        let entry = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            queue.pop_front()
        };
        let Some(entry) = entry else {
            shared.notify.notified().await;
            continue;
        };

        if let Err(e) = append_entry(&path, &entry, max_bytes).await {
            warn!(path = %path.display(), error = %e, "audit file write failed");
        }
    }
}

async fn append_entry(path: &PathBuf, entry: &AuditEntry, max_bytes: u64) -> std::io::Result<()> {
    // Rotate before writing when the active file crossed the cap.
    if max_bytes > 0 {
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() >= max_bytes {
                let mut rotated = path.clone();
                rotated.set_extension("log.1");
                let _ = tokio::fs::rename(path, &rotated).await;
                debug!(path = %path.display(), "rotated audit log");
            }
        }
    }

    let mut line = serde_json::to_vec(entry).unwrap_or_default();
    line.push(b'\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(&line).await?;
    Ok(())
}

#[async_trait]
impl AuditSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    async fn write(&self, entry: &AuditEntry) -> AuditResult<()> {
        {
            let mut queue = self
                .shared
                .queue
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if queue.len() >= self.shared.capacity {
                queue.pop_front();
                let dropped = self.shared.dropped.fetch_add(1, Ordering::Relaxed).saturating_add(1);
                if dropped.checked_rem(DROP_WARN_EVERY) == Some(1) {
                    warn!(dropped, "audit file queue full; dropping oldest entries");
                }
            }
            queue.push_back(entry.clone());
        }
        self.shared.notify.notify_one();
        Ok(())
    }
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        let sink = FileSink::open(&path, 0).unwrap();

        for i in 0..3 {
            let entry = AuditEntry::success("system", "agent.spawn", "agent", format!("a-{i}"));
            sink.write(&entry).await.unwrap();
        }
        sink.flush().await;
        // Give the writer a beat to finish the last append.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        let parsed: AuditEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed.resource_id, "a-0");
    }

    #[tokio::test]
    async fn test_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");
        // Tiny cap: every entry after the first triggers rotation.
        let sink = FileSink::open(&path, 10).unwrap();

        for i in 0..2 {
            let entry = AuditEntry::success("system", "x.y", "r", format!("{i}"));
            sink.write(&entry).await.unwrap();
            sink.flush().await;
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        }

        let rotated = dir.path().join("audit.log.1");
        assert!(rotated.exists());
    }
}
