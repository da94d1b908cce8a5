//! The job scheduler.
//!
//! Named jobs run on a fixed interval. A tick is skipped (and logged)
//! when the previous run is still executing, and when a configured
//! distributed lock cannot be acquired. Jobs support pause, resume,
//! one-shot trigger, and unregister; shutdown grants in-flight runs a
//! bounded grace period.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};

/// A job body: an async closure run on each tick.
pub type JobHandler = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Distributed lock seam for multi-node deployments.
///
/// `acquire` returns a guard held for the duration of the run, or
/// `None` when another node owns the tick.
pub trait LockProvider: Send + Sync {
    /// Try to take the lock for one run of `job_id`.
    fn acquire(&self, job_id: &str) -> Option<Box<dyn Send>>;
}

struct Job {
    id: String,
    handler: JobHandler,
    paused: AtomicBool,
    /// Held while a run executes; `try_lock` failure means overlap.
    running: Arc<Mutex<()>>,
    cancel: CancellationToken,
    runs: AtomicU64,
    skipped: AtomicU64,
}

/// The scheduler.
pub struct Scheduler {
    jobs: DashMap<String, Arc<Job>>,
    lock_provider: Option<Arc<dyn LockProvider>>,
    cancel: CancellationToken,
}

impl Scheduler {
    /// Scheduler without a distributed lock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            jobs: DashMap::new(),
            lock_provider: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a distributed lock provider.
    #[must_use]
    pub fn with_lock_provider(mut self, provider: Arc<dyn LockProvider>) -> Self {
        self.lock_provider = Some(provider);
        self
    }

    /// Register a job and start its ticker.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::JobExists`] for duplicate ids.
    pub fn register(
        &self,
        id: impl Into<String>,
        interval: Duration,
        handler: JobHandler,
    ) -> RuntimeResult<()> {
        let id = id.into();
        if self.jobs.contains_key(&id) {
            return Err(RuntimeError::JobExists { job_id: id });
        }
        let job = Arc::new(Job {
            id: id.clone(),
            handler,
            paused: AtomicBool::new(false),
            running: Arc::new(Mutex::new(())),
            cancel: self.cancel.child_token(),
            runs: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        });
        self.jobs.insert(id.clone(), Arc::clone(&job));

        let lock_provider = self.lock_provider.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = job.cancel.cancelled() => return,
                    () = tokio::time::sleep(interval) => {},
                }
                if job.paused.load(Ordering::SeqCst) {
                    continue;
                }
                run_once(&job, lock_provider.as_deref());
            }
        });
        info!(job = %id, interval_ms = u64::try_from(interval.as_millis()).unwrap_or(0), "job registered");
        Ok(())
    }

    /// Pause a job's ticks.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::JobNotFound`] for unknown ids.
    pub fn pause(&self, id: &str) -> RuntimeResult<()> {
        self.job(id)?.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Resume a paused job.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::JobNotFound`] for unknown ids.
    pub fn resume(&self, id: &str) -> RuntimeResult<()> {
        self.job(id)?.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Run a job once, immediately, subject to the same no-overlap
    /// and lock rules as a tick.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::JobNotFound`] for unknown ids.
    pub fn trigger(&self, id: &str) -> RuntimeResult<()> {
        let job = self.job(id)?;
        run_once(&job, self.lock_provider.as_deref());
        Ok(())
    }

    /// Stop and remove a job.
    ///
    /// # Errors
    ///
    /// [`RuntimeError::JobNotFound`] for unknown ids.
    pub fn unregister(&self, id: &str) -> RuntimeResult<()> {
        let Some((_, job)) = self.jobs.remove(id) else {
            return Err(RuntimeError::JobNotFound {
                job_id: id.to_string(),
            });
        };
        job.cancel.cancel();
        Ok(())
    }

    /// Completed run count for a job (0 for unknown ids).
    #[must_use]
    pub fn runs(&self, id: &str) -> u64 {
        self.jobs
            .get(id)
            .map(|j| j.runs.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Skipped tick count for a job (0 for unknown ids).
    #[must_use]
    pub fn skipped(&self, id: &str) -> u64 {
        self.jobs
            .get(id)
            .map(|j| j.skipped.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Stop all tickers, then wait up to `grace` for in-flight runs.
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel.cancel();
        let jobs: Vec<Arc<Job>> = self.jobs.iter().map(|e| Arc::clone(e.value())).collect();
        for job in jobs {
            // Acquiring the run lock proves the last run finished.
            if tokio::time::timeout(grace, job.running.lock()).await.is_err() {
                warn!(job = %job.id, "job still running at shutdown grace expiry");
            }
        }
        self.jobs.clear();
    }

    fn job(&self, id: &str) -> RuntimeResult<Arc<Job>> {
        self.jobs
            .get(id)
            .map(|j| Arc::clone(&j))
            .ok_or_else(|| RuntimeError::JobNotFound {
                job_id: id.to_string(),
            })
    }
}

fn run_once(job: &Arc<Job>, lock_provider: Option<&dyn LockProvider>) {
    let Ok(guard) = Arc::clone(&job.running).try_lock_owned() else {
        job.skipped.fetch_add(1, Ordering::SeqCst);
        debug!(job = %job.id, "previous run still in flight; skipping tick");
        return;
    };

    let distributed_guard = match lock_provider {
        Some(provider) => match provider.acquire(&job.id) {
            Some(lock) => Some(lock),
            None => {
                job.skipped.fetch_add(1, Ordering::SeqCst);
                debug!(job = %job.id, "distributed lock not acquired; skipping tick");
                return;
            },
        },
        None => None,
    };

    let job = Arc::clone(job);
    tokio::spawn(async move {
        let _run_guard = guard;
        let _lock_guard = distributed_guard;
        (job.handler)().await;
        job.runs.fetch_add(1, Ordering::SeqCst);
    });
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("jobs", &self.jobs.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_job(counter: Arc<AtomicUsize>, hold: Duration) -> JobHandler {
        Arc::new(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(hold).await;
            })
        })
    }

    #[tokio::test]
    async fn test_interval_runs() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                "tick",
                Duration::from_millis(30),
                counting_job(Arc::clone(&count), Duration::ZERO),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.shutdown(Duration::from_millis(200)).await;
        let runs = count.load(Ordering::SeqCst);
        assert!(runs >= 3, "expected several runs, got {runs}");
    }

    #[tokio::test]
    async fn test_no_overlap() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        // Each run holds for 500ms while ticks come every 40ms: almost
        // every tick must be skipped, and runs never overlap.
        scheduler
            .register(
                "slow",
                Duration::from_millis(40),
                counting_job(Arc::clone(&count), Duration::from_millis(500)),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(450)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(scheduler.skipped("slow") >= 5);
        scheduler.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_pause_resume_trigger() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                "job",
                Duration::from_secs(3600),
                counting_job(Arc::clone(&count), Duration::ZERO),
            )
            .unwrap();

        scheduler.pause("job").unwrap();
        scheduler.trigger("job").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Trigger works even while the ticker is paused.
        assert_eq!(count.load(Ordering::SeqCst), 1);

        scheduler.resume("job").unwrap();
        scheduler.unregister("job").unwrap();
        assert!(matches!(
            scheduler.trigger("job"),
            Err(RuntimeError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let scheduler = Scheduler::new();
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register("dup", Duration::from_secs(60), counting_job(Arc::clone(&count), Duration::ZERO))
            .unwrap();
        assert!(matches!(
            scheduler.register("dup", Duration::from_secs(60), counting_job(count, Duration::ZERO)),
            Err(RuntimeError::JobExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_lock_provider_skips() {
        struct NeverLocks;
        impl LockProvider for NeverLocks {
            fn acquire(&self, _job_id: &str) -> Option<Box<dyn Send>> {
                None
            }
        }

        let scheduler = Scheduler::new().with_lock_provider(Arc::new(NeverLocks));
        let count = Arc::new(AtomicUsize::new(0));
        scheduler
            .register(
                "locked",
                Duration::from_millis(20),
                counting_job(Arc::clone(&count), Duration::ZERO),
            )
            .unwrap();

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(scheduler.skipped("locked") >= 2);
        scheduler.shutdown(Duration::from_millis(100)).await;
    }
}
