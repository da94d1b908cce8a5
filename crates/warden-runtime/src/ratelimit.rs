//! Token-bucket admission control.
//!
//! Each key (agent, provider) owns a bucket with two dimensions:
//! request count and token count. Refill is continuous,
//! `elapsed_ms * rate / 60000`, capped at the burst ceiling. `acquire`
//! waits cooperatively; waiters for the same key are served FIFO
//! (the per-bucket gate is a fair `tokio::sync::Mutex`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use warden_storage::KvStore;

use crate::error::{RuntimeError, RuntimeResult};

/// Per-key rate configuration.
#[derive(Debug, Clone, Copy, serde::Serialize, serde::Deserialize)]
pub struct RateLimitConfig {
    /// Sustained request rate.
    pub requests_per_minute: u32,
    /// Sustained token rate.
    pub tokens_per_minute: u64,
    /// Request burst ceiling.
    pub max_burst_requests: u32,
    /// Token burst ceiling.
    pub max_burst_tokens: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            tokens_per_minute: 100_000,
            max_burst_requests: 10,
            max_burst_tokens: 20_000,
        }
    }
}

/// A point-in-time view of one bucket.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct BucketSnapshot {
    /// Available request tokens.
    pub request_tokens: f64,
    /// Available completion-token budget.
    pub token_budget: f64,
    /// Callers currently waiting in `acquire`.
    pub pending: usize,
}

/// The admission interface. One implementation runs local buckets;
/// the production variant counts in an external store.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Whether a request with `estimated_tokens` would be admitted now.
    async fn can_proceed(&self, key: &str, estimated_tokens: u64) -> bool;

    /// Wait until the request is admitted, then consume capacity.
    async fn acquire(&self, key: &str, estimated_tokens: u64);

    /// Reconcile an estimate with the actual token usage.
    async fn report_usage(&self, key: &str, estimated_tokens: u64, actual_tokens: u64);

    /// A snapshot of the key's bucket.
    async fn state(&self, key: &str) -> BucketSnapshot;

    /// Reset the key's bucket to full burst capacity.
    async fn reset(&self, key: &str);
}

struct BucketInner {
    request_tokens: f64,
    token_budget: f64,
    last_refill: Instant,
}

struct Bucket {
    config: RateLimitConfig,
    inner: Mutex<BucketInner>,
    /// FIFO gate: held across the wait loop so earlier callers are
    /// admitted first (tokio mutexes queue waiters fairly).
    gate: Mutex<()>,
    pending: std::sync::atomic::AtomicUsize,
}

impl Bucket {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BucketInner {
                request_tokens: f64::from(config.max_burst_requests),
                token_budget: to_f64(config.max_burst_tokens),
                last_refill: Instant::now(),
            }),
            gate: Mutex::new(()),
            pending: std::sync::atomic::AtomicUsize::new(0),
        }
    }

    fn refill(&self, inner: &mut BucketInner) {
        let elapsed_ms = to_f64(
            u64::try_from(inner.last_refill.elapsed().as_millis()).unwrap_or(u64::MAX),
        );
        inner.last_refill = Instant::now();

        let request_rate = f64::from(self.config.requests_per_minute) / 60_000.0;
        let token_rate = to_f64(self.config.tokens_per_minute) / 60_000.0;

        inner.request_tokens = (inner.request_tokens + elapsed_ms * request_rate)
            .min(f64::from(self.config.max_burst_requests));
        inner.token_budget = (inner.token_budget + elapsed_ms * token_rate)
            .min(to_f64(self.config.max_burst_tokens));
    }

    fn has_capacity(&self, inner: &BucketInner, estimated_tokens: u64) -> bool {
        inner.request_tokens >= 1.0 && inner.token_budget >= to_f64(estimated_tokens)
    }

    /// Milliseconds until enough refill has accumulated for the
    /// request.
    fn wait_for(&self, inner: &BucketInner, estimated_tokens: u64) -> Duration {
        let request_rate = f64::from(self.config.requests_per_minute) / 60_000.0;
        let token_rate = to_f64(self.config.tokens_per_minute) / 60_000.0;

        let request_wait = if inner.request_tokens >= 1.0 || request_rate <= 0.0 {
            0.0
        } else {
            (1.0 - inner.request_tokens) / request_rate
        };
        let token_deficit = to_f64(estimated_tokens) - inner.token_budget;
        let token_wait = if token_deficit <= 0.0 || token_rate <= 0.0 {
            0.0
        } else {
            token_deficit / token_rate
        };

        let wait_ms = request_wait.max(token_wait).max(1.0);
        Duration::from_millis(clamp_to_u64(wait_ms))
    }
}

#[allow(clippy::cast_precision_loss)]
fn to_f64(value: u64) -> f64 {
    value as f64
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn clamp_to_u64(value: f64) -> u64 {
    if value.is_finite() && value >= 0.0 {
        value.min(to_f64(u64::MAX)) as u64
    } else {
        0
    }
}

/// In-process token buckets.
pub struct LocalRateLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    config: RateLimitConfig,
}

impl LocalRateLimiter {
    /// Limiter where every key uses `config`.
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    fn bucket(&self, key: &str) -> Arc<Bucket> {
        Arc::clone(
            &self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Bucket::new(self.config))),
        )
    }
}

#[async_trait]
impl RateLimiter for LocalRateLimiter {
    async fn can_proceed(&self, key: &str, estimated_tokens: u64) -> bool {
        let bucket = self.bucket(key);
        let mut inner = bucket.inner.lock().await;
        bucket.refill(&mut inner);
        bucket.has_capacity(&inner, estimated_tokens)
    }

    async fn acquire(&self, key: &str, estimated_tokens: u64) {
        let bucket = self.bucket(key);
        bucket
            .pending
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        // FIFO: the gate queues callers in arrival order.
        let _turn = bucket.gate.lock().await;
        loop {
            let wait = {
                let mut inner = bucket.inner.lock().await;
                bucket.refill(&mut inner);
                if bucket.has_capacity(&inner, estimated_tokens) {
                    inner.request_tokens -= 1.0;
                    inner.token_budget -= to_f64(estimated_tokens);
                    bucket
                        .pending
                        .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    return;
                }
                bucket.wait_for(&inner, estimated_tokens)
            };
            trace!(key, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(0), "rate limited; waiting");
            tokio::time::sleep(wait).await;
        }
    }

    async fn report_usage(&self, key: &str, estimated_tokens: u64, actual_tokens: u64) {
        let bucket = self.bucket(key);
        let mut inner = bucket.inner.lock().await;
        // Refund over-estimates, charge under-estimates.
        let delta = to_f64(estimated_tokens) - to_f64(actual_tokens);
        inner.token_budget = (inner.token_budget + delta)
            .clamp(0.0, to_f64(bucket.config.max_burst_tokens));
        debug!(key, estimated_tokens, actual_tokens, "reconciled token usage");
    }

    async fn state(&self, key: &str) -> BucketSnapshot {
        let bucket = self.bucket(key);
        let mut inner = bucket.inner.lock().await;
        bucket.refill(&mut inner);
        BucketSnapshot {
            request_tokens: inner.request_tokens,
            token_budget: inner.token_budget,
            pending: bucket.pending.load(std::sync::atomic::Ordering::SeqCst),
        }
    }

    async fn reset(&self, key: &str) {
        let bucket = self.bucket(key);
        let mut inner = bucket.inner.lock().await;
        inner.request_tokens = f64::from(bucket.config.max_burst_requests);
        inner.token_budget = to_f64(bucket.config.max_burst_tokens);
        inner.last_refill = Instant::now();
    }
}

/// Store-backed limiter: fixed-window counters in a shared [`KvStore`]
/// keyed `(key, minute-window)`. Used when several dispatcher nodes
/// must share one budget; the trade is window-edge burstiness for
/// cross-node consistency.
pub struct StoreRateLimiter {
    store: Arc<dyn KvStore>,
    config: RateLimitConfig,
}

const NS_RATE: &str = "rate";

#[derive(serde::Serialize, serde::Deserialize, Default, Clone, Copy)]
struct WindowCounters {
    requests: u32,
    tokens: u64,
}

impl StoreRateLimiter {
    /// Limiter over `store` where every key uses `config`.
    #[must_use]
    pub fn new(store: Arc<dyn KvStore>, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    fn window_key(key: &str) -> String {
        let minute = chrono::Utc::now().timestamp().div_euclid(60);
        format!("{key}:{minute}")
    }

    async fn read_counters(&self, window_key: &str) -> RuntimeResult<(WindowCounters, Option<Vec<u8>>)> {
        let raw = self
            .store
            .get(NS_RATE, window_key)
            .await
            .map_err(|e| RuntimeError::Store(e.to_string()))?;
        let counters = raw
            .as_deref()
            .and_then(|b| serde_json::from_slice(b).ok())
            .unwrap_or_default();
        Ok((counters, raw))
    }

    /// Try to consume capacity in the current window. `Ok(true)` on
    /// admission.
    async fn try_consume(&self, key: &str, estimated_tokens: u64) -> RuntimeResult<bool> {
        let window_key = Self::window_key(key);
        // CAS loop: lost races re-read and retry a few times.
        for _ in 0..8 {
            let (counters, raw) = self.read_counters(&window_key).await?;
            let admitted = counters.requests < self.config.requests_per_minute
                && counters
                    .tokens
                    .saturating_add(estimated_tokens)
                    <= self.config.tokens_per_minute;
            if !admitted {
                return Ok(false);
            }
            let next = WindowCounters {
                requests: counters.requests.saturating_add(1),
                tokens: counters.tokens.saturating_add(estimated_tokens),
            };
            let bytes = serde_json::to_vec(&next).map_err(|e| RuntimeError::Store(e.to_string()))?;
            let swapped = self
                .store
                .compare_and_set(NS_RATE, &window_key, raw.as_deref(), bytes)
                .await
                .map_err(|e| RuntimeError::Store(e.to_string()))?;
            if swapped {
                return Ok(true);
            }
        }
        Err(RuntimeError::Store(format!(
            "compare-and-set contention on rate window {window_key}"
        )))
    }
}

#[async_trait]
impl RateLimiter for StoreRateLimiter {
    async fn can_proceed(&self, key: &str, estimated_tokens: u64) -> bool {
        let window_key = Self::window_key(key);
        match self.read_counters(&window_key).await {
            Ok((counters, _)) => {
                counters.requests < self.config.requests_per_minute
                    && counters.tokens.saturating_add(estimated_tokens)
                        <= self.config.tokens_per_minute
            },
            // Fail open for availability: the local limiter still caps
            // each node.
            Err(_) => true,
        }
    }

    async fn acquire(&self, key: &str, estimated_tokens: u64) {
        loop {
            match self.try_consume(key, estimated_tokens).await {
                Ok(true) => return,
                Ok(false) => {
                    // Wait for the next window edge.
                    let now = chrono::Utc::now().timestamp();
                    let into_window = now.rem_euclid(60);
                    let wait = 60i64.saturating_sub(into_window).max(1);
                    tokio::time::sleep(Duration::from_secs(
                        u64::try_from(wait).unwrap_or(1),
                    ))
                    .await;
                },
                Err(e) => {
                    debug!(key, error = %e, "store rate limiter degraded; admitting");
                    return;
                },
            }
        }
    }

    async fn report_usage(&self, _key: &str, _estimated_tokens: u64, _actual_tokens: u64) {
        // Window counters track admissions, not budgets; nothing to
        // reconcile.
    }

    async fn state(&self, key: &str) -> BucketSnapshot {
        let window_key = Self::window_key(key);
        let (counters, _) = self
            .read_counters(&window_key)
            .await
            .unwrap_or((WindowCounters::default(), None));
        BucketSnapshot {
            request_tokens: f64::from(self.config.requests_per_minute.saturating_sub(counters.requests)),
            token_budget: to_f64(self.config.tokens_per_minute.saturating_sub(counters.tokens)),
            pending: 0,
        }
    }

    async fn reset(&self, key: &str) {
        let window_key = Self::window_key(key);
        let _ = self.store.delete(NS_RATE, &window_key).await;
    }
}
