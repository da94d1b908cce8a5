//! Retry with jittered exponential backoff.
//!
//! Used for transient failures against external collaborators (LLM
//! providers, peer nodes). Policy and auth failures are never retried;
//! the caller decides retryability through the `should_retry` predicate.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Backoff configuration.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Jitter fraction in `[0.0, 1.0]`; each delay is multiplied by a
    /// random factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// The delay before retry number `attempt` (1-based).
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(2u32.saturating_pow(exp))
            .min(self.max_delay);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        let millis = base.as_millis() as f64 * factor;
        Duration::from_millis(millis as u64)
    }
}

/// Run `op` until it succeeds, the predicate declines, or attempts run
/// out. Returns the last error if all attempts fail.
///
/// # Errors
///
/// The final attempt's error, unchanged.
pub async fn retry<T, E, F, Fut, P>(
    config: &RetryConfig,
    op_name: &str,
    should_retry: P,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && should_retry(&e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    op = op_name,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient failure; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            },
            Err(e) => {
                debug!(op = op_name, attempt, error = %e, "giving up");
                return Err(e);
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry(
            &RetryConfig::default(),
            "test",
            |_| true,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(7)
            },
        )
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        };
        let result: Result<u32, String> = retry(
            &config,
            "test",
            |_| true,
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("transient".to_string()) } else { Ok(42) }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            ..RetryConfig::default()
        };
        let result: Result<(), String> =
            retry(&config, "test", |_| true, || async { Err("always".to_string()) }).await;
        assert_eq!(result.unwrap_err(), "always");
    }

    #[tokio::test]
    async fn test_predicate_stops_retries() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = retry(
            &RetryConfig::default(),
            "test",
            |e: &String| e != "fatal",
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("fatal".to_string())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delay_growth_is_capped() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: 0.0,
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(8), Duration::from_secs(1));
        assert_eq!(config.delay_for(30), Duration::from_secs(1));
    }
}
