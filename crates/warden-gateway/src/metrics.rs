//! The metrics registry.
//!
//! Counters, gauges, and fixed-bucket histograms behind atomics,
//! rendered in Prometheus text exposition format with a `warden_`
//! name prefix.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

/// Histogram bucket upper bounds, milliseconds.
const LATENCY_BUCKETS_MS: &[u64] = &[5, 10, 25, 50, 100, 250, 500, 1_000, 2_500, 5_000, 10_000];

#[derive(Default)]
struct Histogram {
    buckets: Vec<AtomicU64>,
    count: AtomicU64,
    sum: AtomicU64,
}

/// Process-wide metrics.
#[derive(Default)]
pub struct MetricsRegistry {
    counters: DashMap<String, AtomicU64>,
    gauges: DashMap<String, AtomicI64>,
    histograms: DashMap<String, Histogram>,
}

impl MetricsRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter by 1.
    pub fn incr(&self, name: &str) {
        self.add(name, 1);
    }

    /// Increment a counter by `delta`.
    pub fn add(&self, name: &str, delta: u64) {
        self.counters
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a counter.
    #[must_use]
    pub fn counter(&self, name: &str) -> u64 {
        self.counters
            .get(name)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Set a gauge.
    pub fn set_gauge(&self, name: &str, value: i64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .store(value, Ordering::Relaxed);
    }

    /// Adjust a gauge by `delta`.
    pub fn adjust_gauge(&self, name: &str, delta: i64) {
        self.gauges
            .entry(name.to_string())
            .or_default()
            .fetch_add(delta, Ordering::Relaxed);
    }

    /// Read a gauge.
    #[must_use]
    pub fn gauge(&self, name: &str) -> i64 {
        self.gauges
            .get(name)
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Record a latency observation, milliseconds.
    pub fn observe_ms(&self, name: &str, value_ms: u64) {
        let histogram = self.histograms.entry(name.to_string()).or_insert_with(|| {
            Histogram {
                buckets: LATENCY_BUCKETS_MS.iter().map(|_| AtomicU64::new(0)).collect(),
                count: AtomicU64::new(0),
                sum: AtomicU64::new(0),
            }
        });
        for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&histogram.buckets) {
            if value_ms <= *bound {
                bucket.fetch_add(1, Ordering::Relaxed);
            }
        }
        histogram.count.fetch_add(1, Ordering::Relaxed);
        histogram.sum.fetch_add(value_ms, Ordering::Relaxed);
    }

    /// Render everything in Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();

        let mut counter_names: Vec<String> = self.counters.iter().map(|e| e.key().clone()).collect();
        counter_names.sort();
        for name in counter_names {
            let value = self.counter(&name);
            out.push_str(&format!("# TYPE warden_{name} counter\nwarden_{name} {value}\n"));
        }

        let mut gauge_names: Vec<String> = self.gauges.iter().map(|e| e.key().clone()).collect();
        gauge_names.sort();
        for name in gauge_names {
            let value = self.gauge(&name);
            out.push_str(&format!("# TYPE warden_{name} gauge\nwarden_{name} {value}\n"));
        }

        let mut histogram_names: Vec<String> =
            self.histograms.iter().map(|e| e.key().clone()).collect();
        histogram_names.sort();
        for name in histogram_names {
            if let Some(histogram) = self.histograms.get(&name) {
                out.push_str(&format!("# TYPE warden_{name} histogram\n"));
                for (bound, bucket) in LATENCY_BUCKETS_MS.iter().zip(&histogram.buckets) {
                    out.push_str(&format!(
                        "warden_{name}_bucket{{le=\"{bound}\"}} {}\n",
                        bucket.load(Ordering::Relaxed)
                    ));
                }
                let count = histogram.count.load(Ordering::Relaxed);
                out.push_str(&format!(
                    "warden_{name}_bucket{{le=\"+Inf\"}} {count}\n"
                ));
                out.push_str(&format!(
                    "warden_{name}_sum {}\n",
                    histogram.sum.load(Ordering::Relaxed)
                ));
                out.push_str(&format!("warden_{name}_count {count}\n"));
            }
        }
        out
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("counters", &self.counters.len())
            .field("gauges", &self.gauges.len())
            .field("histograms", &self.histograms.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_and_gauges() {
        let metrics = MetricsRegistry::new();
        metrics.incr("messages_total");
        metrics.add("messages_total", 4);
        metrics.set_gauge("connections", 2);
        metrics.adjust_gauge("connections", -1);

        assert_eq!(metrics.counter("messages_total"), 5);
        assert_eq!(metrics.gauge("connections"), 1);
        assert_eq!(metrics.counter("missing"), 0);
    }

    #[test]
    fn test_render_format() {
        let metrics = MetricsRegistry::new();
        metrics.incr("decisions_total");
        metrics.set_gauge("connections", 3);
        metrics.observe_ms("request_duration_ms", 42);

        let text = metrics.render();
        assert!(text.contains("# TYPE warden_decisions_total counter"));
        assert!(text.contains("warden_decisions_total 1"));
        assert!(text.contains("warden_connections 3"));
        assert!(text.contains("warden_request_duration_ms_bucket{le=\"50\"} 1"));
        assert!(text.contains("warden_request_duration_ms_bucket{le=\"25\"} 0"));
        assert!(text.contains("warden_request_duration_ms_count 1"));
        assert!(text.contains("warden_request_duration_ms_sum 42"));
    }
}
