//! Per-client request accounting. The collector and the worker pool each own a
//! [`SourceClient`](crate::source::SourceClient), so listing and detail traffic are reported apart.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub(crate) struct SourceMetrics {
    requests: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    rate_limited: AtomicU64,
    latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
}

fn nanos(latency: Duration) -> u64 {
    u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX)
}

impl SourceMetrics {
    fn observe(&self, latency: Duration) {
        let latency = nanos(latency);
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.latency_ns.fetch_add(latency, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(latency, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self, latency: Duration) {
        self.observe(latency);
    }

    pub(crate) fn record_failure(&self, latency: Duration) {
        self.observe(latency);
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self, latency: Duration) {
        self.record_failure(latency);
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Rate-limit answers are counted apart from errors: they are the source pacing us.
    pub(crate) fn record_rate_limited(&self, latency: Duration) {
        self.observe(latency);
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> SourceMetricsSnapshot {
        let requests = self.requests.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let latency_ns = self.latency_ns.load(Ordering::Relaxed);
        let (mean_latency_ms, error_rate) = if requests == 0 {
            (0.0, 0.0)
        } else {
            (
                latency_ns as f64 / requests as f64 / 1_000_000.0,
                errors as f64 / requests as f64,
            )
        };

        SourceMetricsSnapshot {
            requests,
            errors,
            timeouts: self.timeouts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            mean_latency_ms,
            max_latency_ms: self.max_latency_ns.load(Ordering::Relaxed) as f64 / 1_000_000.0,
            error_rate,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct SourceMetricsSnapshot {
    pub requests: u64,
    /// Failed requests, timeouts included.
    pub errors: u64,
    pub timeouts: u64,
    pub rate_limited: u64,
    pub mean_latency_ms: f64,
    pub max_latency_ms: f64,
    pub error_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_derives_rates() {
        let metrics = SourceMetrics::default();
        metrics.record_success(Duration::from_millis(2));
        metrics.record_timeout(Duration::from_millis(4));
        metrics.record_rate_limited(Duration::from_millis(0));
        metrics.record_success(Duration::from_millis(2));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 4);
        assert_eq!(snapshot.errors, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert!((snapshot.error_rate - 0.25).abs() < f64::EPSILON);
        assert!((snapshot.mean_latency_ms - 2.0).abs() < 1e-9);
        assert!((snapshot.max_latency_ms - 4.0).abs() < 1e-9);
    }

    #[test]
    fn empty_snapshot_is_zeroed() {
        let snapshot = SourceMetrics::default().snapshot();
        assert_eq!(snapshot.requests, 0);
        assert_eq!(snapshot.mean_latency_ms, 0.0);
        assert_eq!(snapshot.max_latency_ms, 0.0);
    }
}
