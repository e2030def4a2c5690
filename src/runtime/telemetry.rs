use crate::collect::work_queue::WorkQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio::{select, time};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Default interval used by the metrics reporter task.
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(5);

static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Installs a basic tracing subscriber (if one is not already active).
///
/// The subscriber honours `RUST_LOG` if it is present, otherwise it falls back to `info`.
/// Calling this function multiple times is harmless.
pub fn init_tracing() {
    if TRACING_INIT.get().is_some() {
        return;
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    let _ = TRACING_INIT.set(());
}

/// Job-wide rolling counters.
#[derive(Default, Debug)]
pub struct Telemetry {
    enqueued: AtomicU64,
    collected: AtomicU64,
    attempt_failures: AtomicU64,
    permanent_failures: AtomicU64,
    requeues: AtomicU64,
    stall_recoveries: AtomicU64,
    request_errors: AtomicU64,
    request_timeouts: AtomicU64,
    rate_limited: AtomicU64,
}

impl Telemetry {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_collected(&self) {
        self.collected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_attempt_failure(&self) {
        self.attempt_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_permanent_failure(&self) {
        self.permanent_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_requeue(&self) {
        self.requeues.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stall_recovery(&self) {
        self.stall_recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_error(&self) {
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_timeout(&self) {
        self.request_timeouts.fetch_add(1, Ordering::Relaxed);
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        self.request_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    pub fn collected(&self) -> u64 {
        self.collected.load(Ordering::Relaxed)
    }

    pub fn stall_recoveries(&self) -> u64 {
        self.stall_recoveries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            collected: self.collected.load(Ordering::Relaxed),
            attempt_failures: self.attempt_failures.load(Ordering::Relaxed),
            permanent_failures: self.permanent_failures.load(Ordering::Relaxed),
            requeues: self.requeues.load(Ordering::Relaxed),
            stall_recoveries: self.stall_recoveries.load(Ordering::Relaxed),
            request_errors: self.request_errors.load(Ordering::Relaxed),
            request_timeouts: self.request_timeouts.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    pub enqueued: u64,
    pub collected: u64,
    pub attempt_failures: u64,
    pub permanent_failures: u64,
    pub requeues: u64,
    pub stall_recoveries: u64,
    pub request_errors: u64,
    pub request_timeouts: u64,
    pub rate_limited: u64,
}

/// Spawns a background task that periodically logs throughput, queue depth, and failure counters.
pub fn spawn_metrics_reporter(
    telemetry: Arc<Telemetry>,
    queue: Arc<WorkQueue>,
    shutdown: CancellationToken,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut last_snapshot = telemetry.snapshot();
        let mut last_tick = Instant::now();

        loop {
            select! {
                _ = shutdown.cancelled() => {
                    tracing::info!(target: "backfill::metrics", "metrics reporter shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let current_snapshot = telemetry.snapshot();
                    let collected_delta = current_snapshot
                        .collected
                        .saturating_sub(last_snapshot.collected);
                    let elapsed = last_tick.elapsed().as_secs_f64();
                    let throughput = if elapsed <= f64::EPSILON {
                        0.0
                    } else {
                        collected_delta as f64 / elapsed
                    };

                    tracing::info!(
                        target: "backfill::metrics",
                        throughput = format!("{throughput:.2}"),
                        enqueued = current_snapshot.enqueued,
                        collected = current_snapshot.collected,
                        queue_depth = queue.len(),
                        attempt_failures = current_snapshot.attempt_failures,
                        permanent_failures = current_snapshot.permanent_failures,
                        requeues = current_snapshot.requeues,
                        stall_recoveries = current_snapshot.stall_recoveries,
                        request_errors = current_snapshot.request_errors,
                        request_timeouts = current_snapshot.request_timeouts,
                        rate_limited = current_snapshot.rate_limited,
                        "runtime metrics snapshot"
                    );

                    last_snapshot = current_snapshot;
                    last_tick = Instant::now();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::item::WorkItem;
    use tokio::time::timeout;

    #[tokio::test]
    async fn telemetry_records_counters() {
        let telemetry = Telemetry::default();
        telemetry.record_enqueued();
        telemetry.record_enqueued();
        telemetry.record_collected();
        telemetry.record_attempt_failure();
        telemetry.record_requeue();
        telemetry.record_request_timeout();
        telemetry.record_rate_limited();
        telemetry.record_stall_recovery();

        let snapshot = telemetry.snapshot();
        assert_eq!(snapshot.enqueued, 2);
        assert_eq!(snapshot.collected, 1);
        assert_eq!(snapshot.attempt_failures, 1);
        assert_eq!(snapshot.requeues, 1);
        assert_eq!(snapshot.request_errors, 2);
        assert_eq!(snapshot.request_timeouts, 1);
        assert_eq!(snapshot.rate_limited, 1);
        assert_eq!(telemetry.stall_recoveries(), 1);
    }

    #[tokio::test]
    async fn metrics_reporter_logs_until_shutdown() {
        let telemetry = Arc::new(Telemetry::default());
        telemetry.record_collected();
        let queue = Arc::new(WorkQueue::with_capacity(4));
        queue
            .push(WorkItem::new("a", 0, "/a"))
            .await
            .expect("push should succeed");

        let shutdown = CancellationToken::new();
        let handle = spawn_metrics_reporter(
            telemetry,
            queue,
            shutdown.clone(),
            Duration::from_millis(10),
        );

        shutdown.cancel();
        timeout(Duration::from_secs(1), handle)
            .await
            .expect("reporter should stop promptly")
            .expect("task should not panic");
    }
}
