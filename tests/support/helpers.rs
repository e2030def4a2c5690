use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use backfill::{AggregateDataset, Coordinator, JobConfig, JobConfigBuilder, ProgressEvent};
use once_cell::sync::Lazy;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

static TRACING_SUBSCRIBER: Lazy<()> = Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn init_tracing() {
    Lazy::force(&TRACING_SUBSCRIBER);
}

/// Fast, unpaced settings for jobs against the in-process source.
pub fn test_config(worker_count: usize) -> JobConfigBuilder {
    JobConfig::builder()
        .worker_count(worker_count)
        .queue_capacity(8)
        .stall_timeout(Duration::from_millis(800))
        .monitor_interval(Duration::from_millis(50))
        .recovery_grace(Duration::from_millis(100))
        .request_timeout(Duration::from_millis(400))
        .collector_request_interval(Duration::ZERO)
        .worker_request_interval(Duration::ZERO)
        .page_max_attempts(2)
        .item_max_attempts(1)
        .retry_limit(2)
        .initial_backoff(Duration::from_millis(10))
        .max_backoff(Duration::from_millis(20))
        .metrics_interval(Duration::from_secs(1))
        .progress_buffer(1024)
}

pub async fn wait_for_collected(
    coordinator: &Coordinator,
    target: u64,
    timeout: Duration,
) -> Result<()> {
    let start = Instant::now();
    loop {
        let collected = coordinator
            .telemetry()
            .map(|telemetry| telemetry.collected())
            .unwrap_or_default();
        if collected >= target {
            return Ok(());
        }
        if start.elapsed() > timeout {
            bail!("job did not collect {target} items within {timeout:?} (collected: {collected})");
        }
        sleep(Duration::from_millis(10)).await;
    }
}

/// Everything currently buffered on a progress subscription.
pub fn drain_events(receiver: &mut broadcast::Receiver<ProgressEvent>) -> Vec<ProgressEvent> {
    let mut events = Vec::new();
    loop {
        match receiver.try_recv() {
            Ok(event) => events.push(event),
            Err(TryRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "progress subscriber lagged in test");
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return events,
        }
    }
}

pub fn assert_in_sequence_order(dataset: &AggregateDataset) {
    let indices: Vec<u64> = dataset
        .records()
        .iter()
        .map(|record| record.sequence_index)
        .collect();
    assert!(
        indices.windows(2).all(|pair| pair[0] < pair[1]),
        "dataset is not ordered by sequence index: {indices:?}"
    );
}

pub fn dataset_ids(dataset: &AggregateDataset) -> Vec<String> {
    dataset
        .records()
        .iter()
        .map(|record| record.id.clone())
        .collect()
}
