use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{
        assert_in_sequence_order, dataset_ids, drain_events, init_tracing, test_config,
        wait_for_collected,
    },
    mock_source::MockSource,
};
use anyhow::{Context, Result};
use backfill::{
    Aggregator, Boundary, CollectedRecord, Coordinator, JobStatus, JobStorage, ProgressEvent,
};
use backfill::store::{MemoryResultStore, ResultStore};
use futures::future::{self, BoxFuture};
use tokio::time::timeout;

const JOB_TIMEOUT: Duration = Duration::from_secs(15);

/// In-memory results whose first write for one item never completes.
struct WedgedResults {
    inner: MemoryResultStore,
    item_id: &'static str,
    wedged: AtomicBool,
}

impl WedgedResults {
    fn new(item_id: &'static str) -> Self {
        Self {
            inner: MemoryResultStore::default(),
            item_id,
            wedged: AtomicBool::new(false),
        }
    }
}

impl ResultStore for WedgedResults {
    fn append(&self, worker_id: usize, record: CollectedRecord) -> BoxFuture<'_, Result<()>> {
        if record.id == self.item_id && !self.wedged.swap(true, Ordering::SeqCst) {
            return Box::pin(future::pending());
        }
        self.inner.append(worker_id, record)
    }

    fn workers(&self) -> BoxFuture<'_, Result<Vec<usize>>> {
        self.inner.workers()
    }

    fn load(&self, worker_id: usize) -> BoxFuture<'_, Result<Vec<CollectedRecord>>> {
        self.inner.load(worker_id)
    }
}

fn restart_count(events: &[ProgressEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, ProgressEvent::WorkerRestarted { .. }))
        .count()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completed_job_accounts_for_every_item() -> Result<()> {
    init_tracing();
    let source = MockSource::new(30, 7);
    source.reject("item-5");
    source.reject("item-12");

    let storage = JobStorage::in_memory();
    let mut coordinator =
        Coordinator::new(test_config(4).build()?, Arc::new(source.clone()), storage.clone());
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded()))
        .await
        .context("job should finish")??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.total_enqueued, 30);
    let summary = &report.aggregate.summary;
    assert_eq!(summary.total_collected, 28);
    assert_eq!(summary.total_failed_permanently, 2);
    assert_eq!(
        summary.total_collected + summary.total_failed_permanently,
        report.total_enqueued as usize
    );
    assert!(summary.dropped.is_empty());
    assert_eq!(summary.per_worker.values().sum::<usize>(), 28);
    assert_eq!(source.listing_calls(), 5);

    let ids = dataset_ids(&report.aggregate.dataset);
    assert!(!ids.contains(&"item-5".to_owned()));
    assert!(!ids.contains(&"item-12".to_owned()));
    assert_in_sequence_order(&report.aggregate.dataset);

    let failures = storage.failures.load().await?;
    assert_eq!(failures.len(), 2);
    assert!(failures.iter().all(|failed| failed.item.retry_count() == 1));
    assert_eq!(source.detail_calls("item-5"), 2);
    assert!(storage.checkpoints.list().await?.is_empty());

    let again = Aggregator::new(storage.clone()).run().await?;
    assert_eq!(
        again.dataset.to_json_bytes()?,
        report.aggregate.dataset.to_json_bytes()?
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dataset_follows_listing_order_not_completion_order() -> Result<()> {
    init_tracing();
    let source = MockSource::new(6, 3);
    source.slow_down("item-0", Duration::from_millis(250));

    let mut coordinator = Coordinator::new(
        test_config(3).build()?,
        Arc::new(source),
        JobStorage::in_memory(),
    );
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    let ids = dataset_ids(&report.aggregate.dataset);
    let expected: Vec<String> = (0..6).map(MockSource::id_of).collect();
    assert_eq!(ids, expected);

    let first = &report.aggregate.dataset.records()[0];
    let children: Vec<(&str, &str, u32)> = first
        .children
        .iter()
        .map(|child| (child.id.as_str(), child.parent_id.as_str(), child.depth))
        .collect();
    assert_eq!(
        children,
        vec![
            ("reply-0", "item-0", 0),
            ("reply-0-nested", "reply-0", 1),
            ("more-0-reply", "item-0", 0),
        ]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn boundary_date_limits_collection() -> Result<()> {
    init_tracing();
    let source = MockSource::new(40, 10);
    let mut coordinator = Coordinator::new(
        test_config(2).build()?,
        Arc::new(source.clone()),
        JobStorage::in_memory(),
    );

    // item-24 sits exactly on 2024-01-02T00:00:00Z and is still inside the window.
    let report = timeout(
        JOB_TIMEOUT,
        coordinator.run(Boundary::from_date("2024-01-02")?),
    )
    .await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.total_enqueued, 25);
    assert_eq!(report.aggregate.dataset.len(), 25);
    assert_eq!(source.listing_calls(), 3);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_worker_is_recovered_exactly_once() -> Result<()> {
    init_tracing();
    let source = MockSource::new(8, 4);
    let mut storage = JobStorage::in_memory();
    storage.results = Arc::new(WedgedResults::new("item-3"));
    let mut coordinator =
        Coordinator::new(test_config(2).build()?, Arc::new(source.clone()), storage.clone());
    let mut events = coordinator.subscribe();
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 8);
    assert_eq!(report.aggregate.summary.total_failed_permanently, 0);
    assert_eq!(source.detail_calls("item-3"), 2);
    assert!(storage.checkpoints.list().await?.is_empty());

    let events = drain_events(&mut events);
    let restarts: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            ProgressEvent::WorkerRestarted { requeued_item, .. } => Some(requeued_item.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(restarts.len(), 1, "expected one restart, got {restarts:?}");
    let requeued = restarts[0].as_ref().context("restart should requeue the stuck item")?;
    assert_eq!(requeued.id(), "item-3");
    assert_eq!(requeued.retry_count(), 0);

    assert!(matches!(
        events.last(),
        Some(ProgressEvent::Finished {
            status: JobStatus::Completed
        })
    ));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hung_request_times_out_and_is_retried_without_a_restart() -> Result<()> {
    init_tracing();
    let source = MockSource::new(8, 4);
    source.hang_once("item-3");

    let storage = JobStorage::in_memory();
    let config = test_config(2).item_max_attempts(2).build()?;
    let mut coordinator = Coordinator::new(config, Arc::new(source.clone()), storage.clone());
    let mut events = coordinator.subscribe();
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 8);
    assert_eq!(source.detail_calls("item-3"), 2);
    assert!(storage.failures.load().await?.is_empty());
    assert_eq!(restart_count(&drain_events(&mut events)), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn waiting_out_a_long_retry_after_is_not_a_stall() -> Result<()> {
    init_tracing();
    let source = MockSource::new(1, 1);
    source.rate_limit_for("item-0", 1, Duration::from_millis(700));

    let storage = JobStorage::in_memory();
    let config = test_config(1)
        .stall_timeout(Duration::from_millis(300))
        .monitor_interval(Duration::from_millis(20))
        .request_timeout(Duration::from_millis(200))
        .item_max_attempts(2)
        .build()?;
    let mut coordinator = Coordinator::new(config, Arc::new(source.clone()), storage.clone());
    let mut events = coordinator.subscribe();
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 1);
    assert_eq!(source.detail_calls("item-0"), 2);
    assert_eq!(restart_count(&drain_events(&mut events)), 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_failures_are_retried_until_they_succeed() -> Result<()> {
    init_tracing();
    let source = MockSource::new(10, 5);
    source.fail_transiently("item-2", 1);
    source.rate_limit("item-7", 1);

    let storage = JobStorage::in_memory();
    let config = test_config(2).item_max_attempts(2).retry_limit(3).build()?;
    let mut coordinator = Coordinator::new(config, Arc::new(source.clone()), storage.clone());
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 10);
    assert!(storage.failures.load().await?.is_empty());
    assert_eq!(source.detail_calls("item-2"), 2);
    assert_eq!(source.detail_calls("item-7"), 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn retry_ceiling_moves_item_to_failure_log() -> Result<()> {
    init_tracing();
    let source = MockSource::new(4, 4);
    source.reject("item-1");

    let storage = JobStorage::in_memory();
    let config = test_config(1).retry_limit(3).build()?;
    let mut coordinator = Coordinator::new(config, Arc::new(source.clone()), storage.clone());
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(source.detail_calls("item-1"), 3);

    let failures = storage.failures.load().await?;
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].item.id(), "item-1");
    assert_eq!(failures[0].item.retry_count(), 2);
    assert_eq!(failures[0].worker_id, 0);
    assert!(
        failures[0].error.contains("item-1 was removed"),
        "unexpected failure reason: {}",
        failures[0].error
    );
    assert_eq!(
        dataset_ids(&report.aggregate.dataset),
        vec!["item-0", "item-2", "item-3"]
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn listing_failure_aborts_the_job() -> Result<()> {
    init_tracing();
    let source = MockSource::new(10, 5);
    source.set_listing_failure(true);

    let mut coordinator = Coordinator::new(
        test_config(2).build()?,
        Arc::new(source.clone()),
        JobStorage::in_memory(),
    );
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;

    match &report.status {
        JobStatus::Aborted { reason } => assert!(
            reason.contains("collector could not read the listing"),
            "unexpected abort reason: {reason}"
        ),
        other => panic!("expected an aborted job, got {other:?}"),
    }
    assert_eq!(report.total_enqueued, 0);
    assert!(report.aggregate.dataset.is_empty());
    assert_eq!(source.listing_calls(), 2);
    assert!(!coordinator.is_running());

    let err = coordinator
        .begin(Boundary::unbounded(), 2)
        .await
        .expect_err("a fatal error cancels the root token");
    assert!(format!("{err:#}").contains("shutdown root is cancelled"));

    source.set_listing_failure(false);
    coordinator.replace_shutdown_root(tokio_util::sync::CancellationToken::new());
    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 10);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stopped_job_keeps_checkpoints_and_next_job_resumes() -> Result<()> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let source = MockSource::new(12, 4).with_detail_delay(Duration::from_millis(120));
    let storage = JobStorage::filesystem(dir.path().join("job"))?;

    let mut first = Coordinator::new(
        test_config(2).build()?,
        Arc::new(source.clone()),
        storage.clone(),
    );
    first.begin(Boundary::unbounded(), 2).await?;
    let stop = first.stop_handle().context("job should be running")?;
    wait_for_collected(&first, 2, Duration::from_secs(5)).await?;
    stop.request_stop();
    assert!(stop.is_stop_requested());

    let stopped = timeout(JOB_TIMEOUT, first.wait()).await??;
    assert_eq!(stopped.status, JobStatus::Stopped);
    let collected = stopped.aggregate.summary.total_collected;
    assert!(
        (2..12).contains(&collected),
        "stopped job collected {collected} items"
    );

    let stopped_ids: HashSet<String> = dataset_ids(&stopped.aggregate.dataset).into_iter().collect();
    for checkpoint in storage.checkpoints.list().await? {
        assert!(
            !stopped_ids.contains(checkpoint.item.id()),
            "checkpointed item {} was already collected",
            checkpoint.item.id()
        );
    }

    let reopened = JobStorage::filesystem(dir.path().join("job"))?;
    let mut second = Coordinator::new(test_config(2).build()?, Arc::new(source), reopened.clone());
    let resumed = timeout(JOB_TIMEOUT, second.run(Boundary::unbounded())).await??;

    assert_eq!(resumed.status, JobStatus::Completed);
    let expected: Vec<String> = (0..12).map(MockSource::id_of).collect();
    assert_eq!(dataset_ids(&resumed.aggregate.dataset), expected);
    assert!(reopened.checkpoints.list().await?.is_empty());

    let output = dir.path().join("dataset.json");
    resumed.aggregate.dataset.write_to(&output).await?;
    let written: Vec<CollectedRecord> = serde_json::from_slice(&std::fs::read(&output)?)?;
    assert_eq!(written.len(), 12);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn bounded_queue_applies_backpressure_to_the_collector() -> Result<()> {
    init_tracing();
    let source = MockSource::new(16, 8).with_detail_delay(Duration::from_millis(30));
    let config = test_config(1).queue_capacity(2).build()?;
    let mut coordinator = Coordinator::new(config, Arc::new(source), JobStorage::in_memory());
    let mut events = coordinator.subscribe();

    let report = timeout(JOB_TIMEOUT, coordinator.run(Boundary::unbounded())).await??;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 16);

    let depths: Vec<usize> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            ProgressEvent::Snapshot(snapshot) => Some(snapshot.queue_depth),
            _ => None,
        })
        .collect();
    assert!(!depths.is_empty(), "monitor should publish snapshots");
    assert!(
        depths.iter().all(|depth| *depth <= 2),
        "queue grew past its capacity: {depths:?}"
    );
    Ok(())
}
