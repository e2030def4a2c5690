use std::sync::Arc;
use std::time::Duration;

use crate::support::{
    helpers::{dataset_ids, init_tracing, test_config},
    mock_source::MockSource,
};
use anyhow::{Context, Result};
use backfill::{Boundary, JobStatus, JobStorage, Runner};
use tokio::time::{sleep, timeout};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stop_future_stops_the_job_and_a_rerun_finishes_it() -> Result<()> {
    init_tracing();
    let source = MockSource::new(20, 5).with_detail_delay(Duration::from_millis(80));
    let storage = JobStorage::in_memory();
    let mut runner = Runner::new(test_config(2).build()?, Arc::new(source), storage.clone());

    let stopped = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), sleep(Duration::from_millis(250))),
    )
    .await
    .context("runner should honour the stop future")??;
    assert_eq!(stopped.status, JobStatus::Stopped);
    assert!(stopped.aggregate.dataset.len() < 20);
    assert!(!runner.coordinator().is_running());

    let finished = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), std::future::pending()),
    )
    .await
    .context("second run should complete")??;
    assert_eq!(finished.status, JobStatus::Completed);
    let expected: Vec<String> = (0..20).map(MockSource::id_of).collect();
    assert_eq!(dataset_ids(&finished.aggregate.dataset), expected);
    assert!(storage.checkpoints.list().await?.is_empty());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_root_token_stops_the_job_and_is_replaced() -> Result<()> {
    init_tracing();
    let source = MockSource::new(20, 5).with_detail_delay(Duration::from_millis(80));
    let mut runner = Runner::new(
        test_config(2).build()?,
        Arc::new(source),
        JobStorage::in_memory(),
    );

    let token = runner.cancellation_token();
    let canceller = tokio::spawn(async move {
        sleep(Duration::from_millis(200)).await;
        token.cancel();
    });

    let report = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), std::future::pending()),
    )
    .await
    .context("root cancellation should end the job")??;
    canceller.await?;

    assert_eq!(report.status, JobStatus::Stopped);
    assert!(
        !runner.cancellation_token().is_cancelled(),
        "runner should hand out a fresh token after a cancelled run"
    );

    let report = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), std::future::pending()),
    )
    .await??;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 20);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn runner_reports_abort_and_recovers_for_the_next_job() -> Result<()> {
    init_tracing();
    let source = MockSource::new(6, 3);
    source.set_listing_failure(true);
    let mut runner = Runner::new(
        test_config(2).build()?,
        Arc::new(source.clone()),
        JobStorage::in_memory(),
    );

    let aborted = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), std::future::pending()),
    )
    .await??;
    let JobStatus::Aborted { reason } = &aborted.status else {
        panic!("expected an aborted job, got {:?}", aborted.status);
    };
    assert!(
        reason.contains("listing page <first> failed after retries"),
        "abort reason should name the failing page, got {reason}"
    );

    source.set_listing_failure(false);
    let report = timeout(
        Duration::from_secs(10),
        runner.run_until(Boundary::unbounded(), std::future::pending()),
    )
    .await??;
    assert_eq!(report.status, JobStatus::Completed);
    assert_eq!(report.aggregate.dataset.len(), 6);
    Ok(())
}
