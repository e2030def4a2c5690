//! Job orchestration.
//!
//! `Coordinator` composes the focused submodules into one start/stop surface:
//! - `lifecycle` owns the run token, the fatal error handler and the metrics reporter.
//! - `worker_pool` binds worker tasks to slots and restarts them.
//! - `monitor` detects stalls, publishes progress and decides completion.
//! - `aggregate` merges the worker result stores once the pool has stopped.
//!
//! A job ends in one of three ways: the queue drains with every slot done (`Completed`), an
//! external stop request cancels the run (`Stopped`), or a fatal error aborts it (`Aborted`).
//! Every ending still aggregates whatever the workers persisted.

use super::aggregate::{AggregateReport, Aggregator};
use super::lifecycle::{RunLifecycle, RunLifecycleParams};
use super::monitor::{Monitor, MonitorExit, MonitorParams};
use super::worker_pool::WorkerPool;

use crate::collect::collector::{Boundary, CollectionSummary, Collector, CollectorParams};
use crate::collect::work_queue::WorkQueue;
use crate::collect::worker::{WorkerShared, WorkerSharedParams, WorkerTable};
use crate::runtime::config::JobConfig;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::progress::{ProgressEvent, ProgressFeed};
use crate::runtime::telemetry::Telemetry;
use crate::source::{RateLimiter, RemoteSource, SourceClient, SourceClientOptions};
use crate::store::JobStorage;
use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    Completed,
    Stopped,
    Aborted { reason: String },
}

impl JobStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    pub status: JobStatus,
    pub total_enqueued: u64,
    pub aggregate: AggregateReport,
}

/// Cooperative stop control for a running job, usable while the owner awaits
/// [`Coordinator::wait`].
#[derive(Clone)]
pub struct StopHandle {
    run_token: CancellationToken,
}

impl StopHandle {
    /// Cancels the job's run token. Workers stop at their next suspension point and keep the
    /// checkpoints of their in-flight items, so a later job resumes them.
    pub fn request_stop(&self) {
        if !self.run_token.is_cancelled() {
            tracing::info!("stop requested; cancelling the running job");
        }
        self.run_token.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.run_token.is_cancelled()
    }
}

struct RunningJob {
    lifecycle: RunLifecycle,
    fatal_handler: FatalErrorHandler,
    telemetry: Arc<Telemetry>,
    pool: Arc<WorkerPool>,
    clients: SourceClients,
    collector: JoinHandle<Option<CollectionSummary>>,
    monitor: JoinHandle<MonitorExit>,
}

struct SourceClients {
    listing: SourceClient,
    detail: SourceClient,
}

impl SourceClients {
    fn log_metrics(&self) {
        for (role, metrics) in [
            ("listing", self.listing.metrics()),
            ("detail", self.detail.metrics()),
        ] {
            tracing::info!(
                role,
                requests = metrics.requests,
                errors = metrics.errors,
                timeouts = metrics.timeouts,
                rate_limited = metrics.rate_limited,
                mean_latency_ms = format!("{:.1}", metrics.mean_latency_ms),
                max_latency_ms = format!("{:.1}", metrics.max_latency_ms),
                "source request metrics"
            );
        }
    }
}

pub struct Coordinator {
    config: JobConfig,
    source: Arc<dyn RemoteSource>,
    storage: JobStorage,
    progress: ProgressFeed,
    shutdown_root: CancellationToken,
    job: Option<RunningJob>,
}

impl Coordinator {
    pub fn new(config: JobConfig, source: Arc<dyn RemoteSource>, storage: JobStorage) -> Self {
        Self::with_cancellation_token(config, source, storage, CancellationToken::new())
    }

    /// Like [`Self::new`], deriving every run token from `shutdown_root`.
    pub fn with_cancellation_token(
        config: JobConfig,
        source: Arc<dyn RemoteSource>,
        storage: JobStorage,
        shutdown_root: CancellationToken,
    ) -> Self {
        let progress = ProgressFeed::new(config.progress_buffer());
        Self {
            config,
            source,
            storage,
            progress,
            shutdown_root,
            job: None,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn storage(&self) -> &JobStorage {
        &self.storage
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    pub fn progress(&self) -> &ProgressFeed {
        &self.progress
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    /// Counters of the running job, if any.
    pub fn telemetry(&self) -> Option<Arc<Telemetry>> {
        self.job.as_ref().map(|job| job.telemetry.clone())
    }

    /// Replaces the root token. Only valid between jobs.
    pub fn replace_shutdown_root(&mut self, shutdown: CancellationToken) {
        debug_assert!(
            self.job.is_none(),
            "shutdown token should not change while a job is running"
        );
        self.shutdown_root = shutdown;
    }

    /// Starts collection and `worker_count` workers. Returns once every task is spawned.
    pub async fn begin(&mut self, boundary: Boundary, worker_count: usize) -> Result<()> {
        if self.job.is_some() {
            bail!("a job is already running");
        }
        if worker_count == 0 {
            bail!("worker_count must be greater than zero");
        }
        if self.shutdown_root.is_cancelled() {
            bail!("shutdown root is cancelled; replace it before starting another job");
        }

        let config = &self.config;
        tracing::info!(
            oldest = boundary.oldest(),
            worker_count,
            queue_capacity = config.queue_capacity(),
            "starting backfill job"
        );

        let telemetry = Arc::new(Telemetry::default());
        let queue = Arc::new(WorkQueue::with_requeue_headroom(
            config.queue_capacity(),
            worker_count,
        ));
        requeue_orphaned_checkpoints(&self.storage, &queue, worker_count).await?;

        let lifecycle = RunLifecycle::spawn(RunLifecycleParams {
            shutdown_root: &self.shutdown_root,
            telemetry: telemetry.clone(),
            queue: queue.clone(),
            metrics_interval: config.metrics_interval(),
        });
        let run_token = lifecycle.run_token.clone();
        let fatal_handler = lifecycle.fatal_handler();

        let collector_client = SourceClient::new(
            self.source.clone(),
            Arc::new(RateLimiter::new(config.collector_request_interval())),
            SourceClientOptions::for_collector(config),
            telemetry.clone(),
        );
        let worker_client = SourceClient::new(
            self.source.clone(),
            Arc::new(RateLimiter::new(config.worker_request_interval())),
            SourceClientOptions::for_workers(config),
            telemetry.clone(),
        );

        let clients = SourceClients {
            listing: collector_client.clone(),
            detail: worker_client.clone(),
        };

        let shared = WorkerShared::new(WorkerSharedParams {
            queue: queue.clone(),
            table: Arc::new(WorkerTable::new(worker_count)),
            client: worker_client,
            storage: self.storage.clone(),
            telemetry: telemetry.clone(),
            retry_limit: config.retry_limit(),
            max_child_pages: config.max_child_pages(),
        });
        let pool = Arc::new(WorkerPool::new(
            shared,
            run_token.clone(),
            fatal_handler.clone(),
        ));

        let collector = Collector::new(CollectorParams {
            client: collector_client,
            queue: queue.clone(),
            telemetry: telemetry.clone(),
            boundary,
            shutdown: run_token.clone(),
        });
        let collector_state = collector.state();

        let monitor = Monitor::new(MonitorParams {
            pool: pool.clone(),
            queue,
            storage: self.storage.clone(),
            telemetry: telemetry.clone(),
            progress: self.progress.clone(),
            collector_state,
            interval: config.monitor_interval(),
            stall_timeout: config.stall_timeout(),
            recovery_grace: config.recovery_grace(),
            shutdown: run_token,
        });

        pool.spawn_all();
        let collector = spawn_collector(collector, self.progress.clone(), fatal_handler.clone());
        let monitor = spawn_monitor(monitor, fatal_handler.clone());

        self.job = Some(RunningJob {
            lifecycle,
            fatal_handler,
            telemetry,
            pool,
            clients,
            collector,
            monitor,
        });
        Ok(())
    }

    /// Stop control for the running job, if any.
    pub fn stop_handle(&self) -> Option<StopHandle> {
        self.job.as_ref().map(|job| StopHandle {
            run_token: job.lifecycle.run_token.clone(),
        })
    }

    /// Asks the running job to stop at its next suspension point. See [`StopHandle`].
    pub fn request_stop(&self) {
        if let Some(handle) = self.stop_handle() {
            handle.request_stop();
        }
    }

    /// Waits for the running job to end, tears it down and aggregates its results.
    pub async fn wait(&mut self) -> Result<JobReport> {
        let job = self.job.take().context("no job is running")?;
        let RunningJob {
            lifecycle,
            fatal_handler,
            telemetry,
            pool,
            clients,
            collector,
            monitor,
        } = job;

        let exit = match monitor.await {
            Ok(exit) => exit,
            Err(err) => {
                fatal_handler.trigger("heartbeat monitor task failed", anyhow!(err));
                MonitorExit::Cancelled
            }
        };

        lifecycle.run_token.cancel();
        if let Err(err) = collector.await {
            fatal_handler.trigger("collector task failed", anyhow!(err));
        }
        pool.join().await;

        let status = if let Some(reason) = lifecycle.abort_reason() {
            JobStatus::Aborted { reason }
        } else if exit == MonitorExit::Completed {
            JobStatus::Completed
        } else {
            JobStatus::Stopped
        };
        lifecycle.shutdown().await;
        clients.log_metrics();

        let aggregate = Aggregator::new(self.storage.clone())
            .run()
            .await
            .context("failed to aggregate worker results")?;
        let report = JobReport {
            status,
            total_enqueued: telemetry.enqueued(),
            aggregate,
        };

        tracing::info!(
            status = ?report.status,
            total_enqueued = report.total_enqueued,
            total_collected = report.aggregate.summary.total_collected,
            total_failed_permanently = report.aggregate.summary.total_failed_permanently,
            stall_recoveries = telemetry.stall_recoveries(),
            "backfill job finished"
        );
        self.progress.publish(ProgressEvent::Finished {
            status: report.status.clone(),
        });
        Ok(report)
    }

    /// `begin` with the configured worker count, then `wait`.
    pub async fn run(&mut self, boundary: Boundary) -> Result<JobReport> {
        self.begin(boundary, self.config.worker_count()).await?;
        self.wait().await
    }
}

/// Hands checkpoints left by slots this job will not have back to the queue.
async fn requeue_orphaned_checkpoints(
    storage: &JobStorage,
    queue: &WorkQueue,
    worker_count: usize,
) -> Result<()> {
    let checkpoints = storage
        .checkpoints
        .list()
        .await
        .context("failed to list checkpoints")?;

    for checkpoint in checkpoints {
        if checkpoint.worker_id < worker_count {
            tracing::info!(
                worker = checkpoint.worker_id,
                item_id = checkpoint.item.id(),
                "checkpoint found; the slot resumes it first"
            );
            continue;
        }
        tracing::info!(
            worker = checkpoint.worker_id,
            item_id = checkpoint.item.id(),
            "requeueing checkpoint of a slot outside this job's pool"
        );
        queue.requeue(checkpoint.item);
        storage
            .checkpoints
            .clear(checkpoint.worker_id)
            .await
            .with_context(|| format!("failed to clear checkpoint of worker {}", checkpoint.worker_id))?;
    }
    Ok(())
}

fn spawn_collector(
    collector: Collector,
    progress: ProgressFeed,
    fatal_handler: FatalErrorHandler,
) -> JoinHandle<Option<CollectionSummary>> {
    tokio::spawn(async move {
        match collector.run().await {
            Ok(summary) => {
                progress.publish(ProgressEvent::CollectionFinished {
                    enqueued: summary.enqueued,
                });
                Some(summary)
            }
            Err(err) => {
                fatal_handler.trigger("collector could not read the listing", err);
                None
            }
        }
    })
}

fn spawn_monitor(monitor: Monitor, fatal_handler: FatalErrorHandler) -> JoinHandle<MonitorExit> {
    tokio::spawn(async move {
        match monitor.run().await {
            Ok(exit) => exit,
            Err(err) => {
                fatal_handler.trigger("heartbeat monitor failed", err);
                MonitorExit::Cancelled
            }
        }
    })
}
