//! Heartbeat monitor.
//!
//! Ticks on a fixed cadence, detaches any Working slot whose heartbeat is older than the stall
//! timeout, hands its in-flight item back to the queue and binds a fresh task to the slot. The
//! rest of the pool never waits on a stalled worker. Each tick also publishes a progress snapshot,
//! and the monitor decides when the job has finished.

use super::worker_pool::WorkerPool;
use crate::collect::collector::CollectorState;
use crate::collect::work_queue::WorkQueue;
use crate::collect::worker::{StalledSlot, WorkerTable};
use crate::runtime::progress::{ProgressEvent, ProgressFeed, ProgressSnapshot, WorkerProgress};
use crate::runtime::telemetry::Telemetry;
use crate::store::JobStorage;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MonitorExit {
    /// Queue closed and drained, every slot Done.
    Completed,
    /// The run token fired first (stop request or fatal error).
    Cancelled,
}

pub(crate) struct MonitorParams {
    pub pool: Arc<WorkerPool>,
    pub queue: Arc<WorkQueue>,
    pub storage: JobStorage,
    pub telemetry: Arc<Telemetry>,
    pub progress: ProgressFeed,
    pub collector_state: watch::Receiver<CollectorState>,
    pub interval: Duration,
    pub stall_timeout: Duration,
    pub recovery_grace: Duration,
    pub shutdown: CancellationToken,
}

pub(crate) struct Monitor {
    pool: Arc<WorkerPool>,
    table: Arc<WorkerTable>,
    queue: Arc<WorkQueue>,
    storage: JobStorage,
    telemetry: Arc<Telemetry>,
    progress: ProgressFeed,
    collector_state: watch::Receiver<CollectorState>,
    interval: Duration,
    stall_timeout: Duration,
    recovery_grace: Duration,
    shutdown: CancellationToken,
}

impl Monitor {
    pub(crate) fn new(params: MonitorParams) -> Self {
        let table = params.pool.table().clone();
        Self {
            pool: params.pool,
            table,
            queue: params.queue,
            storage: params.storage,
            telemetry: params.telemetry,
            progress: params.progress,
            collector_state: params.collector_state,
            interval: params.interval,
            stall_timeout: params.stall_timeout,
            recovery_grace: params.recovery_grace,
            shutdown: params.shutdown,
        }
    }

    #[tracing::instrument(name = "monitor", skip_all)]
    pub(crate) async fn run(self) -> Result<MonitorExit> {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.publish_snapshot();
                    tracing::info!("run cancelled; heartbeat monitor exiting");
                    return Ok(MonitorExit::Cancelled);
                }
                _ = ticker.tick() => {
                    self.recover_stalls().await?;
                    self.publish_snapshot();
                }
                _ = self.table.changed() => {}
            }

            if self.is_complete() {
                self.publish_snapshot();
                tracing::info!("queue drained and every worker done");
                return Ok(MonitorExit::Completed);
            }
        }
    }

    fn is_complete(&self) -> bool {
        self.queue.is_drained() && self.table.all_done()
    }

    async fn recover_stalls(&self) -> Result<()> {
        for worker_id in 0..self.table.len() {
            if self.shutdown.is_cancelled() {
                break;
            }
            if let Some(stalled) = self.table.declare_stalled(worker_id, self.stall_timeout) {
                self.recover(stalled).await?;
            }
        }
        Ok(())
    }

    async fn recover(&self, stalled: StalledSlot) -> Result<()> {
        let worker_id = stalled.worker_id;
        tracing::warn!(
            worker = worker_id,
            heartbeat_age_ms = stalled.heartbeat_age.as_millis() as u64,
            item_id = stalled.current_item.as_ref().map(|item| item.id()),
            "worker stalled; cancelling its task"
        );

        self.pool.cancel_slot(worker_id, self.recovery_grace).await;

        let checkpoint = self
            .storage
            .checkpoints
            .load(worker_id)
            .await
            .with_context(|| format!("failed to read checkpoint of stalled worker {worker_id}"))?;
        let requeued = match checkpoint {
            Some(checkpoint) => Some(checkpoint.item),
            None => stalled.current_item,
        };
        if let Some(item) = &requeued {
            self.queue.requeue(item.clone());
        }
        self.storage
            .checkpoints
            .clear(worker_id)
            .await
            .with_context(|| format!("failed to clear checkpoint of stalled worker {worker_id}"))?;

        self.table.mark_restarting(worker_id);
        self.telemetry.record_stall_recovery();
        self.pool.spawn_slot(worker_id);

        tracing::info!(
            worker = worker_id,
            item_id = requeued.as_ref().map(|item| item.id()),
            sequence_index = requeued.as_ref().map(|item| item.sequence_index()),
            "stalled worker restarted; in-flight item requeued"
        );
        self.progress.publish(ProgressEvent::WorkerRestarted {
            worker_id,
            requeued_item: requeued,
        });
        Ok(())
    }

    fn publish_snapshot(&self) {
        self.progress
            .publish(ProgressEvent::Snapshot(self.snapshot()));
    }

    fn snapshot(&self) -> ProgressSnapshot {
        let telemetry = self.telemetry.snapshot();
        let workers = self
            .table
            .snapshot()
            .into_iter()
            .map(|state| WorkerProgress {
                worker_id: state.worker_id,
                status: state.status,
                items_processed: state.items_processed,
                items_failed: state.items_failed,
            })
            .collect();

        ProgressSnapshot {
            total_enqueued: telemetry.enqueued,
            total_collected: telemetry.collected,
            total_failed: telemetry.attempt_failures,
            total_failed_permanently: telemetry.permanent_failures,
            queue_depth: self.queue.len(),
            collector_state: *self.collector_state.borrow(),
            counts: self.table.counts(),
            workers,
        }
    }
}
