use crate::collect::item::{CollectedRecord, WorkItem};
use crate::collect::work_queue::WorkQueue;
use crate::runtime::telemetry::Telemetry;
use crate::source::{RequestScope, SourceClient, SourceError};
use crate::store::{Checkpoint, FailedItem, JobStorage};
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use super::shared::{WorkerShared, WorkerTable};
use super::types::ItemOutcome;

/// One task bound to a worker slot for a single epoch.
pub struct Worker {
    pub id: usize,
    pub(super) epoch: u64,
    pub(super) queue: Arc<WorkQueue>,
    pub(super) table: Arc<WorkerTable>,
    pub(super) client: SourceClient,
    pub(super) storage: JobStorage,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) retry_limit: u32,
    pub(super) max_child_pages: usize,
    pub(super) shutdown: CancellationToken,
}

impl Worker {
    pub fn new(id: usize, epoch: u64, shutdown: CancellationToken, shared: WorkerShared) -> Self {
        let WorkerShared {
            queue,
            table,
            client,
            storage,
            telemetry,
            retry_limit,
            max_child_pages,
        } = shared;

        Self {
            id,
            epoch,
            queue,
            table,
            client,
            storage,
            telemetry,
            retry_limit,
            max_child_pages,
            shutdown,
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub(super) fn pulse(&self) {
        self.table.heartbeat(self.id, self.epoch);
    }

    #[tracing::instrument(name = "worker", skip_all, fields(worker = self.id, epoch = self.epoch))]
    pub async fn run(self) -> Result<()> {
        tracing::info!(worker = self.id, "worker task started");

        if !self.table.set_idle(self.id, self.epoch) {
            tracing::info!(worker = self.id, "slot reassigned before start; exiting");
            return Ok(());
        }

        let checkpoint = self
            .storage
            .checkpoints
            .load(self.id)
            .await
            .with_context(|| format!("worker {} failed to read its checkpoint", self.id))?;

        if let Some(checkpoint) = checkpoint {
            tracing::info!(
                worker = self.id,
                item_id = checkpoint.item.id(),
                sequence_index = checkpoint.item.sequence_index(),
                "resuming checkpointed item before pulling new work"
            );
            let outcome = self.process_item(checkpoint.item).await?;
            if !outcome.keeps_running() {
                tracing::info!(worker = self.id, ?outcome, "worker task exited");
                return Ok(());
            }
        }

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    tracing::info!(worker = self.id, "shutdown requested; exiting worker loop");
                    break;
                }
                next = self.queue.pop() => next,
            };

            let Some(item) = next else {
                self.table.mark_done(self.id, self.epoch);
                tracing::info!(worker = self.id, "queue closed and drained; worker done");
                break;
            };

            let outcome = self.process_item(item).await?;
            if !outcome.keeps_running() {
                tracing::info!(worker = self.id, ?outcome, "leaving worker loop");
                break;
            }
        }

        tracing::info!(worker = self.id, "worker task exited");
        Ok(())
    }

    pub(super) async fn process_item(&self, item: WorkItem) -> Result<ItemOutcome> {
        let Some(processed) = self.table.items_processed(self.id, self.epoch) else {
            self.queue.requeue(item);
            return Ok(ItemOutcome::Stale);
        };

        // Checkpoint first: a Working slot always has one on record.
        let checkpoint = Checkpoint::new(self.id, item.clone(), processed);
        if let Err(err) = self.storage.checkpoints.save(checkpoint).await {
            self.queue.requeue(item);
            return Err(err.context(format!("worker {} failed to write checkpoint", self.id)));
        }

        if !self.table.begin_item(self.id, self.epoch, &item) {
            self.queue.requeue(item);
            return Ok(ItemOutcome::Stale);
        }

        let heartbeat = || self.pulse();
        let scope = RequestScope::new(&self.shutdown).with_heartbeat(&heartbeat);

        match self.fetch_record(&item, scope).await {
            Ok(record) => self.complete(item, record).await,
            Err(err) if self.is_cancellation(&err) => {
                tracing::debug!(
                    worker = self.id,
                    item_id = item.id(),
                    "cancelled mid-item; checkpoint retained"
                );
                Ok(ItemOutcome::Cancelled)
            }
            Err(err) => self.fail(item, err).await,
        }
    }

    async fn fetch_record(
        &self,
        item: &WorkItem,
        scope: RequestScope<'_>,
    ) -> Result<CollectedRecord> {
        let detail = self.client.fetch_item_detail(item, scope).await?;
        self.pulse();
        let children = self.flatten_children(item, detail.children, scope).await?;
        Ok(CollectedRecord::new(item, detail.fields, children))
    }

    async fn complete(&self, item: WorkItem, record: CollectedRecord) -> Result<ItemOutcome> {
        let children = record.children.len();
        self.storage
            .results
            .append(self.id, record)
            .await
            .with_context(|| {
                format!(
                    "worker {} failed to persist record for item {}",
                    self.id,
                    item.id()
                )
            })?;

        if !self.table.finish_success(self.id, self.epoch) {
            tracing::debug!(
                worker = self.id,
                item_id = item.id(),
                "detached before completion; checkpoint left to the monitor"
            );
            return Ok(ItemOutcome::Stale);
        }
        self.telemetry.record_collected();

        self.storage
            .checkpoints
            .clear(self.id)
            .await
            .with_context(|| format!("worker {} failed to clear its checkpoint", self.id))?;

        tracing::debug!(
            worker = self.id,
            item_id = item.id(),
            sequence_index = item.sequence_index(),
            children,
            "item collected"
        );
        Ok(ItemOutcome::Collected)
    }

    async fn fail(&self, item: WorkItem, err: anyhow::Error) -> Result<ItemOutcome> {
        self.telemetry.record_attempt_failure();

        if !self.table.finish_failure(self.id, self.epoch) {
            return Ok(ItemOutcome::Stale);
        }

        let attempts = item.retry_count().saturating_add(1);
        let outcome = if attempts >= self.retry_limit {
            tracing::warn!(
                worker = self.id,
                item_id = item.id(),
                sequence_index = item.sequence_index(),
                attempts,
                error = %err,
                "item exhausted retry limit; recording permanent failure"
            );
            self.storage
                .failures
                .append(FailedItem::new(item, self.id, &err))
                .await
                .with_context(|| format!("worker {} failed to append to failure log", self.id))?;
            self.telemetry.record_permanent_failure();
            ItemOutcome::FailedPermanently
        } else {
            tracing::warn!(
                worker = self.id,
                item_id = item.id(),
                sequence_index = item.sequence_index(),
                attempts,
                error = %err,
                "item failed; requeueing at the back of the queue"
            );
            self.queue.requeue(item.retried());
            self.telemetry.record_requeue();
            ItemOutcome::Requeued
        };

        self.storage
            .checkpoints
            .clear(self.id)
            .await
            .with_context(|| format!("worker {} failed to clear its checkpoint", self.id))?;

        Ok(outcome)
    }

    fn is_cancellation(&self, err: &anyhow::Error) -> bool {
        self.shutdown.is_cancelled()
            || matches!(SourceError::find(err), Some(SourceError::Cancelled))
    }
}
