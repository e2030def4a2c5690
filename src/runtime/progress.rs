//! Non-blocking progress feed for external observers.
//!
//! Publishers never wait on subscribers: the feed is a bounded broadcast ring, so a subscriber
//! that falls behind loses the oldest events and observes a lag count instead.

use crate::collect::collector::CollectorState;
use crate::collect::item::WorkItem;
use crate::collect::worker::{PoolCounts, WorkerStatus};
use crate::processor::coordinator::JobStatus;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

pub const DEFAULT_PROGRESS_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerProgress {
    pub worker_id: usize,
    pub status: WorkerStatus,
    pub items_processed: u64,
    pub items_failed: u64,
}

/// Pool-wide view published on every monitor tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub total_enqueued: u64,
    pub total_collected: u64,
    /// Failed processing attempts across all workers.
    pub total_failed: u64,
    pub total_failed_permanently: u64,
    pub queue_depth: usize,
    pub collector_state: CollectorState,
    pub counts: PoolCounts,
    pub workers: Vec<WorkerProgress>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    Snapshot(ProgressSnapshot),
    WorkerRestarted {
        worker_id: usize,
        requeued_item: Option<WorkItem>,
    },
    CollectionFinished {
        enqueued: u64,
    },
    Finished {
        status: JobStatus,
    },
}

#[derive(Clone)]
pub struct ProgressFeed {
    events: broadcast::Sender<ProgressEvent>,
    latest: Arc<watch::Sender<Option<ProgressSnapshot>>>,
}

impl ProgressFeed {
    pub fn new(buffer: usize) -> Self {
        let (events, _) = broadcast::channel(buffer.max(1));
        let (latest, _) = watch::channel(None);
        Self {
            events,
            latest: Arc::new(latest),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    /// Publishes `event` to current subscribers. Having no subscribers is not an error.
    pub fn publish(&self, event: ProgressEvent) {
        if let ProgressEvent::Snapshot(snapshot) = &event {
            self.latest.send_replace(Some(snapshot.clone()));
        }
        let _ = self.events.send(event);
    }

    /// Most recent snapshot, for observers that attach mid-job.
    pub fn latest(&self) -> Option<ProgressSnapshot> {
        self.latest.borrow().clone()
    }
}

impl Default for ProgressFeed {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRESS_BUFFER)
    }
}
