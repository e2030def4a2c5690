use crate::collect::item::WorkItem;
use crate::collect::work_queue::WorkQueue;
use crate::runtime::telemetry::Telemetry;
use crate::source::SourceClient;
use crate::store::JobStorage;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Idle,
    Working,
    Stalled,
    Restarting,
    Done,
    Failed,
}

impl WorkerStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkerStatus::Done | WorkerStatus::Failed)
    }
}

/// Liveness and counters of one worker slot. The slot outlives the tasks bound to it.
#[derive(Debug, Clone)]
pub struct WorkerState {
    pub worker_id: usize,
    pub status: WorkerStatus,
    pub current_item: Option<WorkItem>,
    pub items_processed: u64,
    pub items_failed: u64,
    pub last_heartbeat: Instant,
    pub restarts: u32,
}

impl WorkerState {
    fn new(worker_id: usize) -> Self {
        Self {
            worker_id,
            status: WorkerStatus::Idle,
            current_item: None,
            items_processed: 0,
            items_failed: 0,
            last_heartbeat: Instant::now(),
            restarts: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolCounts {
    pub idle: usize,
    pub working: usize,
    pub stalled: usize,
    pub restarting: usize,
    pub done: usize,
    pub failed: usize,
}

impl PoolCounts {
    fn record(&mut self, status: WorkerStatus) {
        match status {
            WorkerStatus::Idle => self.idle += 1,
            WorkerStatus::Working => self.working += 1,
            WorkerStatus::Stalled => self.stalled += 1,
            WorkerStatus::Restarting => self.restarting += 1,
            WorkerStatus::Done => self.done += 1,
            WorkerStatus::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.idle + self.working + self.stalled + self.restarting + self.done + self.failed
    }
}

/// What the monitor takes over from a slot it declared stalled.
#[derive(Debug, Clone)]
pub struct StalledSlot {
    pub worker_id: usize,
    pub current_item: Option<WorkItem>,
    pub heartbeat_age: Duration,
}

struct Slot {
    state: WorkerState,
    epoch: u64,
}

/// Fixed arena of worker slots indexed by `worker_id`.
///
/// Every write made by a worker task carries the epoch it was attached with. The monitor bumps
/// the epoch when it detaches a stalled task, so late writes from that task are dropped instead
/// of clobbering the slot's next occupant.
pub struct WorkerTable {
    slots: Mutex<Vec<Slot>>,
    changed: Notify,
}

impl WorkerTable {
    pub fn new(worker_count: usize) -> Self {
        let slots = (0..worker_count)
            .map(|worker_id| Slot {
                state: WorkerState::new(worker_id),
                epoch: 0,
            })
            .collect();
        Self {
            slots: Mutex::new(slots),
            changed: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().expect("worker table mutex poisoned")
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Applies `update` if `epoch` is still current for the slot.
    fn fenced<F>(&self, worker_id: usize, epoch: u64, update: F) -> bool
    where
        F: FnOnce(&mut WorkerState),
    {
        let applied = {
            let mut slots = self.lock();
            match slots.get_mut(worker_id) {
                Some(slot) if slot.epoch == epoch => {
                    update(&mut slot.state);
                    true
                }
                _ => false,
            }
        };
        if applied {
            self.changed.notify_waiters();
        }
        applied
    }

    /// Binds a new task to the slot and returns the epoch its writes must carry.
    pub fn attach(&self, worker_id: usize) -> u64 {
        let epoch = {
            let mut slots = self.lock();
            let slot = &mut slots[worker_id];
            slot.epoch += 1;
            slot.state.last_heartbeat = Instant::now();
            slot.epoch
        };
        self.changed.notify_waiters();
        epoch
    }

    pub fn current_epoch(&self, worker_id: usize) -> Option<u64> {
        self.lock().get(worker_id).map(|slot| slot.epoch)
    }

    pub fn set_idle(&self, worker_id: usize, epoch: u64) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.status = WorkerStatus::Idle;
            state.current_item = None;
            state.last_heartbeat = Instant::now();
        })
    }

    /// Items the slot has finished, or `None` once `epoch` is no longer current.
    pub fn items_processed(&self, worker_id: usize, epoch: u64) -> Option<u64> {
        self.lock()
            .get(worker_id)
            .filter(|slot| slot.epoch == epoch)
            .map(|slot| slot.state.items_processed)
    }

    /// Marks the slot Working on `item`. The caller must already hold its checkpoint.
    pub fn begin_item(&self, worker_id: usize, epoch: u64, item: &WorkItem) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.status = WorkerStatus::Working;
            state.current_item = Some(item.clone());
            state.last_heartbeat = Instant::now();
        })
    }

    pub fn heartbeat(&self, worker_id: usize, epoch: u64) -> bool {
        let mut slots = self.lock();
        match slots.get_mut(worker_id) {
            Some(slot) if slot.epoch == epoch => {
                slot.state.last_heartbeat = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn finish_success(&self, worker_id: usize, epoch: u64) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.items_processed += 1;
            state.current_item = None;
            state.status = WorkerStatus::Idle;
            state.last_heartbeat = Instant::now();
        })
    }

    pub fn finish_failure(&self, worker_id: usize, epoch: u64) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.items_failed += 1;
            state.current_item = None;
            state.status = WorkerStatus::Idle;
            state.last_heartbeat = Instant::now();
        })
    }

    pub fn mark_done(&self, worker_id: usize, epoch: u64) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.status = WorkerStatus::Done;
            state.current_item = None;
        })
    }

    pub fn mark_failed(&self, worker_id: usize, epoch: u64) -> bool {
        self.fenced(worker_id, epoch, |state| {
            state.status = WorkerStatus::Failed;
        })
    }

    /// Detaches the slot's task if it is Working with a heartbeat older than `stall_timeout`.
    ///
    /// The check and the transition to Stalled happen under one lock, so a worker that finishes
    /// its item concurrently is never declared stalled.
    pub fn declare_stalled(&self, worker_id: usize, stall_timeout: Duration) -> Option<StalledSlot> {
        let stalled = {
            let mut slots = self.lock();
            let slot = slots.get_mut(worker_id)?;
            if slot.state.status != WorkerStatus::Working {
                return None;
            }
            let heartbeat_age = slot.state.last_heartbeat.elapsed();
            if heartbeat_age <= stall_timeout {
                return None;
            }
            slot.epoch += 1;
            slot.state.status = WorkerStatus::Stalled;
            StalledSlot {
                worker_id,
                current_item: slot.state.current_item.clone(),
                heartbeat_age,
            }
        };
        self.changed.notify_waiters();
        Some(stalled)
    }

    /// Monitor-side transition after the stalled item has been handed back to the queue.
    pub fn mark_restarting(&self, worker_id: usize) {
        {
            let mut slots = self.lock();
            if let Some(slot) = slots.get_mut(worker_id) {
                slot.state.status = WorkerStatus::Restarting;
                slot.state.current_item = None;
                slot.state.restarts += 1;
            }
        }
        self.changed.notify_waiters();
    }

    pub fn state(&self, worker_id: usize) -> Option<WorkerState> {
        self.lock().get(worker_id).map(|slot| slot.state.clone())
    }

    pub fn snapshot(&self) -> Vec<WorkerState> {
        self.lock().iter().map(|slot| slot.state.clone()).collect()
    }

    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts::default();
        for slot in self.lock().iter() {
            counts.record(slot.state.status);
        }
        counts
    }

    pub fn all_done(&self) -> bool {
        self.lock()
            .iter()
            .all(|slot| slot.state.status == WorkerStatus::Done)
    }

    pub fn all_terminal(&self) -> bool {
        self.lock().iter().all(|slot| slot.state.status.is_terminal())
    }

    /// Resolves after the next fenced or monitor-side state change.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }
}

/// Collaborators handed to every worker task.
#[derive(Clone)]
pub struct WorkerShared {
    pub(super) queue: Arc<WorkQueue>,
    pub(super) table: Arc<WorkerTable>,
    pub(super) client: SourceClient,
    pub(super) storage: JobStorage,
    pub(super) telemetry: Arc<Telemetry>,
    pub(super) retry_limit: u32,
    pub(super) max_child_pages: usize,
}

pub struct WorkerSharedParams {
    pub queue: Arc<WorkQueue>,
    pub table: Arc<WorkerTable>,
    pub client: SourceClient,
    pub storage: JobStorage,
    pub telemetry: Arc<Telemetry>,
    pub retry_limit: u32,
    pub max_child_pages: usize,
}

impl WorkerShared {
    pub fn new(params: WorkerSharedParams) -> Self {
        Self {
            queue: params.queue,
            table: params.table,
            client: params.client,
            storage: params.storage,
            telemetry: params.telemetry,
            retry_limit: params.retry_limit.max(1),
            max_child_pages: params.max_child_pages,
        }
    }

    pub fn table(&self) -> &Arc<WorkerTable> {
        &self.table
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn storage(&self) -> &JobStorage {
        &self.storage
    }
}
