use super::item::WorkItem;
use anyhow::{bail, Result};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::Notify;

pub const DEFAULT_QUEUE_CAPACITY: usize = 1_000;

struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
    high_water: usize,
}

impl QueueState {
    fn new() -> Self {
        Self {
            items: VecDeque::new(),
            closed: false,
            high_water: 0,
        }
    }

    fn push_back(&mut self, item: WorkItem) {
        self.items.push_back(item);
        self.high_water = self.high_water.max(self.items.len());
    }
}

/// Bounded FIFO shared by the collector and the worker pool.
///
/// Items coming back from a failed attempt or a stall recovery use [`WorkQueue::requeue`], which
/// always appends at the back and never waits: a worker blocked on a full queue would stop
/// draining it. To keep the total within `capacity` anyway, [`WorkQueue::push`] only admits fresh
/// items while fewer than `capacity - headroom` are queued, reserving `headroom` places for
/// requeues. Every requeued item was handed to a worker first, and a worker holds one item at a
/// time, so a headroom equal to the number of worker slots bounds the queue at `capacity`.
/// Checkpoints requeued before collection starts count against the same bound.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
    admission_limit: usize,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_requeue_headroom(capacity, 0)
    }

    /// A queue that keeps `headroom` of its `capacity` free for [`WorkQueue::requeue`].
    /// At least one place is always left for fresh items.
    pub fn with_requeue_headroom(capacity: usize, headroom: usize) -> Self {
        assert!(capacity > 0, "capacity must be greater than zero");
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            capacity,
            admission_limit: capacity.saturating_sub(headroom).max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("work queue mutex poisoned")
    }

    /// Appends a freshly collected item, waiting while the queue holds its admission limit.
    pub async fn push(&self, item: WorkItem) -> Result<()> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if state.closed {
                    bail!(
                        "work queue is closed; refusing item {} (sequence {})",
                        item.id(),
                        item.sequence_index()
                    );
                }
                if state.items.len() < self.admission_limit {
                    state.push_back(item);
                    drop(state);
                    self.notify.notify_waiters();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Puts an already-admitted item back at the tail, into the reserved headroom.
    /// Accepted after `close` as well.
    pub fn requeue(&self, item: WorkItem) {
        let mut state = self.lock();
        state.push_back(item);
        drop(state);
        self.notify.notify_waiters();
    }

    /// Waits for the next item. Returns `None` once the queue is closed and empty.
    pub async fn pop(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.lock();
                if let Some(item) = state.items.pop_front() {
                    drop(state);
                    self.notify.notify_waiters();
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<WorkItem> {
        let item = self.lock().items.pop_front();
        if item.is_some() {
            self.notify.notify_waiters();
        }
        item
    }

    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// True once the producer is finished and every queued item has been handed out.
    pub fn is_drained(&self) -> bool {
        let state = self.lock();
        state.closed && state.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Queue length above which [`WorkQueue::push`] waits.
    pub fn admission_limit(&self) -> usize {
        self.admission_limit
    }

    /// Largest length the queue has reached so far, requeues included.
    pub fn high_water_mark(&self) -> usize {
        self.lock().high_water
    }
}

impl Default for WorkQueue {
    fn default() -> Self {
        Self::new()
    }
}
