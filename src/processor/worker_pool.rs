//! Worker slot arena.
//!
//! The pool owns one task handle and one cancellation token per `worker_id`. A restart swaps the
//! task bound to a slot; the slot's state record in the [`WorkerTable`] survives it.

use crate::collect::worker::{Worker, WorkerShared, WorkerTable};
use crate::runtime::fatal::FatalErrorHandler;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

struct SlotTask {
    token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

pub(crate) struct WorkerPool {
    shared: WorkerShared,
    run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    tasks: Mutex<Vec<SlotTask>>,
}

impl WorkerPool {
    pub(crate) fn new(
        shared: WorkerShared,
        run_token: CancellationToken,
        fatal_handler: FatalErrorHandler,
    ) -> Self {
        let tasks = (0..shared.table().len())
            .map(|_| SlotTask {
                token: run_token.child_token(),
                handle: None,
            })
            .collect();
        Self {
            shared,
            run_token,
            fatal_handler,
            tasks: Mutex::new(tasks),
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Vec<SlotTask>> {
        self.tasks.lock().expect("worker pool mutex poisoned")
    }

    pub(crate) fn table(&self) -> &Arc<WorkerTable> {
        self.shared.table()
    }

    pub(crate) fn len(&self) -> usize {
        self.tasks().len()
    }

    pub(crate) fn spawn_all(&self) {
        for worker_id in 0..self.len() {
            self.spawn_slot(worker_id);
        }
    }

    /// Binds a fresh task to `worker_id`. The task resumes the slot's checkpoint, if any, before
    /// pulling from the queue.
    pub(crate) fn spawn_slot(&self, worker_id: usize) {
        let epoch = self.table().attach(worker_id);
        let token = self.run_token.child_token();
        let worker = Worker::new(worker_id, epoch, token.clone(), self.shared.clone());
        let table = self.table().clone();
        let fatal_handler = self.fatal_handler.clone();

        let handle = tokio::spawn(async move {
            let result = AssertUnwindSafe(worker.run()).catch_unwind().await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::error!(
                        worker = worker_id,
                        epoch,
                        error = %err,
                        "worker task exited with error"
                    );
                    table.mark_failed(worker_id, epoch);
                    let context = format!("worker {worker_id} exited with error");
                    fatal_handler.trigger(context.as_str(), err);
                }
                Err(panic_payload) => {
                    let panic_msg = panic_message(panic_payload.as_ref());
                    tracing::error!(
                        worker = worker_id,
                        epoch,
                        panic = %panic_msg,
                        "worker task panicked"
                    );
                    table.mark_failed(worker_id, epoch);
                    let context = format!("worker {worker_id} panicked");
                    let panic_error = anyhow::anyhow!("worker {worker_id} panicked: {panic_msg}");
                    fatal_handler.trigger(context.as_str(), panic_error);
                }
            }
        });

        let mut tasks = self.tasks();
        tasks[worker_id] = SlotTask {
            token,
            handle: Some(handle),
        };
    }

    /// Cancels the task bound to `worker_id` and waits up to `grace` for it to unwind.
    pub(crate) async fn cancel_slot(&self, worker_id: usize, grace: Duration) {
        let (token, handle) = {
            let mut tasks = self.tasks();
            let task = &mut tasks[worker_id];
            (task.token.clone(), task.handle.take())
        };
        token.cancel();

        let Some(handle) = handle else {
            return;
        };
        handle.abort();
        match timeout(grace, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) if err.is_cancelled() => {}
            Ok(Err(err)) => {
                tracing::warn!(worker = worker_id, error = %err, "cancelled worker task panicked");
            }
            Err(_) => {
                tracing::warn!(
                    worker = worker_id,
                    grace_ms = grace.as_millis() as u64,
                    "cancelled worker task did not unwind within the grace period"
                );
            }
        }
    }

    /// Waits for every slot task to finish. Callers cancel the run token first.
    pub(crate) async fn join(&self) {
        let handles: Vec<(usize, JoinHandle<()>)> = self
            .tasks()
            .iter_mut()
            .enumerate()
            .filter_map(|(worker_id, task)| task.handle.take().map(|handle| (worker_id, handle)))
            .collect();

        let (ids, handles): (Vec<usize>, Vec<JoinHandle<()>>) = handles.into_iter().unzip();
        for (worker_id, result) in ids.into_iter().zip(join_all(handles).await) {
            if let Err(err) = result {
                tracing::warn!(worker = worker_id, error = %err, "worker task terminated unexpectedly");
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
