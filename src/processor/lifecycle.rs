//! Run-scoped lifecycle for a job: the run cancellation token, the fatal error handler and the
//! metrics reporter.

use crate::collect::work_queue::WorkQueue;
use crate::runtime::fatal::FatalErrorHandler;
use crate::runtime::telemetry::{self, Telemetry};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Everything scoped to one job run. The run token is a child of the coordinator's root, so a
/// root cancellation reaches every task while a stop request leaves the root usable.
pub(crate) struct RunLifecycle {
    pub run_token: CancellationToken,
    fatal_handler: FatalErrorHandler,
    reporter: Option<JoinHandle<()>>,
}

pub(crate) struct RunLifecycleParams<'a> {
    pub shutdown_root: &'a CancellationToken,
    pub telemetry: Arc<Telemetry>,
    pub queue: Arc<WorkQueue>,
    pub metrics_interval: Duration,
}

impl RunLifecycle {
    pub(crate) fn spawn(params: RunLifecycleParams<'_>) -> Self {
        let RunLifecycleParams {
            shutdown_root,
            telemetry,
            queue,
            metrics_interval,
        } = params;

        let run_token = shutdown_root.child_token();
        let fatal_handler = FatalErrorHandler::new(shutdown_root.clone(), run_token.clone());
        let reporter = telemetry::spawn_metrics_reporter(
            telemetry,
            queue,
            run_token.clone(),
            metrics_interval,
        );

        Self {
            run_token,
            fatal_handler,
            reporter: Some(reporter),
        }
    }

    pub(crate) fn fatal_handler(&self) -> FatalErrorHandler {
        self.fatal_handler.clone()
    }

    /// Why the run was aborted, if a fatal error was captured.
    pub(crate) fn abort_reason(&self) -> Option<String> {
        self.fatal_handler.reason()
    }

    /// Cancels the run token and joins the reporter.
    pub(crate) async fn shutdown(mut self) {
        self.run_token.cancel();
        if let Some(handle) = self.reporter.take() {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "metrics reporter task panicked");
            }
        }
    }
}
