use crate::collect::collector::Boundary;
use crate::processor::coordinator::{Coordinator, JobReport};
use crate::runtime::config::JobConfig;
use crate::source::RemoteSource;
use crate::store::JobStorage;
use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Runs backfill jobs and turns OS signals into cooperative stop requests.
pub struct Runner {
    coordinator: Coordinator,
    shutdown: CancellationToken,
}

impl Runner {
    /// Creates a runner and wires a root [`CancellationToken`] that propagates through the whole
    /// job (collector, workers, monitor, metrics reporter).
    pub fn new(config: JobConfig, source: Arc<dyn RemoteSource>, storage: JobStorage) -> Self {
        let shutdown = CancellationToken::new();
        let coordinator =
            Coordinator::with_cancellation_token(config, source, storage, shutdown.clone());
        Self {
            coordinator,
            shutdown,
        }
    }

    /// Returns a clone of the root shutdown token so external callers can integrate with their
    /// own signal handlers or cancellation strategies.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Runs one job until it finishes or a Ctrl-C (SIGINT) is received.
    pub async fn run_until_ctrl_c(&mut self, boundary: Boundary) -> Result<JobReport> {
        self.run_until(boundary, async {
            match signal::ctrl_c().await {
                Ok(()) => tracing::info!("Ctrl-C received; stopping the job"),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to listen for Ctrl-C; running to completion");
                    std::future::pending::<()>().await;
                }
            }
        })
        .await
    }

    /// Runs one job until it finishes or `stop` resolves. A resolved `stop`, like a cancelled root
    /// token, becomes a cooperative stop; the job still tears down and aggregates what it
    /// persisted.
    pub async fn run_until<F>(&mut self, boundary: Boundary, stop: F) -> Result<JobReport>
    where
        F: Future<Output = ()>,
    {
        let worker_count = self.coordinator.config().worker_count();
        self.coordinator.begin(boundary, worker_count).await?;
        let stop_handle = self
            .coordinator
            .stop_handle()
            .context("job vanished right after starting")?;
        tracing::info!(worker_count, "runner started; waiting for the job to finish");

        let report = {
            let wait = self.coordinator.wait();
            tokio::pin!(wait);
            tokio::pin!(stop);

            tokio::select! {
                report = &mut wait => report,
                _ = &mut stop => {
                    stop_handle.request_stop();
                    wait.await
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("runner shutdown token cancelled");
                    wait.await
                }
            }
        };

        if self.shutdown.is_cancelled() {
            self.reinitialize_shutdown_token();
        }
        report
    }

    fn reinitialize_shutdown_token(&mut self) {
        self.shutdown = CancellationToken::new();
        self.coordinator.replace_shutdown_root(self.shutdown.clone());
    }
}
