use anyhow::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Captures the first job-level failure and tears the run down.
///
/// Item-level failures never reach this handler; only the collector giving up on the listing,
/// a storage failure, or a worker task panicking does.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    reason: Mutex<Option<String>>,
    notify: Notify,
}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                root_shutdown,
                run_shutdown,
                reason: Mutex::new(None),
                notify: Notify::new(),
            }),
        }
    }

    /// Records `error` as the reason the job aborted and cancels both the run and the root token.
    /// Only the first call wins; later errors are logged at debug level and dropped.
    pub fn trigger(&self, context: &str, error: Error) {
        {
            let mut reason = self.inner.reason.lock().expect("fatal reason mutex poisoned");
            if reason.is_some() {
                tracing::debug!(context, error = %error, "fatal error already captured; ignoring");
                return;
            }
            tracing::error!(context, error = %error, "fatal job error; initiating shutdown");
            *reason = Some(format!("{context}: {error:#}"));
            self.inner.triggered.store(true, Ordering::SeqCst);
        }

        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// `"<context>: <error chain>"` of the captured failure.
    pub fn reason(&self) -> Option<String> {
        self.inner
            .reason
            .lock()
            .expect("fatal reason mutex poisoned")
            .clone()
    }

    /// Resolves once a fatal error has been captured.
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}
