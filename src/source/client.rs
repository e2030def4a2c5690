//! The remote-source seam: the [`RemoteSource`] trait implemented by concrete listing backends,
//! the [`SourceError`] taxonomy they signal failures with, and the [`SourceClient`] wrapper that
//! adds pacing, timeouts, retries and metrics around every call.

use crate::collect::item::{ChildNode, ItemDetail, ListingPage, WorkItem};
use crate::processor::backoff::{
    keep_alive, retry_with_backoff, Heartbeat, RetryBackoff, RetryDisposition,
};
use crate::runtime::config::JobConfig;
use crate::runtime::telemetry::Telemetry;
use crate::source::metrics::{SourceMetrics, SourceMetricsSnapshot};
use crate::source::rate_limit::RateLimiter;
use crate::source::retry::{
    RetryContext, CHILD_PAGE_RETRY, ITEM_DETAIL_RETRY, LISTING_PAGE_RETRY,
};
use anyhow::Result;
use futures::future::{self, BoxFuture};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
    /// The source asked us to slow down, optionally saying for how long.
    RateLimited { retry_after: Option<Duration> },
    Timeout { operation: &'static str },
    Unavailable { reason: String },
    /// Hard failure for this request; retrying will not help.
    Rejected { reason: String },
    /// The caller's cancellation token fired while the request was pending.
    Cancelled,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SourceError::RateLimited { .. }
                | SourceError::Timeout { .. }
                | SourceError::Unavailable { .. }
        )
    }

    /// Returns the [`SourceError`] carried by `err`, if any.
    pub fn find(err: &anyhow::Error) -> Option<&SourceError> {
        err.downcast_ref::<SourceError>()
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceError::RateLimited {
                retry_after: Some(delay),
            } => write!(f, "source rate limited; retry after {}ms", delay.as_millis()),
            SourceError::RateLimited { retry_after: None } => write!(f, "source rate limited"),
            SourceError::Timeout { operation } => write!(f, "source call {operation} timed out"),
            SourceError::Unavailable { reason } => write!(f, "source unavailable: {reason}"),
            SourceError::Rejected { reason } => write!(f, "source rejected request: {reason}"),
            SourceError::Cancelled => write!(f, "source request cancelled"),
        }
    }
}

impl std::error::Error for SourceError {}

/// A paginated, newest-first listing with per-item detail.
///
/// Implementations signal failure classes by returning a [`SourceError`] inside the
/// `anyhow::Error`. Any other error is treated as transient.
pub trait RemoteSource: Send + Sync + 'static {
    /// Fetches the listing page after `cursor` (`None` for the newest page).
    fn fetch_listing_page<'a>(&'a self, cursor: Option<&'a str>)
        -> BoxFuture<'a, Result<ListingPage>>;

    fn fetch_item_detail<'a>(&'a self, item: &'a WorkItem) -> BoxFuture<'a, Result<ItemDetail>>;

    /// Expands a [`ChildNode::Deferred`] placeholder. Sources that always inline the whole
    /// reply tree can keep the default.
    fn fetch_child_page<'a>(
        &'a self,
        item: &'a WorkItem,
        cursor: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChildNode>>> {
        let _ = (item, cursor);
        Box::pin(future::ready(Ok(Vec::new())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceClientOptions {
    pub request_timeout: Duration,
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Cadence of [`RequestScope`] heartbeats while a call waits on pacing or backoff.
    pub heartbeat_interval: Duration,
}

impl SourceClientOptions {
    pub fn for_collector(config: &JobConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_attempts: config.page_max_attempts(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            heartbeat_interval: config.stall_timeout() / 3,
        }
    }

    pub fn for_workers(config: &JobConfig) -> Self {
        Self {
            request_timeout: config.request_timeout(),
            max_attempts: config.item_max_attempts(),
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            heartbeat_interval: config.stall_timeout() / 3,
        }
    }
}

/// Per-call context: the caller's cancellation token and an optional liveness callback.
///
/// The callback fires before every request, when a retry is scheduled, and every
/// [`SourceClientOptions::heartbeat_interval`] while the call waits on the rate limiter or a
/// backoff. It does not fire while a request is in flight; `request_timeout` bounds that wait.
#[derive(Clone, Copy)]
pub struct RequestScope<'a> {
    cancel: &'a CancellationToken,
    heartbeat: Option<&'a (dyn Fn() + Send + Sync)>,
}

impl<'a> RequestScope<'a> {
    pub fn new(cancel: &'a CancellationToken) -> Self {
        Self {
            cancel,
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: &'a (dyn Fn() + Send + Sync)) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    fn pulse(&self) {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat();
        }
    }

    fn keep_alive_every(&self, every: Duration) -> Option<Heartbeat<'a>> {
        self.heartbeat.map(|pulse| Heartbeat::new(pulse, every))
    }
}

#[derive(Clone)]
pub struct SourceClient {
    source: Arc<dyn RemoteSource>,
    limiter: Arc<RateLimiter>,
    options: SourceClientOptions,
    metrics: Arc<SourceMetrics>,
    telemetry: Arc<Telemetry>,
}

impl SourceClient {
    pub fn new(
        source: Arc<dyn RemoteSource>,
        limiter: Arc<RateLimiter>,
        options: SourceClientOptions,
        telemetry: Arc<Telemetry>,
    ) -> Self {
        Self {
            source,
            limiter,
            options,
            metrics: Arc::new(SourceMetrics::default()),
            telemetry,
        }
    }

    pub fn metrics(&self) -> SourceMetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn options(&self) -> SourceClientOptions {
        self.options
    }

    pub async fn fetch_listing_page(
        &self,
        cursor: Option<&str>,
        scope: RequestScope<'_>,
    ) -> Result<ListingPage> {
        let context = RetryContext::for_page(&LISTING_PAGE_RETRY, cursor);
        let page = self
            .with_retry(context, scope, || self.source.fetch_listing_page(cursor))
            .await?;
        tracing::debug!(
            cursor = cursor.unwrap_or("<first>"),
            entries = page.entries.len(),
            has_next = page.next_cursor.is_some(),
            "listing page fetched"
        );
        Ok(page)
    }

    pub async fn fetch_item_detail(
        &self,
        item: &WorkItem,
        scope: RequestScope<'_>,
    ) -> Result<ItemDetail> {
        let context =
            RetryContext::for_item(&ITEM_DETAIL_RETRY, item.id(), item.sequence_index());
        self.with_retry(context, scope, || self.source.fetch_item_detail(item))
            .await
    }

    pub async fn fetch_child_page(
        &self,
        item: &WorkItem,
        cursor: &str,
        scope: RequestScope<'_>,
    ) -> Result<Vec<ChildNode>> {
        let context = RetryContext::for_item(&CHILD_PAGE_RETRY, item.id(), item.sequence_index());
        self.with_retry(context, scope, || self.source.fetch_child_page(item, cursor))
            .await
    }

    /// Shared retry loop: pacing, timeout, metrics and failure classification for one operation.
    async fn with_retry<'b, T, F>(
        &self,
        context: RetryContext<'_>,
        scope: RequestScope<'_>,
        mut call: F,
    ) -> Result<T>
    where
        F: FnMut() -> BoxFuture<'b, Result<T>>,
    {
        let backoff = RetryBackoff::new(
            self.options.initial_backoff,
            self.options.max_backoff,
            self.options.max_attempts,
            scope.cancel,
        )
        .with_heartbeat(scope.keep_alive_every(self.options.heartbeat_interval));

        retry_with_backoff(
            backoff,
            |_| self.attempt(context.operation(), call(), scope),
            |attempt, delay, err, will_retry| {
                if !will_retry {
                    context.log_exhausted(attempt, err);
                    return;
                }
                if matches!(SourceError::find(err), Some(SourceError::RateLimited { .. })) {
                    context.log_rate_limited(attempt, delay);
                } else {
                    context.log_retry(attempt, delay, err);
                }
                scope.pulse();
            },
            |attempt, err| match SourceError::find(err) {
                Some(SourceError::Cancelled) => RetryDisposition::Abort,
                Some(SourceError::Rejected { .. }) => {
                    context.log_rejected(attempt, err);
                    RetryDisposition::Abort
                }
                Some(SourceError::RateLimited { retry_after }) => {
                    let penalty = retry_after.unwrap_or(self.options.initial_backoff);
                    self.limiter.penalize(penalty);
                    RetryDisposition::RetryAfter(retry_after.unwrap_or_default())
                }
                _ => RetryDisposition::Retry,
            },
        )
        .await
    }

    /// One paced, time-bounded call.
    async fn attempt<T>(
        &self,
        operation: &'static str,
        request: BoxFuture<'_, Result<T>>,
        scope: RequestScope<'_>,
    ) -> Result<T> {
        let cancel = scope.cancel;
        let heartbeat = scope.keep_alive_every(self.options.heartbeat_interval);
        keep_alive(heartbeat, self.limiter.acquire(cancel)).await?;
        scope.pulse();

        let start = Instant::now();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(SourceError::Cancelled.into()),
            outcome = timeout(self.options.request_timeout, request) => outcome,
        };
        let elapsed = start.elapsed();

        match outcome {
            Err(_) => {
                self.metrics.record_timeout(elapsed);
                self.telemetry.record_request_timeout();
                Err(SourceError::Timeout { operation }.into())
            }
            Ok(Ok(value)) => {
                self.metrics.record_success(elapsed);
                Ok(value)
            }
            Ok(Err(err)) => {
                if matches!(SourceError::find(&err), Some(SourceError::RateLimited { .. })) {
                    self.metrics.record_rate_limited(elapsed);
                    self.telemetry.record_rate_limited();
                } else {
                    self.metrics.record_failure(elapsed);
                    self.telemetry.record_request_error();
                }
                Err(err)
            }
        }
    }
}
