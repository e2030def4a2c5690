use crate::collect::work_queue::DEFAULT_QUEUE_CAPACITY;
use crate::runtime::progress::DEFAULT_PROGRESS_BUFFER;
use crate::runtime::telemetry;
use anyhow::{bail, Result};
use std::time::Duration;

const DEFAULT_WORKER_COUNT: usize = 25;
const DEFAULT_STALL_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 2;
const DEFAULT_RECOVERY_GRACE_SECS: u64 = 1;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;
const DEFAULT_COLLECTOR_REQUEST_INTERVAL_MS: u64 = 500;
const DEFAULT_WORKER_REQUEST_INTERVAL_MS: u64 = 40;
const DEFAULT_PAGE_MAX_ATTEMPTS: usize = 4;
const DEFAULT_ITEM_MAX_ATTEMPTS: usize = 4;
const DEFAULT_RETRY_LIMIT: u32 = 3;
const DEFAULT_INITIAL_BACKOFF_SECS: u64 = 2;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 30;
const DEFAULT_MAX_CHILD_PAGES: usize = 32;

/// Runtime configuration for a backfill job.
///
/// All instances must be constructed via [`JobConfig::builder`] or [`JobConfig::new`]
/// so invariants are validated before any consumer observes the values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobConfig {
    worker_count: usize,
    queue_capacity: usize,
    stall_timeout: Duration,
    monitor_interval: Duration,
    recovery_grace: Duration,
    request_timeout: Duration,
    collector_request_interval: Duration,
    worker_request_interval: Duration,
    page_max_attempts: usize,
    item_max_attempts: usize,
    retry_limit: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    max_child_pages: usize,
    metrics_interval: Duration,
    progress_buffer: usize,
}

pub struct JobConfigParams {
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub stall_timeout: Duration,
    pub monitor_interval: Duration,
    pub recovery_grace: Duration,
    pub request_timeout: Duration,
    pub collector_request_interval: Duration,
    pub worker_request_interval: Duration,
    pub page_max_attempts: usize,
    pub item_max_attempts: usize,
    pub retry_limit: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_child_pages: usize,
    pub metrics_interval: Duration,
    pub progress_buffer: usize,
}

impl JobConfig {
    /// Returns a builder to incrementally construct and validate a configuration.
    pub fn builder() -> JobConfigBuilder {
        JobConfigBuilder::default()
    }

    /// Constructs a configuration directly from the provided values.
    ///
    /// Prefer [`JobConfig::builder`] when most values use defaults.
    pub fn new(params: JobConfigParams) -> Result<Self> {
        let JobConfigParams {
            worker_count,
            queue_capacity,
            stall_timeout,
            monitor_interval,
            recovery_grace,
            request_timeout,
            collector_request_interval,
            worker_request_interval,
            page_max_attempts,
            item_max_attempts,
            retry_limit,
            initial_backoff,
            max_backoff,
            max_child_pages,
            metrics_interval,
            progress_buffer,
        } = params;

        let config = Self {
            worker_count,
            queue_capacity,
            stall_timeout,
            monitor_interval,
            recovery_grace,
            request_timeout,
            collector_request_interval,
            worker_request_interval,
            page_max_attempts,
            item_max_attempts,
            retry_limit,
            initial_backoff,
            max_backoff,
            max_child_pages,
            metrics_interval,
            progress_buffer,
        };

        config.validate()?;
        Ok(config)
    }

    /// Number of logical workers started by [`crate::Coordinator::run`].
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Maximum number of collected items waiting for a worker.
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Heartbeat age past which a working slot is declared stalled.
    pub fn stall_timeout(&self) -> Duration {
        self.stall_timeout
    }

    /// Interval between heartbeat monitor ticks.
    pub fn monitor_interval(&self) -> Duration {
        self.monitor_interval
    }

    /// Upper bound on waiting for a cancelled slot task to unwind during recovery.
    pub fn recovery_grace(&self) -> Duration {
        self.recovery_grace
    }

    /// Timeout applied to every remote call.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Minimum spacing between listing page requests.
    pub fn collector_request_interval(&self) -> Duration {
        self.collector_request_interval
    }

    /// Minimum spacing between detail requests, shared by every worker.
    pub fn worker_request_interval(&self) -> Duration {
        self.worker_request_interval
    }

    /// Attempts per listing page before the job is aborted.
    pub fn page_max_attempts(&self) -> usize {
        self.page_max_attempts
    }

    /// Transient-fetch attempts within one processing attempt of an item.
    pub fn item_max_attempts(&self) -> usize {
        self.item_max_attempts
    }

    /// Processing attempts an item gets before it lands in the permanent-failure log.
    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn initial_backoff(&self) -> Duration {
        self.initial_backoff
    }

    pub fn max_backoff(&self) -> Duration {
        self.max_backoff
    }

    /// Deferred child pages a worker expands for a single item.
    pub fn max_child_pages(&self) -> usize {
        self.max_child_pages
    }

    /// Interval used by the telemetry reporter.
    pub fn metrics_interval(&self) -> Duration {
        self.metrics_interval
    }

    /// Events retained for a lagging progress subscriber.
    pub fn progress_buffer(&self) -> usize {
        self.progress_buffer
    }

    /// Performs validation on an existing configuration instance.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            bail!("worker_count must be greater than 0");
        }

        if self.queue_capacity == 0 {
            bail!("queue_capacity must be greater than 0");
        }

        if self.stall_timeout.is_zero() {
            bail!("stall_timeout must be greater than 0");
        }

        if self.monitor_interval.is_zero() {
            bail!("monitor_interval must be greater than 0");
        }

        if self.recovery_grace.is_zero() {
            bail!("recovery_grace must be greater than 0");
        }

        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than 0");
        }

        if self.page_max_attempts == 0 {
            bail!("page_max_attempts must be greater than 0");
        }

        if self.item_max_attempts == 0 {
            bail!("item_max_attempts must be greater than 0");
        }

        if self.retry_limit == 0 {
            bail!("retry_limit must be greater than 0");
        }

        if self.metrics_interval.is_zero() {
            bail!("metrics_interval must be greater than 0");
        }

        if self.progress_buffer == 0 {
            bail!("progress_buffer must be greater than 0");
        }

        if self.max_backoff < self.initial_backoff {
            bail!(
                "max_backoff ({:?}) must not be smaller than initial_backoff ({:?})",
                self.max_backoff,
                self.initial_backoff,
            );
        }

        if self.stall_timeout <= self.monitor_interval {
            bail!(
                "stall_timeout ({:?}) must be longer than monitor_interval ({:?})",
                self.stall_timeout,
                self.monitor_interval,
            );
        }

        // Workers requeue into headroom reserved inside the queue, one place per slot.
        if self.queue_capacity <= self.worker_count {
            bail!(
                "queue_capacity ({}) must be larger than worker_count ({})",
                self.queue_capacity,
                self.worker_count,
            );
        }

        // A request that hangs must time out before the monitor could mistake it for a stall.
        if self.request_timeout >= self.stall_timeout {
            bail!(
                "request_timeout ({:?}) must be shorter than stall_timeout ({:?})",
                self.request_timeout,
                self.stall_timeout,
            );
        }

        Ok(())
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stall_timeout: Duration::from_secs(DEFAULT_STALL_TIMEOUT_SECS),
            monitor_interval: Duration::from_secs(DEFAULT_MONITOR_INTERVAL_SECS),
            recovery_grace: Duration::from_secs(DEFAULT_RECOVERY_GRACE_SECS),
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            collector_request_interval: Duration::from_millis(
                DEFAULT_COLLECTOR_REQUEST_INTERVAL_MS,
            ),
            worker_request_interval: Duration::from_millis(DEFAULT_WORKER_REQUEST_INTERVAL_MS),
            page_max_attempts: DEFAULT_PAGE_MAX_ATTEMPTS,
            item_max_attempts: DEFAULT_ITEM_MAX_ATTEMPTS,
            retry_limit: DEFAULT_RETRY_LIMIT,
            initial_backoff: Duration::from_secs(DEFAULT_INITIAL_BACKOFF_SECS),
            max_backoff: Duration::from_secs(DEFAULT_MAX_BACKOFF_SECS),
            max_child_pages: DEFAULT_MAX_CHILD_PAGES,
            metrics_interval: telemetry::DEFAULT_METRICS_INTERVAL,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct JobConfigBuilder {
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
    stall_timeout: Option<Duration>,
    monitor_interval: Option<Duration>,
    recovery_grace: Option<Duration>,
    request_timeout: Option<Duration>,
    collector_request_interval: Option<Duration>,
    worker_request_interval: Option<Duration>,
    page_max_attempts: Option<usize>,
    item_max_attempts: Option<usize>,
    retry_limit: Option<u32>,
    initial_backoff: Option<Duration>,
    max_backoff: Option<Duration>,
    max_child_pages: Option<usize>,
    metrics_interval: Option<Duration>,
    progress_buffer: Option<usize>,
}

impl JobConfigBuilder {
    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = Some(count);
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = Some(timeout);
        self
    }

    pub fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = Some(interval);
        self
    }

    pub fn recovery_grace(mut self, grace: Duration) -> Self {
        self.recovery_grace = Some(grace);
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn collector_request_interval(mut self, interval: Duration) -> Self {
        self.collector_request_interval = Some(interval);
        self
    }

    pub fn worker_request_interval(mut self, interval: Duration) -> Self {
        self.worker_request_interval = Some(interval);
        self
    }

    pub fn page_max_attempts(mut self, attempts: usize) -> Self {
        self.page_max_attempts = Some(attempts);
        self
    }

    pub fn item_max_attempts(mut self, attempts: usize) -> Self {
        self.item_max_attempts = Some(attempts);
        self
    }

    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    pub fn initial_backoff(mut self, backoff: Duration) -> Self {
        self.initial_backoff = Some(backoff);
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = Some(backoff);
        self
    }

    pub fn max_child_pages(mut self, pages: usize) -> Self {
        self.max_child_pages = Some(pages);
        self
    }

    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = Some(interval);
        self
    }

    pub fn progress_buffer(mut self, events: usize) -> Self {
        self.progress_buffer = Some(events);
        self
    }

    pub fn build(self) -> Result<JobConfig> {
        let defaults = JobConfig::default();
        let params = JobConfigParams {
            worker_count: self.worker_count.unwrap_or(defaults.worker_count),
            queue_capacity: self.queue_capacity.unwrap_or(defaults.queue_capacity),
            stall_timeout: self.stall_timeout.unwrap_or(defaults.stall_timeout),
            monitor_interval: self.monitor_interval.unwrap_or(defaults.monitor_interval),
            recovery_grace: self.recovery_grace.unwrap_or(defaults.recovery_grace),
            request_timeout: self.request_timeout.unwrap_or(defaults.request_timeout),
            collector_request_interval: self
                .collector_request_interval
                .unwrap_or(defaults.collector_request_interval),
            worker_request_interval: self
                .worker_request_interval
                .unwrap_or(defaults.worker_request_interval),
            page_max_attempts: self.page_max_attempts.unwrap_or(defaults.page_max_attempts),
            item_max_attempts: self.item_max_attempts.unwrap_or(defaults.item_max_attempts),
            retry_limit: self.retry_limit.unwrap_or(defaults.retry_limit),
            initial_backoff: self.initial_backoff.unwrap_or(defaults.initial_backoff),
            max_backoff: self.max_backoff.unwrap_or(defaults.max_backoff),
            max_child_pages: self.max_child_pages.unwrap_or(defaults.max_child_pages),
            metrics_interval: self.metrics_interval.unwrap_or(defaults.metrics_interval),
            progress_buffer: self.progress_buffer.unwrap_or(defaults.progress_buffer),
        };

        JobConfig::new(params)
    }
}
