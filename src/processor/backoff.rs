//! Capped exponential backoff around a fallible async operation.

use crate::source::SourceError;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Liveness callback fired on a fixed cadence while a caller is parked in a wait it chose to make.
#[derive(Clone, Copy)]
pub(crate) struct Heartbeat<'a> {
    pulse: &'a (dyn Fn() + Send + Sync),
    every: Duration,
}

impl<'a> Heartbeat<'a> {
    pub(crate) fn new(pulse: &'a (dyn Fn() + Send + Sync), every: Duration) -> Self {
        Self {
            pulse,
            every: every.max(Duration::from_millis(1)),
        }
    }

    pub(crate) fn pulse(&self) {
        (self.pulse)();
    }
}

/// Drives `work` to completion, pulsing `heartbeat` every period until it resolves.
pub(crate) async fn keep_alive<F>(heartbeat: Option<Heartbeat<'_>>, work: F) -> F::Output
where
    F: Future,
{
    let Some(heartbeat) = heartbeat else {
        return work.await;
    };

    tokio::pin!(work);
    let mut ticker = interval_at(Instant::now() + heartbeat.every, heartbeat.every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            output = &mut work => return output,
            _ = ticker.tick() => heartbeat.pulse(),
        }
    }
}

#[derive(Clone, Copy)]
pub(crate) struct RetryBackoff<'a> {
    initial_delay: Duration,
    max_delay: Duration,
    max_attempts: usize,
    cancel: &'a CancellationToken,
    heartbeat: Option<Heartbeat<'a>>,
}

impl<'a> RetryBackoff<'a> {
    pub(crate) fn new(
        initial_delay: Duration,
        max_delay: Duration,
        max_attempts: usize,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            max_attempts: max_attempts.max(1),
            cancel,
            heartbeat: None,
        }
    }

    /// Keeps `heartbeat` beating while the loop sleeps between attempts.
    pub(crate) fn with_heartbeat(mut self, heartbeat: Option<Heartbeat<'a>>) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Delay after the `attempt`-th failure: `initial * 2^(attempt - 1)`, capped at `max_delay`.
    pub(crate) fn delay_after(&self, attempt: usize) -> Duration {
        let exponent = u32::try_from(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    fn is_last(&self, attempt: usize) -> bool {
        attempt >= self.max_attempts
    }

    async fn pause(&self, delay: Duration) -> Result<()> {
        if delay.is_zero() {
            yield_now().await;
            return Ok(());
        }
        let wait = async {
            tokio::select! {
                _ = self.cancel.cancelled() => Err(anyhow::Error::from(SourceError::Cancelled)),
                _ = sleep(delay) => Ok(()),
            }
        };
        keep_alive(self.heartbeat, wait).await
    }
}

pub(crate) enum RetryDisposition {
    Retry,
    /// Retry, but wait at least this long before the next attempt.
    RetryAfter(Duration),
    Abort,
}

/// Runs `operation` until it succeeds, `classify` aborts, attempts run out, or the token fires.
/// Cancellation surfaces as [`SourceError::Cancelled`].
///
/// `on_failure(attempt, delay, err, will_retry)` sees every retryable failure, the last one
/// included (with `will_retry == false`).
pub(crate) async fn retry_with_backoff<T, F, Fut, L, C>(
    policy: RetryBackoff<'_>,
    mut operation: F,
    mut on_failure: L,
    mut classify: C,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
    L: FnMut(usize, Duration, &anyhow::Error, bool),
    C: FnMut(usize, &anyhow::Error) -> RetryDisposition,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        if policy.cancel.is_cancelled() {
            return Err(SourceError::Cancelled.into());
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let delay = match classify(attempt, &err) {
            RetryDisposition::Abort => return Err(err),
            RetryDisposition::Retry => policy.delay_after(attempt),
            RetryDisposition::RetryAfter(minimum) => policy.delay_after(attempt).max(minimum),
        };

        let will_retry = !policy.is_last(attempt);
        on_failure(attempt, delay, &err, will_retry);
        if !will_retry {
            return Err(err);
        }
        policy.pause(delay).await?;
    }
}
