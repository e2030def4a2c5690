use crate::source::client::SourceError;
use anyhow::Result;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Enforces a minimum spacing between requests made by one caller class.
///
/// Each caller reserves the next free slot under the lock and then sleeps outside of it, so
/// concurrent callers queue up one interval apart instead of all firing when the gap elapses.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_slot: Mutex::new(None),
        }
    }

    /// A limiter that never waits.
    pub fn unlimited() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn lock(&self) -> MutexGuard<'_, Option<Instant>> {
        self.next_slot.lock().expect("rate limiter mutex poisoned")
    }

    /// Waits for this caller's slot. Fails with [`SourceError::Cancelled`] if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<()> {
        let now = Instant::now();
        let slot = {
            let mut next = self.lock();
            let slot = next.map_or(now, |reserved| reserved.max(now));
            *next = Some(slot + self.interval);
            slot
        };

        if slot <= now {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(SourceError::Cancelled.into()),
            _ = sleep_until(slot) => Ok(()),
        }
    }

    /// Pushes the next free slot at least `delay` into the future, e.g. after a rate-limit response.
    pub fn penalize(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let candidate = Instant::now() + delay;
        let mut next = self.lock();
        *next = Some(next.map_or(candidate, |reserved| reserved.max(candidate)));
        tracing::debug!(delay_ms = delay.as_millis() as u64, "rate limiter penalized");
    }
}
