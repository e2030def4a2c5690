//! Listing paginator feeding the work queue.
//!
//! The collector walks the remote listing newest-first, stamps each entry with the next
//! `sequence_index` and pushes it onto the bounded [`WorkQueue`], suspending while the queue is
//! full. It stops at the first entry older than the [`Boundary`] or when the listing runs out,
//! and always closes the queue on the way out so workers can drain and finish.

use crate::collect::item::{ListingEntry, WorkItem};
use crate::collect::work_queue::WorkQueue;
use crate::runtime::telemetry::Telemetry;
use crate::source::{RequestScope, SourceClient, SourceError};
use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorState {
    #[default]
    Running,
    Draining,
    Done,
}

/// Oldest allowed position in the source ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Boundary {
    oldest: i64,
}

impl Boundary {
    pub fn new(oldest: i64) -> Self {
        Self { oldest }
    }

    /// Collects the whole listing.
    pub fn unbounded() -> Self {
        Self { oldest: i64::MIN }
    }

    /// Parses a `YYYY-MM-DD` calendar date as midnight UTC in Unix seconds.
    pub fn from_date(date: &str) -> Result<Self> {
        let day = NaiveDate::parse_from_str(date, "%Y-%m-%d")
            .with_context(|| format!("invalid boundary date {date:?}; expected YYYY-MM-DD"))?;
        let midnight = day
            .and_hms_opt(0, 0, 0)
            .with_context(|| format!("boundary date {date:?} has no midnight"))?;
        Ok(Self::new(midnight.and_utc().timestamp()))
    }

    pub fn oldest(&self) -> i64 {
        self.oldest
    }

    pub fn is_past(&self, position: i64) -> bool {
        position < self.oldest
    }
}

/// Why collection stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionEnd {
    BoundaryReached,
    ListingExhausted,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSummary {
    pub enqueued: u64,
    pub pages: usize,
    pub end: CollectionEnd,
}

pub struct CollectorParams {
    pub client: SourceClient,
    pub queue: Arc<WorkQueue>,
    pub telemetry: Arc<Telemetry>,
    pub boundary: Boundary,
    pub shutdown: CancellationToken,
}

pub struct Collector {
    client: SourceClient,
    queue: Arc<WorkQueue>,
    telemetry: Arc<Telemetry>,
    boundary: Boundary,
    shutdown: CancellationToken,
    state: watch::Sender<CollectorState>,
}

enum Step {
    Continue,
    Finished(CollectionEnd),
}

impl Collector {
    pub fn new(params: CollectorParams) -> Self {
        let (state, _) = watch::channel(CollectorState::Running);
        Self {
            client: params.client,
            queue: params.queue,
            telemetry: params.telemetry,
            boundary: params.boundary,
            shutdown: params.shutdown,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<CollectorState> {
        self.state.subscribe()
    }

    /// Paginates until the boundary, the end of the listing, or cancellation.
    ///
    /// A listing page that still fails after its retries is returned as an error; the caller is
    /// expected to treat it as fatal. The queue is closed on every exit path.
    #[tracing::instrument(name = "collector", skip_all, fields(oldest = self.boundary.oldest()))]
    pub async fn run(self) -> Result<CollectionSummary> {
        let result = self.paginate().await;

        self.state.send_replace(CollectorState::Draining);
        self.queue.close();
        self.state.send_replace(CollectorState::Done);

        match &result {
            Ok(summary) => tracing::info!(
                enqueued = summary.enqueued,
                pages = summary.pages,
                end = ?summary.end,
                "collector finished"
            ),
            Err(err) => tracing::error!(error = %err, "collector failed"),
        }
        result
    }

    async fn paginate(&self) -> Result<CollectionSummary> {
        let mut cursor: Option<String> = None;
        let mut next_sequence = 0u64;
        let mut pages = 0usize;

        let end = loop {
            let scope = RequestScope::new(&self.shutdown);
            let page = match self.client.fetch_listing_page(cursor.as_deref(), scope).await {
                Ok(page) => page,
                Err(err) if self.is_cancellation(&err) => break CollectionEnd::Stopped,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!(
                            "listing page {} failed after retries",
                            cursor.as_deref().unwrap_or("<first>")
                        )
                    })
                }
            };
            pages += 1;

            if let Step::Finished(end) = self.enqueue_page(page.entries, &mut next_sequence).await? {
                break end;
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break CollectionEnd::ListingExhausted,
            }
        };

        Ok(CollectionSummary {
            enqueued: next_sequence,
            pages,
            end,
        })
    }

    async fn enqueue_page(
        &self,
        entries: Vec<ListingEntry>,
        next_sequence: &mut u64,
    ) -> Result<Step> {
        for entry in entries {
            if self.boundary.is_past(entry.position) {
                tracing::info!(
                    item_id = %entry.id,
                    position = entry.position,
                    oldest = self.boundary.oldest(),
                    "entry is past the boundary; stopping collection"
                );
                return Ok(Step::Finished(CollectionEnd::BoundaryReached));
            }

            let item = WorkItem::new(entry.id, *next_sequence, entry.payload);
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    return Ok(Step::Finished(CollectionEnd::Stopped));
                }
                pushed = self.queue.push(item) => pushed?,
            }

            *next_sequence += 1;
            self.telemetry.record_enqueued();
        }
        Ok(Step::Continue)
    }

    fn is_cancellation(&self, err: &anyhow::Error) -> bool {
        self.shutdown.is_cancelled()
            || matches!(SourceError::find(err), Some(SourceError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::item::{ItemDetail, ListingPage};
    use crate::source::{RateLimiter, RemoteSource, SourceClientOptions};
    use futures::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;

    /// Serves `total` entries in pages of `page_size`; entry `k` (1-based) sits at position
    /// `1000 - 10 * k`.
    struct PagedListing {
        total: usize,
        page_size: usize,
        failing: bool,
        calls: AtomicUsize,
    }

    impl PagedListing {
        fn new(total: usize, page_size: usize) -> Self {
            Self {
                total,
                page_size,
                failing: false,
                calls: AtomicUsize::new(0),
            }
        }

        fn position(k: usize) -> i64 {
            1000 - 10 * k as i64
        }
    }

    impl RemoteSource for PagedListing {
        fn fetch_listing_page<'a>(
            &'a self,
            cursor: Option<&'a str>,
        ) -> BoxFuture<'a, Result<ListingPage>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.failing {
                    return Err(SourceError::Unavailable {
                        reason: "503".into(),
                    }
                    .into());
                }
                let page: usize = match cursor {
                    None => 0,
                    Some(cursor) => cursor.trim_start_matches("page-").parse()?,
                };
                let first = page * self.page_size + 1;
                let last = (first + self.page_size - 1).min(self.total);
                let entries = (first..=last)
                    .map(|k| ListingEntry::new(format!("item-{k}"), Self::position(k), format!("/i/{k}")))
                    .collect();
                let next_cursor = (last < self.total).then(|| format!("page-{}", page + 1));
                Ok(ListingPage {
                    entries,
                    next_cursor,
                })
            })
        }

        fn fetch_item_detail<'a>(
            &'a self,
            _item: &'a WorkItem,
        ) -> BoxFuture<'a, Result<ItemDetail>> {
            Box::pin(async { anyhow::bail!("listing-only source") })
        }
    }

    fn collector(
        source: Arc<PagedListing>,
        queue: Arc<WorkQueue>,
        boundary: Boundary,
        shutdown: CancellationToken,
    ) -> (Collector, Arc<Telemetry>) {
        let telemetry = Arc::new(Telemetry::default());
        let client = SourceClient::new(
            source,
            Arc::new(RateLimiter::unlimited()),
            SourceClientOptions {
                request_timeout: Duration::from_secs(1),
                max_attempts: 2,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                heartbeat_interval: Duration::from_millis(100),
            },
            telemetry.clone(),
        );
        let collector = Collector::new(CollectorParams {
            client,
            queue,
            telemetry: telemetry.clone(),
            boundary,
            shutdown,
        });
        (collector, telemetry)
    }

    fn drain(queue: &WorkQueue) -> Vec<WorkItem> {
        std::iter::from_fn(|| queue.try_pop()).collect()
    }

    #[test]
    fn boundary_parses_calendar_dates_as_utc_midnight() {
        let boundary = Boundary::from_date("2024-01-02").unwrap();
        assert_eq!(boundary.oldest(), 1_704_153_600);
        assert!(boundary.is_past(1_704_153_599));
        assert!(!boundary.is_past(1_704_153_600));
        assert!(Boundary::from_date("02/01/2024").is_err());
        assert!(!Boundary::unbounded().is_past(i64::MIN));
    }

    #[tokio::test]
    async fn stops_at_the_first_entry_past_the_boundary() {
        let source = Arc::new(PagedListing::new(25, 10));
        let queue = Arc::new(WorkQueue::with_capacity(100));
        let boundary = Boundary::new(PagedListing::position(19));
        let (collector, telemetry) =
            collector(source.clone(), queue.clone(), boundary, CancellationToken::new());
        let state = collector.state();

        let summary = collector.run().await.expect("collection succeeds");

        assert_eq!(summary.end, CollectionEnd::BoundaryReached);
        assert_eq!(summary.enqueued, 19);
        assert_eq!(summary.pages, 2);
        assert_eq!(source.calls.load(Ordering::SeqCst), 2, "third page never fetched");
        assert_eq!(*state.borrow(), CollectorState::Done);
        assert!(queue.is_closed());
        assert_eq!(telemetry.enqueued(), 19);

        let items = drain(&queue);
        let ids: Vec<String> = items.iter().map(|i| i.id().to_owned()).collect();
        let expected: Vec<String> = (1..=19).map(|k| format!("item-{k}")).collect();
        assert_eq!(ids, expected);
        let sequence: Vec<u64> = items.iter().map(|i| i.sequence_index()).collect();
        assert_eq!(sequence, (0..19).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn missing_cursor_is_the_natural_end() {
        let source = Arc::new(PagedListing::new(25, 10));
        let queue = Arc::new(WorkQueue::with_capacity(100));
        let (collector, _) = collector(
            source.clone(),
            queue.clone(),
            Boundary::unbounded(),
            CancellationToken::new(),
        );

        let summary = collector.run().await.expect("collection succeeds");

        assert_eq!(summary.end, CollectionEnd::ListingExhausted);
        assert_eq!(summary.enqueued, 25);
        assert_eq!(summary.pages, 3);
        assert_eq!(queue.len(), 25);
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn exhausted_page_retries_fail_the_collection() {
        let source = Arc::new(PagedListing {
            failing: true,
            ..PagedListing::new(5, 5)
        });
        let queue = Arc::new(WorkQueue::with_capacity(10));
        let (collector, _) = collector(
            source.clone(),
            queue.clone(),
            Boundary::unbounded(),
            CancellationToken::new(),
        );

        let err = collector.run().await.expect_err("listing never succeeds");

        assert!(format!("{err:#}").contains("listing page <first> failed after retries"));
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
        assert!(queue.is_closed());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_suspends_the_collector() {
        let source = Arc::new(PagedListing::new(10, 4));
        let queue = Arc::new(WorkQueue::with_capacity(3));
        let (collector, _) = collector(
            source,
            queue.clone(),
            Boundary::unbounded(),
            CancellationToken::new(),
        );
        let handle = tokio::spawn(collector.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.len(), 3);
        assert!(!handle.is_finished());

        let mut received = Vec::new();
        while let Some(item) = timeout(Duration::from_secs(1), queue.pop())
            .await
            .expect("queue keeps moving")
        {
            received.push(item.sequence_index());
        }

        let summary = handle.await.unwrap().unwrap();
        assert_eq!(summary.enqueued, 10);
        assert_eq!(received, (0..10).collect::<Vec<u64>>());
        assert!(queue.high_water_mark() <= 3);
    }

    #[tokio::test]
    async fn cancellation_while_blocked_on_a_full_queue_stops_collection() {
        let source = Arc::new(PagedListing::new(10, 10));
        let queue = Arc::new(WorkQueue::with_capacity(2));
        let shutdown = CancellationToken::new();
        let (collector, _) =
            collector(source, queue.clone(), Boundary::unbounded(), shutdown.clone());
        let handle = tokio::spawn(collector.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.cancel();

        let summary = timeout(Duration::from_secs(1), handle)
            .await
            .expect("collector stops promptly")
            .unwrap()
            .unwrap();
        assert_eq!(summary.end, CollectionEnd::Stopped);
        assert_eq!(summary.enqueued, 2);
        assert!(queue.is_closed());
    }
}
