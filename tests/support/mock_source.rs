use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use backfill::{ChildNode, ItemDetail, ListingEntry, ListingPage, RemoteSource, SourceError, WorkItem};
use futures::future::BoxFuture;
use serde_json::json;
use tokio::time::sleep;

/// Position of `item-0`: 2024-01-03T00:00:00Z. Every later item is one hour older.
pub const NEWEST_POSITION: i64 = 1_704_240_000;
const POSITION_STEP: i64 = 3_600;

#[derive(Default)]
struct MockState {
    listing_fails: bool,
    rejected: HashSet<String>,
    transient_failures: HashMap<String, usize>,
    rate_limited: HashMap<String, (usize, Duration)>,
    hang_once: HashSet<String>,
    slow: HashMap<String, Duration>,
    detail_calls: HashMap<String, usize>,
    listing_calls: usize,
}

/// In-process listing of `item-<k>` entries, newest first, with scripted detail failures.
///
/// Even items carry a loaded reply with a nested reply; items divisible by three also carry a
/// deferred page holding one more reply.
#[derive(Clone)]
pub struct MockSource {
    total: usize,
    page_size: usize,
    detail_delay: Duration,
    state: Arc<Mutex<MockState>>,
}

impl MockSource {
    pub fn new(total: usize, page_size: usize) -> Self {
        Self {
            total,
            page_size: page_size.max(1),
            detail_delay: Duration::ZERO,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Applies `delay` to every detail request.
    pub fn with_detail_delay(mut self, delay: Duration) -> Self {
        self.detail_delay = delay;
        self
    }

    pub fn position_of(index: usize) -> i64 {
        NEWEST_POSITION - index as i64 * POSITION_STEP
    }

    pub fn id_of(index: usize) -> String {
        format!("item-{index}")
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().expect("mock source mutex poisoned")
    }

    pub fn set_listing_failure(&self, fails: bool) {
        self.lock().listing_fails = fails;
    }

    pub fn reject(&self, id: &str) {
        self.lock().rejected.insert(id.to_owned());
    }

    pub fn fail_transiently(&self, id: &str, times: usize) {
        self.lock().transient_failures.insert(id.to_owned(), times);
    }

    pub fn rate_limit(&self, id: &str, times: usize) {
        self.rate_limit_for(id, times, Duration::from_millis(20));
    }

    /// The next `times` detail requests for `id` answer "rate limited, retry after `retry_after`".
    pub fn rate_limit_for(&self, id: &str, times: usize, retry_after: Duration) {
        self.lock()
            .rate_limited
            .insert(id.to_owned(), (times, retry_after));
    }

    /// The first detail request for `id` never answers; only the request timeout ends it.
    pub fn hang_once(&self, id: &str) {
        self.lock().hang_once.insert(id.to_owned());
    }

    pub fn slow_down(&self, id: &str, delay: Duration) {
        self.lock().slow.insert(id.to_owned(), delay);
    }

    pub fn detail_calls(&self, id: &str) -> usize {
        self.lock().detail_calls.get(id).copied().unwrap_or_default()
    }

    pub fn listing_calls(&self) -> usize {
        self.lock().listing_calls
    }

    fn page_start(&self, cursor: Option<&str>) -> Result<usize> {
        match cursor {
            None => Ok(0),
            Some(cursor) => cursor
                .strip_prefix("offset-")
                .and_then(|offset| offset.parse().ok())
                .ok_or_else(|| {
                    anyhow!(SourceError::Rejected {
                        reason: format!("unknown cursor {cursor}"),
                    })
                }),
        }
    }

    fn children_of(index: usize) -> Vec<ChildNode> {
        let mut children = Vec::new();
        if index % 2 == 0 {
            children.push(ChildNode::loaded(
                format!("reply-{index}"),
                json!({ "body": format!("reply to {index}") }),
                vec![ChildNode::loaded(
                    format!("reply-{index}-nested"),
                    json!({ "body": "nested" }),
                    Vec::new(),
                )],
            ));
        }
        if index % 3 == 0 {
            children.push(ChildNode::deferred(format!("more-{index}")));
        }
        children
    }
}

enum DetailScript {
    Hang,
    Reject,
    Unavailable,
    RateLimited(Duration),
    Answer(Duration),
}

impl RemoteSource for MockSource {
    fn fetch_listing_page<'a>(
        &'a self,
        cursor: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ListingPage>> {
        Box::pin(async move {
            let fails = {
                let mut state = self.lock();
                state.listing_calls += 1;
                state.listing_fails
            };
            if fails {
                return Err(anyhow!(SourceError::Unavailable {
                    reason: "listing endpoint down".into(),
                }));
            }

            let start = self.page_start(cursor)?.min(self.total);
            let end = (start + self.page_size).min(self.total);
            let entries = (start..end)
                .map(|index| {
                    ListingEntry::new(Self::id_of(index), Self::position_of(index), Self::id_of(index))
                })
                .collect();
            let next_cursor = (end < self.total).then(|| format!("offset-{end}"));
            Ok(ListingPage {
                entries,
                next_cursor,
            })
        })
    }

    fn fetch_item_detail<'a>(&'a self, item: &'a WorkItem) -> BoxFuture<'a, Result<ItemDetail>> {
        Box::pin(async move {
            let id = item.id().to_owned();
            let script = {
                let mut state = self.lock();
                *state.detail_calls.entry(id.clone()).or_default() += 1;
                if state.hang_once.remove(&id) {
                    DetailScript::Hang
                } else if state.rejected.contains(&id) {
                    DetailScript::Reject
                } else if let Some(remaining) =
                    state.transient_failures.get_mut(&id).filter(|left| **left > 0)
                {
                    *remaining -= 1;
                    DetailScript::Unavailable
                } else if let Some((remaining, retry_after)) =
                    state.rate_limited.get_mut(&id).filter(|(left, _)| *left > 0)
                {
                    *remaining -= 1;
                    DetailScript::RateLimited(*retry_after)
                } else {
                    DetailScript::Answer(state.slow.get(&id).copied().unwrap_or(self.detail_delay))
                }
            };

            match script {
                DetailScript::Hang => futures::future::pending().await,
                DetailScript::Reject => Err(anyhow!(SourceError::Rejected {
                    reason: format!("{id} was removed"),
                })),
                DetailScript::Unavailable => Err(anyhow!(SourceError::Unavailable {
                    reason: "detail endpoint hiccup".into(),
                })),
                DetailScript::RateLimited(retry_after) => Err(anyhow!(SourceError::RateLimited {
                    retry_after: Some(retry_after),
                })),
                DetailScript::Answer(delay) => {
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    let index: usize = id
                        .strip_prefix("item-")
                        .and_then(|index| index.parse().ok())
                        .unwrap_or_default();
                    Ok(ItemDetail {
                        fields: json!({ "title": format!("title of {id}"), "ref": item.payload() }),
                        children: Self::children_of(index),
                    })
                }
            }
        })
    }

    fn fetch_child_page<'a>(
        &'a self,
        _item: &'a WorkItem,
        cursor: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ChildNode>>> {
        Box::pin(async move {
            Ok(vec![ChildNode::loaded(
                format!("{cursor}-reply"),
                json!({ "body": "expanded" }),
                Vec::new(),
            )])
        })
    }
}
