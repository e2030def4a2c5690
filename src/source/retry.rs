//! Shared retry context, logging helpers, and canned message templates used by
//! the source client to keep instrumentation consistent across operations.

use anyhow::Error;
use std::time::Duration;

macro_rules! log_with_retry_ctx {
    ($level:ident, $ctx:expr, $($rest:tt)*) => {{
        match $ctx.subject {
            RetrySubject::Page { cursor } => tracing::$level!(
                cursor = cursor.unwrap_or("<first>"),
                $($rest)*
            ),
            RetrySubject::Item { item_id, sequence_index } => tracing::$level!(
                item_id,
                sequence_index,
                $($rest)*
            ),
        }
    }};
}

/// What a retried request was about, attached to every retry log line.
#[derive(Clone, Copy)]
pub(crate) enum RetrySubject<'a> {
    Page {
        cursor: Option<&'a str>,
    },
    Item {
        item_id: &'a str,
        sequence_index: u64,
    },
}

/// Logging labels for one remote operation.
#[derive(Clone, Copy)]
pub(crate) struct RetryMessages {
    pub(crate) operation: &'static str,
    pub(crate) retry: &'static str,
    pub(crate) rate_limited: &'static str,
    pub(crate) exhausted: &'static str,
    pub(crate) rejected: &'static str,
}

#[derive(Clone, Copy)]
pub(crate) struct RetryContext<'a> {
    subject: RetrySubject<'a>,
    messages: &'a RetryMessages,
}

impl<'a> RetryContext<'a> {
    pub(crate) fn for_page(messages: &'a RetryMessages, cursor: Option<&'a str>) -> Self {
        Self {
            subject: RetrySubject::Page { cursor },
            messages,
        }
    }

    pub(crate) fn for_item(messages: &'a RetryMessages, item_id: &'a str, sequence_index: u64) -> Self {
        Self {
            subject: RetrySubject::Item {
                item_id,
                sequence_index,
            },
            messages,
        }
    }

    pub(crate) fn operation(&self) -> &'static str {
        self.messages.operation
    }

    pub(crate) fn log_retry(&self, attempt: usize, backoff: Duration, err: &Error) {
        let backoff_ms = Self::duration_to_millis(backoff);
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms,
            error = %err,
            "{}",
            self.messages.retry
        );
    }

    pub(crate) fn log_rate_limited(&self, attempt: usize, backoff: Duration) {
        let backoff_ms = Self::duration_to_millis(backoff);
        log_with_retry_ctx!(
            warn,
            self,
            attempt,
            backoff_ms,
            "{}",
            self.messages.rate_limited
        );
    }

    pub(crate) fn log_exhausted(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(error, self, attempt, error = %err, "{}", self.messages.exhausted);
    }

    pub(crate) fn log_rejected(&self, attempt: usize, err: &Error) {
        log_with_retry_ctx!(warn, self, attempt, error = %err, "{}", self.messages.rejected);
    }

    fn duration_to_millis(backoff: Duration) -> u64 {
        backoff.as_millis().min(u128::from(u64::MAX)) as u64
    }
}

pub(crate) const LISTING_PAGE_RETRY: RetryMessages = RetryMessages {
    operation: "fetch_listing_page",
    retry: "listing page fetch failed; retrying",
    rate_limited: "listing page fetch rate limited; backing off",
    exhausted: "listing page fetch exhausted retries",
    rejected: "listing page fetch rejected by source",
};

pub(crate) const ITEM_DETAIL_RETRY: RetryMessages = RetryMessages {
    operation: "fetch_item_detail",
    retry: "item detail fetch failed; retrying",
    rate_limited: "item detail fetch rate limited; backing off",
    exhausted: "item detail fetch exhausted retries",
    rejected: "item detail fetch rejected by source",
};

pub(crate) const CHILD_PAGE_RETRY: RetryMessages = RetryMessages {
    operation: "fetch_child_page",
    retry: "child page fetch failed; retrying",
    rate_limited: "child page fetch rate limited; backing off",
    exhausted: "child page fetch exhausted retries",
    rejected: "child page fetch rejected by source",
};
