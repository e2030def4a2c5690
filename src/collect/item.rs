use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A unit of work handed from the collector to the worker pool.
///
/// Items are immutable once enqueued. A retry produces a fresh copy through [`WorkItem::retried`]
/// so the sequence index assigned by the collector survives every trip through the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    id: String,
    sequence_index: u64,
    retry_count: u32,
    payload: String,
}

impl WorkItem {
    pub fn new(id: impl Into<String>, sequence_index: u64, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sequence_index,
            retry_count: 0,
            payload: payload.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sequence_index(&self) -> u64 {
        self.sequence_index
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Minimal reference the remote source needs to fetch the item's detail.
    pub fn payload(&self) -> &str {
        &self.payload
    }

    /// Returns the copy that goes back on the queue after a failed processing attempt.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count.saturating_add(1),
            ..self.clone()
        }
    }
}

/// One entry of a listing page, in the source's newest-first order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub id: String,
    /// Position in the source ordering (creation time in the source's units).
    pub position: i64,
    pub payload: String,
}

impl ListingEntry {
    pub fn new(id: impl Into<String>, position: i64, payload: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            position,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPage {
    pub entries: Vec<ListingEntry>,
    /// Continuation cursor for the next (older) page; `None` marks the end of the listing.
    pub next_cursor: Option<String>,
}

/// Node of the nested reply tree returned with an item's detail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChildNode {
    Loaded {
        id: String,
        fields: Value,
        #[serde(default)]
        replies: Vec<ChildNode>,
    },
    /// Placeholder for children the source did not inline; expanded with a follow-up fetch.
    Deferred { cursor: String },
}

impl ChildNode {
    pub fn loaded(id: impl Into<String>, fields: Value, replies: Vec<ChildNode>) -> Self {
        ChildNode::Loaded {
            id: id.into(),
            fields,
            replies,
        }
    }

    pub fn deferred(cursor: impl Into<String>) -> Self {
        ChildNode::Deferred {
            cursor: cursor.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub fields: Value,
    pub children: Vec<ChildNode>,
}

/// A child record after the reply tree has been flattened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatChild {
    pub id: String,
    pub parent_id: String,
    pub depth: u32,
    pub fields: Value,
}

/// Detail result persisted for one [`WorkItem`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedRecord {
    pub id: String,
    pub sequence_index: u64,
    pub fields: Value,
    pub children: Vec<FlatChild>,
}

impl CollectedRecord {
    pub fn new(item: &WorkItem, fields: Value, children: Vec<FlatChild>) -> Self {
        Self {
            id: item.id().to_owned(),
            sequence_index: item.sequence_index(),
            fields,
            children,
        }
    }
}
