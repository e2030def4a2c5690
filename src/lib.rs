pub mod collect;
pub mod processor;
pub mod runtime;
pub mod source;
pub mod store;

pub use collect::collector::{Boundary, CollectorState};
pub use collect::item::{
    ChildNode, CollectedRecord, FlatChild, ItemDetail, ListingEntry, ListingPage, WorkItem,
};
pub use collect::work_queue::WorkQueue;
pub use collect::worker::{PoolCounts, WorkerState, WorkerStatus};
pub use processor::aggregate::{
    AggregateDataset, AggregateReport, AggregateSummary, Aggregator, DroppedContribution,
};
pub use processor::coordinator::{Coordinator, JobReport, JobStatus, StopHandle};
pub use runtime::config::{JobConfig, JobConfigBuilder, JobConfigParams};
pub use runtime::progress::{ProgressEvent, ProgressFeed, ProgressSnapshot, WorkerProgress};
pub use runtime::runner::Runner;
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
pub use source::{RateLimiter, RemoteSource, SourceError};
pub use store::{Checkpoint, FailedItem, JobStorage};
