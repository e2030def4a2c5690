//! Remote source plumbing: the source trait and error taxonomy, request pacing, retry
//! instrumentation, and per-client metrics.

pub mod client;
pub mod metrics;
pub mod rate_limit;
pub(crate) mod retry;

pub use client::{RemoteSource, RequestScope, SourceClient, SourceClientOptions, SourceError};
pub use metrics::SourceMetricsSnapshot;
pub use rate_limit::RateLimiter;
