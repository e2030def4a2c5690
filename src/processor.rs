//! Job orchestration: the coordinator, the worker slot arena, the heartbeat monitor, run-scoped
//! lifecycle, retry backoff and the final aggregation.

pub mod aggregate;
pub(crate) mod backoff;
pub mod coordinator;
pub(crate) mod lifecycle;
pub(crate) mod monitor;
pub(crate) mod worker_pool;
