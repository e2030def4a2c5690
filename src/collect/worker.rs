//! Worker module split across focused submodules:
//! - `types`: per-item outcome of a processing attempt
//! - `shared`: the worker slot table and the collaborators shared by every worker task
//! - `process`: worker struct plus the run loop and per-item processing
//! - `children`: reply-tree flattening with deferred page expansion
//! - `tests`: worker unit tests

mod children;
mod process;
mod shared;
mod types;


pub use process::Worker;
pub use shared::{
    PoolCounts, StalledSlot, WorkerShared, WorkerSharedParams, WorkerState, WorkerStatus,
    WorkerTable,
};
pub use types::ItemOutcome;
