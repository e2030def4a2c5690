//! Producer/consumer side of a backfill: the data model, the bounded work queue, the listing
//! collector that fills it, and the per-slot workers that drain it.

pub mod collector;
pub mod item;
pub mod work_queue;
pub mod worker;
