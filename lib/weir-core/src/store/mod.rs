//! Windowed aggregation store.
//!
//! Updates flow into per-label [`Window`]s owned by a [`MetricManager`], and
//! a process-wide [`SharedClock`] keeps every window rolling in lockstep.

mod bucket;
mod clock;
mod manager;
mod window;

pub use self::bucket::Bucket;
pub use self::clock::SharedClock;
pub use self::manager::MetricManager;
pub use self::window::{UpdateOutcome, Window};
