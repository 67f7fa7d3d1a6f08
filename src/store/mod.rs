//! Store Module - concurrent run state
//!
//! Thread-safe storage written from worker threads and line tasks.
//! Uses DashMap for lock-free concurrent access.
//!
//! Key types:
//! - `RunTracker`: node run infos of one line (or the aggregation phase)
//! - `LineStore`: finished `LineResult`s of a batch

mod line_store;
mod run_tracker;

pub use line_store::LineStore;
pub use run_tracker::RunTracker;
