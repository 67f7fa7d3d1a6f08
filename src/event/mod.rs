//! Event Module - audit trail for batch and line execution
//!
//! Key types:
//! - `Event`: Envelope with id + timestamp + kind
//! - `EventKind`: batch / line / node / aggregation level events
//! - `EventLog`: Thread-safe, append-only log shared by every line of a batch

mod log;

pub use log::{Event, EventKind, EventLog};
