//! Utilities Module - shared infrastructure
//!
//! - `constants`: concurrency caps, default timeouts and report limits
//! - `interner`: node name interning (`Arc<str>` deduplication across lines)
//! - `jsonpath`: minimal path parser used by `${node.output.a.b}` references

pub mod constants;
mod interner;
pub mod jsonpath;

pub use constants::{
    DEFAULT_ERROR_REPORT_LIMIT, DEFAULT_FORCE_EXIT_TIMEOUT, DEFAULT_LINE_CONCURRENCY,
    DEFAULT_NODE_CONCURRENCY, MAX_NODE_CONCURRENCY,
};
pub use interner::{intern, Interner};
