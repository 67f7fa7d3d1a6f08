//! Centralized constants for flowline runtime configuration
//!
//! All concurrency caps and timeout defaults in one place for easy tuning.

use std::time::Duration;

// ═══════════════════════════════════════════════════════════════
// Concurrency
// ═══════════════════════════════════════════════════════════════

/// Hard ceiling on node concurrency inside a single line.
///
/// Caps both the sync worker pool and the async blocking-delegation permits.
pub const MAX_NODE_CONCURRENCY: usize = 16;

/// Node concurrency used when neither config nor CLI sets one
pub const DEFAULT_NODE_CONCURRENCY: usize = 8;

/// Number of lines a batch runs at the same time.
///
/// Worst-case worker threads for a batch = line concurrency × node concurrency.
pub const DEFAULT_LINE_CONCURRENCY: usize = 4;

// ═══════════════════════════════════════════════════════════════
// Timeouts
// ═══════════════════════════════════════════════════════════════

/// Grace period after an interrupt before the process is force-exited
pub const DEFAULT_FORCE_EXIT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval of the force-exit monitor thread
pub const INTERRUPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ═══════════════════════════════════════════════════════════════
// Reporting
// ═══════════════════════════════════════════════════════════════

/// Number of failed lines kept verbatim in a batch error summary
pub const DEFAULT_ERROR_REPORT_LIMIT: usize = 5;

/// File name of the JSONL output artifact inside the output directory
pub const OUTPUT_FILE_NAME: &str = "output.jsonl";

/// Field carrying the line index in every output record
pub const LINE_NUMBER_KEY: &str = "line_number";
