//! EventLog - append-only execution log
//!
//! - Event: envelope with id + timestamp + kind
//! - EventKind: batch, line, node and aggregation events
//! - EventLog: thread-safe, cloned into every line task

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Single event in the batch execution log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Monotonic sequence ID (for ordering)
    pub id: u64,
    /// Time since log creation (ms)
    pub timestamp_ms: u64,
    pub kind: EventKind,
}

/// All event types
///
/// Node names are `Arc<str>` so emitting from hot scheduler loops only bumps
/// a refcount. `line` is `None` for the aggregation phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    // ═══════════════════════════════════════════
    // BATCH LEVEL
    // ═══════════════════════════════════════════
    BatchStarted {
        run_id: String,
        total_lines: usize,
    },
    BatchCompleted {
        completed_lines: usize,
        failed_lines: usize,
        duration_ms: u64,
    },

    // ═══════════════════════════════════════════
    // LINE LEVEL
    // ═══════════════════════════════════════════
    LineStarted {
        line: usize,
        run_id: String,
    },
    LineCompleted {
        line: usize,
        duration_ms: u64,
    },
    LineFailed {
        line: usize,
        error: String,
    },

    // ═══════════════════════════════════════════
    // NODE LEVEL
    // ═══════════════════════════════════════════
    NodeScheduled {
        line: Option<usize>,
        node: Arc<str>,
    },
    NodeCompleted {
        line: Option<usize>,
        node: Arc<str>,
        duration_ms: u64,
    },
    NodeFailed {
        line: Option<usize>,
        node: Arc<str>,
        error: String,
    },
    NodeBypassed {
        line: Option<usize>,
        node: Arc<str>,
        reason: String,
    },

    // ═══════════════════════════════════════════
    // AGGREGATION PHASE
    // ═══════════════════════════════════════════
    AggregationStarted {
        nodes: Vec<Arc<str>>,
        lines: usize,
    },
    AggregationCompleted {
        success: bool,
        duration_ms: u64,
    },
}

impl EventKind {
    /// Extract the node name if event is node-related
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::NodeScheduled { node, .. }
            | Self::NodeCompleted { node, .. }
            | Self::NodeFailed { node, .. }
            | Self::NodeBypassed { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Extract the line number for line and node events
    pub fn line(&self) -> Option<usize> {
        match self {
            Self::LineStarted { line, .. }
            | Self::LineCompleted { line, .. }
            | Self::LineFailed { line, .. } => Some(*line),
            Self::NodeScheduled { line, .. }
            | Self::NodeCompleted { line, .. }
            | Self::NodeFailed { line, .. }
            | Self::NodeBypassed { line, .. } => *line,
            _ => None,
        }
    }
}

/// Thread-safe, append-only event log
#[derive(Clone)]
pub struct EventLog {
    events: Arc<RwLock<Vec<Event>>>,
    start_time: Instant,
    next_id: Arc<AtomicU64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            start_time: Instant::now(),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Emit an event (thread-safe, returns event ID)
    pub fn emit(&self, kind: EventKind) -> u64 {
        // Id allocation and push happen under the write lock so ids stay
        // ordered in the vector even with concurrent emitters.
        let mut events = self.events.write();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        events.push(Event {
            id,
            timestamp_ms: self.start_time.elapsed().as_millis() as u64,
            kind,
        });
        id
    }

    /// Get all events (cloned - use `with_events` for zero-copy access)
    pub fn events(&self) -> Vec<Event> {
        self.events.read().clone()
    }

    /// Zero-copy access to events via callback
    ///
    /// Holds read lock for duration of callback - keep it short.
    pub fn with_events<T>(&self, f: impl FnOnce(&[Event]) -> T) -> T {
        f(&self.events.read())
    }

    /// Events concerning one line (line and node events)
    pub fn filter_line(&self, line: usize) -> Vec<Event> {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.line() == Some(line))
                .cloned()
                .collect()
        })
    }

    /// Count events for a specific node (no allocation)
    pub fn count_node(&self, node: &str) -> usize {
        self.with_events(|events| {
            events
                .iter()
                .filter(|e| e.kind.node() == Some(node))
                .count()
        })
    }

    /// Serialize to JSON for persistence/debugging
    pub fn to_json(&self) -> Value {
        self.with_events(|events| serde_json::to_value(events).unwrap_or(Value::Null))
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLog")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(line: usize, node: &str) -> EventKind {
        EventKind::NodeCompleted {
            line: Some(line),
            node: Arc::from(node),
            duration_ms: 5,
        }
    }

    #[test]
    fn emit_assigns_monotonic_ids() {
        let log = EventLog::new();
        let a = log.emit(EventKind::BatchStarted {
            run_id: "r".into(),
            total_lines: 2,
        });
        let b = log.emit(completed(0, "grade"));
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn count_by_node_and_filter_by_line() {
        let log = EventLog::new();
        log.emit(completed(0, "grade"));
        log.emit(completed(1, "grade"));
        log.emit(completed(0, "summarize"));

        assert_eq!(log.count_node("grade"), 2);
        assert_eq!(log.count_node("summarize"), 1);
        assert_eq!(log.filter_line(0).len(), 2);
    }

    #[test]
    fn kind_serializes_with_type_tag() {
        let json = serde_json::to_value(EventKind::NodeBypassed {
            line: Some(3),
            node: "c".into(),
            reason: "activate condition not met".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "node_bypassed");
        assert_eq!(json["node"], "c");
        assert_eq!(json["line"], 3);
    }

    #[test]
    fn clones_share_storage() {
        let log = EventLog::new();
        let clone = log.clone();
        clone.emit(EventKind::LineStarted {
            line: 0,
            run_id: "r".into(),
        });
        assert_eq!(log.len(), 1);
        assert!(!log.is_empty());
        assert!(log.to_json().is_array());
    }

    #[test]
    fn concurrent_emit_keeps_every_event() {
        let log = EventLog::new();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        log.emit(completed(i, "n"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(log.len(), 400);
        let ids: Vec<u64> = log.events().iter().map(|e| e.id).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }
}
