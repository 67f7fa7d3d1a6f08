//! LineStore - finished line results collected from concurrent line tasks

use std::sync::Arc;

use dashmap::DashMap;

use crate::batch::LineResult;

#[derive(Clone, Default)]
pub struct LineStore {
    lines: Arc<DashMap<usize, LineResult>>,
}

impl LineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a line result; a later result for the same line replaces it
    pub fn insert(&self, result: LineResult) {
        self.lines.insert(result.line_number, result);
    }

    pub fn contains(&self, line_number: usize) -> bool {
        self.lines.contains_key(&line_number)
    }

    pub fn get(&self, line_number: usize) -> Option<LineResult> {
        self.lines.get(&line_number).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.lines.iter().filter(|r| !r.value().is_success()).count()
    }

    /// Drain into a vector sorted by line number
    pub fn into_sorted(self) -> Vec<LineResult> {
        let mut lines: Vec<LineResult> = match Arc::try_unwrap(self.lines) {
            Ok(map) => map.into_iter().map(|(_, v)| v).collect(),
            Err(shared) => shared.iter().map(|r| r.value().clone()).collect(),
        };
        lines.sort_by_key(|l| l.line_number);
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{FlowRunInfo, Status};
    use chrono::Utc;
    use serde_json::Map;
    use std::collections::BTreeMap;

    fn result(n: usize, status: Status) -> LineResult {
        let now = Utc::now();
        LineResult {
            line_number: n,
            output: Map::new(),
            aggregation_inputs: Map::new(),
            node_run_infos: BTreeMap::new(),
            run_info: FlowRunInfo {
                run_id: "r".into(),
                line_number: Some(n),
                status,
                inputs: Map::new(),
                start_time: now,
                end_time: now,
                duration_ms: 0,
                error: None,
            },
        }
    }

    #[test]
    fn sorted_drain_from_concurrent_inserts() {
        let store = LineStore::new();
        let handles: Vec<_> = (0..6)
            .rev()
            .map(|n| {
                let store = store.clone();
                std::thread::spawn(move || {
                    let status = if n == 3 { Status::Failed } else { Status::Completed };
                    store.insert(result(n, status));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.len(), 6);
        assert_eq!(store.failed_count(), 1);
        assert!(store.contains(5));
        let lines = store.into_sorted();
        let numbers: Vec<usize> = lines.iter().map(|l| l.line_number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
    }
}
