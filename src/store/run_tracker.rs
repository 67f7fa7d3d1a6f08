//! RunTracker - node run infos recorded as nodes finish
//!
//! Schedulers record into the tracker from worker threads the moment a node
//! finishes, so run infos of nodes that completed before a sibling failed
//! survive into the line result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;

use crate::batch::{ErrorInfo, NodeRunInfo, Status, Usage};
use crate::binding::BypassReason;
use crate::error::FlowError;

/// Thread-safe node run-info storage (cheap to clone)
#[derive(Clone, Default)]
pub struct RunTracker {
    line_number: Option<usize>,
    infos: Arc<DashMap<Arc<str>, NodeRunInfo>>,
}

impl RunTracker {
    pub fn new(line_number: Option<usize>) -> Self {
        Self {
            line_number,
            infos: Arc::new(DashMap::new()),
        }
    }

    fn record(&self, node: &Arc<str>, status: Status, start: DateTime<Utc>, elapsed: Duration) -> NodeRunInfo {
        NodeRunInfo {
            node: node.to_string(),
            line_number: self.line_number,
            status,
            start_time: start,
            end_time: Utc::now(),
            duration_ms: elapsed.as_millis() as u64,
            error: None,
            bypass_reason: None,
            usage: None,
        }
    }

    pub fn completed(&self, node: &Arc<str>, start: DateTime<Utc>, elapsed: Duration, output: &Value) {
        let mut info = self.record(node, Status::Completed, start, elapsed);
        info.usage = Usage::from_output(output);
        self.infos.insert(Arc::clone(node), info);
    }

    pub fn failed(&self, node: &Arc<str>, start: DateTime<Utc>, elapsed: Duration, error: &FlowError) {
        let mut info = self.record(node, Status::Failed, start, elapsed);
        info.error = Some(ErrorInfo::from(error));
        self.infos.insert(Arc::clone(node), info);
    }

    /// Node whose result was discarded (line canceled or timed out)
    pub fn canceled(&self, node: &Arc<str>, start: DateTime<Utc>, elapsed: Duration) {
        let info = self.record(node, Status::Canceled, start, elapsed);
        self.infos.insert(Arc::clone(node), info);
    }

    pub fn bypassed(&self, node: &Arc<str>, reason: &BypassReason) {
        let mut info = self.record(node, Status::Bypassed, Utc::now(), Duration::ZERO);
        info.bypass_reason = Some(reason.to_string());
        self.infos.insert(Arc::clone(node), info);
    }

    pub fn get(&self, node: &str) -> Option<NodeRunInfo> {
        self.infos.get(node).map(|r| r.value().clone())
    }

    pub fn status(&self, node: &str) -> Option<Status> {
        self.infos.get(node).map(|r| r.status)
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Snapshot sorted by node name
    pub fn snapshot(&self) -> BTreeMap<String, NodeRunInfo> {
        self.infos
            .iter()
            .map(|entry| (entry.key().to_string(), entry.value().clone()))
            .collect()
    }
}
