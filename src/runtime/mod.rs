//! Runtime Module - flow execution
//!
//! - `plan`: validated flow + resolved tools, shared by every line
//! - `sync_scheduler`: thread-pool executor
//! - `async_scheduler`: tokio executor
//! - `line`: one line (or the aggregation phase) end to end
//! - `interrupt`: SIGINT/SIGTERM handling and the force-exit monitor
//!
//! The static structure lives in `ast` and `dag`; this module is the "how".

mod async_scheduler;
mod context;
pub mod interrupt;
mod line;
mod node;
mod plan;
mod sync_scheduler;

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::binding::Bypass;
use crate::dag::DagManager;

pub use async_scheduler::AsyncScheduler;
pub use context::ExecutionContext;
pub use line::LineExecutor;
pub use node::Recorder;
pub use plan::FlowPlan;
pub use sync_scheduler::SyncScheduler;

/// Final state of a line run by a scheduler
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub completed: FxHashMap<Arc<str>, Value>,
    pub bypassed: FxHashMap<Arc<str>, Bypass>,
}

impl ExecutionOutcome {
    pub(crate) fn from_dag(dag: DagManager<'_>) -> Self {
        let (completed, bypassed) = dag.into_parts();
        Self { completed, bypassed }
    }

    pub fn is_bypassed(&self, node: &str) -> bool {
        self.bypassed.contains_key(node)
    }
}
