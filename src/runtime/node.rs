//! Node jobs - what both schedulers hand to their workers
//!
//! - `prepare_job`: resolve inputs, bind them to the tool signature
//! - `call_blocking`: run a blocking tool, turning panics into errors
//! - `Recorder`: events + run infos for node lifecycle transitions

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{debug, info, Span};

use crate::ast::Node;
use crate::binding::BypassReason;
use crate::dag::DagManager;
use crate::error::{FlowError, Result, ToolError};
use crate::event::{EventKind, EventLog};
use crate::store::RunTracker;
use crate::tool::{Args, Callable, Tool};

use super::context::ExecutionContext;
use super::plan::FlowPlan;

/// A node ready to run: callable, bound arguments, its own context copy
pub(crate) struct NodeJob {
    pub node: Arc<str>,
    pub callable: Callable,
    pub args: Args,
    pub ctx: ExecutionContext,
    /// Created on the submitting thread, re-entered by the worker
    pub span: Span,
}

/// What came back from a worker
pub(crate) struct NodeOutcome {
    pub node: Arc<str>,
    pub start: DateTime<Utc>,
    pub elapsed: Duration,
    /// `false` when the job was dropped before it started
    pub started: bool,
    pub result: Result<Value>,
}

pub(crate) fn prepare_job(
    plan: &FlowPlan,
    dag: &DagManager<'_>,
    node: &Node,
    ctx: &ExecutionContext,
) -> Result<NodeJob> {
    let tool = plan.tool(&node.name)?;
    let inputs = dag.get_node_valid_inputs(node, &tool.signature)?;
    let args = tool
        .signature
        .bind(inputs)
        .map_err(|reason| FlowError::InvalidArguments {
            node: node.name.to_string(),
            reason,
        })?;

    let ctx = ctx.for_node(&node.name);
    Ok(NodeJob {
        node: Arc::clone(&node.name),
        callable: tool.callable.clone(),
        args,
        span: ctx.span(),
        ctx,
    })
}

/// Bypass and skip nodes until neither pops anything
///
/// Returns the number of nodes settled without running.
pub(crate) fn bypass_to_fixpoint(dag: &mut DagManager<'_>, recorder: &Recorder) -> Result<usize> {
    let mut total = 0;
    loop {
        let bypassed = dag.pop_bypassable_nodes()?;
        for (node, reason) in &bypassed {
            recorder.bypassed(&node.name, reason);
        }
        let skipped = dag.pop_skipped_nodes()?;
        for (node, value) in &skipped {
            recorder.skipped(&node.name, value);
        }
        if bypassed.is_empty() && skipped.is_empty() {
            return Ok(total);
        }
        total += bypassed.len() + skipped.len();
    }
}

/// Record finished nodes and merge their outputs into the DAG
///
/// Returns the first error, a tool failure ahead of a merge failure. The
/// caller still owns whatever is in flight and must drain it.
pub(crate) fn settle_finished<V>(
    dag: &mut DagManager<'_>,
    recorder: &Recorder,
    in_flight: &mut FxHashMap<Arc<str>, V>,
    finished: Vec<NodeOutcome>,
) -> Option<FlowError> {
    let mut outputs = Vec::with_capacity(finished.len());
    let mut failure = None;
    for outcome in finished {
        in_flight.remove(&outcome.node);
        recorder.finished(&outcome);
        match outcome.result {
            Ok(value) => outputs.push((outcome.node, value)),
            Err(e) if failure.is_none() => failure = Some(e),
            Err(_) => {}
        }
    }
    match dag.complete_nodes(outputs) {
        Ok(()) => failure,
        Err(e) => failure.or(Some(e)),
    }
}

pub(crate) fn stalled(dag: &DagManager<'_>) -> FlowError {
    let pending: Vec<String> = dag.pending_names().iter().map(|n| n.to_string()).collect();
    FlowError::StalledGraph {
        pending: format!("[{}]", pending.join(", ")),
    }
}

pub(crate) fn not_started(node: Arc<str>, start: DateTime<Utc>) -> NodeOutcome {
    NodeOutcome {
        node,
        start,
        elapsed: Duration::ZERO,
        started: false,
        result: Err(FlowError::Canceled {
            reason: "line aborted before the node started".to_string(),
        }),
    }
}

pub(crate) fn tool_failed(node: &str, error: ToolError) -> FlowError {
    FlowError::ToolFailed {
        node: node.to_string(),
        error,
    }
}

/// Call a blocking tool; a panic becomes `WorkerPanicked`
pub(crate) fn call_blocking(tool: &dyn Tool, ctx: &ExecutionContext, args: Args) -> Result<Value> {
    match panic::catch_unwind(AssertUnwindSafe(|| tool.call(ctx, args))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(tool_failed(ctx.node_name(), error)),
        Err(payload) => Err(FlowError::WorkerPanicked {
            node: ctx.node_name().to_string(),
            details: panic_message(payload.as_ref()),
        }),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Emits events and records run infos for node transitions
#[derive(Clone, Default)]
pub struct Recorder {
    line: Option<usize>,
    events: Option<EventLog>,
    tracker: RunTracker,
}

impl Recorder {
    pub fn new(line: Option<usize>, events: Option<EventLog>) -> Self {
        Self {
            line,
            events,
            tracker: RunTracker::new(line),
        }
    }

    pub fn tracker(&self) -> &RunTracker {
        &self.tracker
    }

    fn emit(&self, kind: impl FnOnce() -> EventKind) {
        if let Some(events) = &self.events {
            events.emit(kind());
        }
    }

    pub(crate) fn scheduled(&self, node: &Arc<str>) {
        debug!(line = ?self.line, node = %node, "node scheduled");
        self.emit(|| EventKind::NodeScheduled {
            line: self.line,
            node: Arc::clone(node),
        });
    }

    pub(crate) fn bypassed(&self, node: &Arc<str>, reason: &BypassReason) {
        info!(line = ?self.line, node = %node, %reason, "node bypassed");
        self.tracker.bypassed(node, reason);
        self.emit(|| EventKind::NodeBypassed {
            line: self.line,
            node: Arc::clone(node),
            reason: reason.to_string(),
        });
    }

    /// Skipped node: completed with its `return` value, never run
    pub(crate) fn skipped(&self, node: &Arc<str>, value: &Value) {
        info!(line = ?self.line, node = %node, "node skipped");
        self.tracker.completed(node, Utc::now(), Duration::ZERO, value);
        self.emit(|| EventKind::NodeCompleted {
            line: self.line,
            node: Arc::clone(node),
            duration_ms: 0,
        });
    }

    /// Record a finished outcome; completed outputs are not merged here
    pub(crate) fn finished(&self, outcome: &NodeOutcome) {
        match &outcome.result {
            Ok(output) => {
                debug!(line = ?self.line, node = %outcome.node, ms = outcome.elapsed.as_millis() as u64, "node completed");
                self.tracker
                    .completed(&outcome.node, outcome.start, outcome.elapsed, output);
                self.emit(|| EventKind::NodeCompleted {
                    line: self.line,
                    node: Arc::clone(&outcome.node),
                    duration_ms: outcome.elapsed.as_millis() as u64,
                });
            }
            Err(FlowError::Canceled { .. }) => self.canceled(&outcome.node, outcome.start, outcome.elapsed),
            Err(error) => self.failed(&outcome.node, outcome.start, outcome.elapsed, error),
        }
    }

    pub(crate) fn failed(&self, node: &Arc<str>, start: DateTime<Utc>, elapsed: Duration, error: &FlowError) {
        tracing::error!(line = ?self.line, node = %node, %error, "node failed");
        self.tracker.failed(node, start, elapsed, error);
        self.emit(|| EventKind::NodeFailed {
            line: self.line,
            node: Arc::clone(node),
            error: error.to_string(),
        });
    }

    pub(crate) fn canceled(&self, node: &Arc<str>, start: DateTime<Utc>, elapsed: Duration) {
        debug!(line = ?self.line, node = %node, "node canceled");
        self.tracker.canceled(node, start, elapsed);
    }
}
