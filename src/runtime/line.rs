//! LineExecutor - one line (or the aggregation phase) end to end
//!
//! Picks the configured scheduler, resolves flow outputs, collects what the
//! aggregation phase needs from the line, and always produces a record:
//! failures end up on the returned [`LineResult`], never as an `Err`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn, Span};

use crate::ast::InputAssignment;
use crate::batch::{AggregationResult, ErrorInfo, FlowRunInfo, LineResult, Status};
use crate::binding::resolve;
use crate::config::{EngineConfig, SchedulerMode};
use crate::dag::DagManager;
use crate::error::{FlowError, Result};
use crate::event::{EventKind, EventLog};

use super::async_scheduler::AsyncScheduler;
use super::context::ExecutionContext;
use super::node::Recorder;
use super::plan::FlowPlan;
use super::sync_scheduler::SyncScheduler;

/// Which nodes a run covers
enum Phase {
    Line(Map<String, Value>),
    Aggregation {
        inputs: Map<String, Value>,
        columns: FxHashMap<Arc<str>, Value>,
    },
}

impl Phase {
    fn is_aggregation(&self) -> bool {
        matches!(self, Self::Aggregation { .. })
    }

    fn into_dag(self, plan: &FlowPlan) -> DagManager<'_> {
        match self {
            Self::Line(inputs) => plan.line_dag(inputs),
            Self::Aggregation { inputs, columns } => plan.aggregation_dag(inputs, columns),
        }
    }
}

/// Outputs harvested from a finished DAG
#[derive(Default)]
struct Harvest {
    output: Map<String, Value>,
    aggregation_inputs: Map<String, Value>,
}

#[derive(Clone)]
pub struct LineExecutor {
    plan: Arc<FlowPlan>,
    scheduler: SchedulerMode,
    node_concurrency: usize,
    timeout: Option<Duration>,
    events: Option<EventLog>,
}

impl LineExecutor {
    pub fn new(plan: Arc<FlowPlan>, config: &EngineConfig) -> Self {
        Self {
            plan,
            scheduler: config.scheduler,
            node_concurrency: config.effective_node_concurrency(),
            timeout: config.line_timeout(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = Some(events);
        self
    }

    pub fn plan(&self) -> &Arc<FlowPlan> {
        &self.plan
    }

    pub fn events(&self) -> Option<&EventLog> {
        self.events.as_ref()
    }

    fn emit(&self, kind: EventKind) {
        if let Some(events) = &self.events {
            events.emit(kind);
        }
    }

    /// Run one line; the line token is a child of `batch_token`
    #[instrument(name = "line", skip_all, fields(run_id = %run_id, line = line))]
    pub async fn run_line(
        &self,
        run_id: &str,
        line: usize,
        inputs: Map<String, Value>,
        batch_token: &CancellationToken,
    ) -> LineResult {
        let ctx = ExecutionContext::for_line(run_id, line).with_cancel(batch_token.child_token());
        let recorder = Recorder::new(Some(line), self.events.clone());
        let start_time = Utc::now();
        let t0 = Instant::now();
        self.emit(EventKind::LineStarted {
            line,
            run_id: run_id.to_string(),
        });

        let outcome = self
            .run_phase(Phase::Line(inputs.clone()), &ctx, recorder.clone())
            .await;
        let duration_ms = t0.elapsed().as_millis() as u64;

        let (harvest, status, error) = match outcome {
            Ok(harvest) => {
                info!(line, duration_ms, "line completed");
                self.emit(EventKind::LineCompleted { line, duration_ms });
                (harvest, Status::Completed, None)
            }
            Err(e) => {
                warn!(line, error = %e, recoverable = e.is_recoverable(), "line failed");
                self.emit(EventKind::LineFailed {
                    line,
                    error: e.to_string(),
                });
                (Harvest::default(), failure_status(&e), Some(ErrorInfo::from(&e)))
            }
        };

        LineResult {
            line_number: line,
            output: harvest.output,
            aggregation_inputs: harvest.aggregation_inputs,
            node_run_infos: recorder.tracker().snapshot(),
            run_info: FlowRunInfo {
                run_id: run_id.to_string(),
                line_number: Some(line),
                status,
                inputs,
                start_time,
                end_time: Utc::now(),
                duration_ms,
                error,
            },
        }
    }

    /// Run the aggregation nodes once over columnar line data
    ///
    /// `inputs` maps each flow input to the list of its per-line values,
    /// `columns` each aggregated regular node to its per-line outputs.
    #[instrument(name = "aggregation", skip_all, fields(run_id = %run_id, lines = lines))]
    pub async fn run_aggregation(
        &self,
        run_id: &str,
        lines: usize,
        inputs: Map<String, Value>,
        columns: FxHashMap<Arc<str>, Value>,
        batch_token: &CancellationToken,
    ) -> AggregationResult {
        let ctx = ExecutionContext::new(run_id).with_cancel(batch_token.child_token());
        let recorder = Recorder::new(None, self.events.clone());
        let start_time = Utc::now();
        let t0 = Instant::now();
        self.emit(EventKind::AggregationStarted {
            nodes: self
                .plan
                .flow()
                .aggregation_nodes()
                .map(|n| Arc::clone(&n.name))
                .collect(),
            lines,
        });

        let outcome = self
            .run_phase(
                Phase::Aggregation {
                    inputs: inputs.clone(),
                    columns,
                },
                &ctx,
                recorder.clone(),
            )
            .await;
        let duration_ms = t0.elapsed().as_millis() as u64;
        self.emit(EventKind::AggregationCompleted {
            success: outcome.is_ok(),
            duration_ms,
        });

        let (output, status, error) = match outcome {
            Ok(harvest) => (harvest.output, Status::Completed, None),
            Err(e) => {
                warn!(error = %e, "aggregation failed");
                let wrapped = FlowError::AggregationFailed {
                    reason: e.to_string(),
                };
                let mut info = ErrorInfo::from(&e);
                info.message = wrapped.to_string();
                (Map::new(), failure_status(&e), Some(info))
            }
        };

        AggregationResult {
            output,
            node_run_infos: recorder.tracker().snapshot(),
            run_info: FlowRunInfo {
                run_id: run_id.to_string(),
                line_number: None,
                status,
                inputs,
                start_time,
                end_time: Utc::now(),
                duration_ms,
                error,
            },
        }
    }

    async fn run_phase(&self, phase: Phase, ctx: &ExecutionContext, recorder: Recorder) -> Result<Harvest> {
        let aggregation = phase.is_aggregation();
        match self.scheduler {
            SchedulerMode::Async => {
                let scheduler = AsyncScheduler::new(self.node_concurrency)
                    .with_timeout(self.timeout)
                    .with_recorder(recorder);
                let dag = scheduler.execute_dag(&self.plan, phase.into_dag(&self.plan), ctx).await?;
                harvest(&self.plan, &dag, aggregation)
            }
            SchedulerMode::Sync => {
                let scheduler = SyncScheduler::new(self.node_concurrency)
                    .with_timeout(self.timeout)
                    .with_recorder(recorder);
                let plan = Arc::clone(&self.plan);
                let ctx = ctx.clone();
                let span = Span::current();
                tokio::task::spawn_blocking(move || {
                    let _enter = span.enter();
                    let dag = scheduler.execute_dag(&plan, phase.into_dag(&plan), &ctx)?;
                    harvest(&plan, &dag, aggregation)
                })
                .await
                .map_err(|e| FlowError::WorkerPanicked {
                    node: "<scheduler>".to_string(),
                    details: e.to_string(),
                })?
            }
        }
    }
}

fn failure_status(error: &FlowError) -> Status {
    match error {
        FlowError::Canceled { .. } => Status::Canceled,
        _ => Status::Failed,
    }
}

/// True when a flow output belongs to the aggregation phase
fn reads_aggregation(plan: &FlowPlan, assignment: &InputAssignment) -> bool {
    assignment
        .node_ref()
        .and_then(|n| plan.flow().node(n))
        .is_some_and(|n| n.aggregation)
}

fn harvest(plan: &FlowPlan, dag: &DagManager<'_>, aggregation: bool) -> Result<Harvest> {
    let scope = dag.resolve_scope();
    let mut output = Map::new();
    for (name, assignment) in &plan.flow().outputs {
        if reads_aggregation(plan, assignment) != aggregation {
            continue;
        }
        output.insert(name.clone(), resolve(assignment, &scope)?.into_value());
    }

    let mut aggregation_inputs = Map::new();
    if !aggregation {
        for source in plan.aggregation_sources() {
            // bypassed sources contribute null
            let value = dag
                .completed_outputs()
                .get(source)
                .cloned()
                .unwrap_or(Value::Null);
            aggregation_inputs.insert(source.to_string(), value);
        }
    }

    Ok(Harvest {
        output,
        aggregation_inputs,
    })
}
