//! BatchEngine - run every data row through one flow
//!
//! Lines are independent: each gets its own context, DAG manager and
//! scheduler, and a failing line never touches another. Aggregation nodes
//! run once at the end over the successful lines, in line order.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::event::{EventKind, EventLog};
use crate::runtime::{FlowPlan, LineExecutor};
use crate::store::LineStore;

use super::mapping::{apply_mapping, default_mapping, InputMapping};
use super::result::{AggregationResult, BatchResult, LineResult};
use super::writer::{JsonlOutputWriter, OutputWriter};

/// Runs one line and always reports back
#[async_trait]
pub trait LineRunner: Send + Sync {
    async fn run_line(
        &self,
        run_id: &str,
        line: usize,
        inputs: Map<String, Value>,
        batch_token: &CancellationToken,
    ) -> LineResult;
}

#[async_trait]
impl LineRunner for LineExecutor {
    async fn run_line(
        &self,
        run_id: &str,
        line: usize,
        inputs: Map<String, Value>,
        batch_token: &CancellationToken,
    ) -> LineResult {
        LineExecutor::run_line(self, run_id, line, inputs, batch_token).await
    }
}

pub struct BatchEngine {
    plan: Arc<FlowPlan>,
    config: EngineConfig,
    executor: LineExecutor,
    runner: Arc<dyn LineRunner>,
    events: EventLog,
    cancel: CancellationToken,
}

impl BatchEngine {
    pub fn new(plan: Arc<FlowPlan>, config: EngineConfig) -> Self {
        let events = EventLog::new();
        let executor = LineExecutor::new(Arc::clone(&plan), &config).with_events(events.clone());
        Self {
            runner: Arc::new(executor.clone()),
            plan,
            config,
            executor,
            events,
            cancel: CancellationToken::new(),
        }
    }

    /// Run lines through `runner` (e.g. a process pool) instead of in-process
    ///
    /// The aggregation phase always runs in-process.
    pub fn with_runner(mut self, runner: Arc<dyn LineRunner>) -> Self {
        self.runner = runner;
        self
    }

    /// Token canceling the whole batch (what interrupts trigger)
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `rows`, writing `output.jsonl` into `output_dir` when given
    ///
    /// With `raise_on_line_failure` the first failing line cancels the rest
    /// and its error is returned; otherwise failures are tolerated and
    /// summarised on the result.
    pub async fn run(
        &self,
        rows: Vec<Map<String, Value>>,
        mapping: Option<&InputMapping>,
        output_dir: Option<&Path>,
        max_lines: Option<usize>,
        raise_on_line_failure: bool,
    ) -> Result<BatchResult> {
        match output_dir {
            Some(dir) => {
                let mut writer = JsonlOutputWriter::create(dir)?;
                let result = self
                    .run_with_writer(rows, mapping, &mut writer, max_lines, raise_on_line_failure)
                    .await?;
                info!(path = %writer.path().display(), "outputs written");
                Ok(result)
            }
            None => {
                let mut sink: Vec<Map<String, Value>> = Vec::new();
                self.run_with_writer(rows, mapping, &mut sink, max_lines, raise_on_line_failure)
                    .await
            }
        }
    }

    #[instrument(name = "batch", skip_all, fields(rows = rows.len()))]
    pub async fn run_with_writer(
        &self,
        mut rows: Vec<Map<String, Value>>,
        mapping: Option<&InputMapping>,
        writer: &mut dyn OutputWriter,
        max_lines: Option<usize>,
        raise_on_line_failure: bool,
    ) -> Result<BatchResult> {
        if let Some(max) = max_lines {
            rows.truncate(max);
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let start_time = Utc::now();
        let t0 = Instant::now();
        let run_token = self.cancel.child_token();
        let store = LineStore::new();
        let total_lines = rows.len();

        info!(
            %run_id,
            total_lines,
            scheduler = %self.config.scheduler,
            thread_budget = self.config.thread_budget(),
            "batch started"
        );
        self.events.emit(EventKind::BatchStarted {
            run_id: run_id.clone(),
            total_lines,
        });

        let default = default_mapping(self.plan.flow());
        let mapping = mapping.unwrap_or(&default);
        let permits = Arc::new(Semaphore::new(self.config.effective_line_concurrency()));
        let mut tasks: JoinSet<LineResult> = JoinSet::new();
        let mut in_flight: FxHashMap<Id, (usize, Map<String, Value>)> = FxHashMap::default();

        let mut first_failure: Option<(usize, String)> = None;
        for (line, row) in rows.iter().enumerate() {
            let inputs = match apply_mapping(self.plan.flow(), mapping, row) {
                Ok(inputs) => inputs,
                Err(e) => {
                    warn!(line, error = %e, "row cannot be mapped to flow inputs");
                    store.insert(LineResult::failed(&run_id, line, row.clone(), &e));
                    if raise_on_line_failure {
                        first_failure = Some((line, e.to_string()));
                        run_token.cancel();
                        break;
                    }
                    continue;
                }
            };
            let handle = tasks.spawn(run_guarded(
                Arc::clone(&self.runner),
                Arc::clone(&permits),
                run_token.clone(),
                run_id.clone(),
                line,
                inputs.clone(),
            ));
            in_flight.insert(handle.id(), (line, inputs));
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            let result = match joined {
                Ok((id, result)) => {
                    in_flight.remove(&id);
                    result
                }
                Err(e) => match in_flight.remove(&e.id()) {
                    Some((line, inputs)) => lost_line(&run_id, line, inputs, &e),
                    None => {
                        error!(error = %e, "unknown line task ended without a result");
                        continue;
                    }
                },
            };
            if raise_on_line_failure && first_failure.is_none() && !result.is_success() {
                if let Some(error) = result.error() {
                    first_failure = Some((result.line_number, error.message.clone()));
                    run_token.cancel();
                }
            }
            store.insert(result);
        }

        let canceled = self.cancel.is_cancelled();
        let lines = store.into_sorted();

        if let Some((line, error)) = first_failure {
            self.events.emit(EventKind::BatchCompleted {
                completed_lines: lines.iter().filter(|l| l.is_success()).count(),
                failed_lines: lines.iter().filter(|l| !l.is_success()).count(),
                duration_ms: t0.elapsed().as_millis() as u64,
            });
            return Err(FlowError::LineFailed { line, error });
        }

        let aggr = if self.plan.has_aggregation() && !canceled {
            Some(self.aggregate(&run_id, &lines, &run_token).await)
        } else {
            None
        };

        for line in lines.iter().filter(|l| l.is_success()) {
            writer.append(line.line_number, &line.output)?;
        }
        writer.flush()?;

        let result = BatchResult::build(
            run_id,
            lines,
            aggr,
            start_time,
            Utc::now(),
            self.config.error_report_limit,
            canceled,
        );
        if let Some(summary) = result.summary() {
            warn!("{}", summary);
        }
        info!(
            status = ?result.status,
            completed = result.completed_lines,
            failed = result.failed_lines,
            "batch finished"
        );
        self.events.emit(EventKind::BatchCompleted {
            completed_lines: result.completed_lines,
            failed_lines: result.failed_lines,
            duration_ms: t0.elapsed().as_millis() as u64,
        });
        Ok(result)
    }

    /// Columns over successful lines, in line order
    async fn aggregate(&self, run_id: &str, lines: &[LineResult], token: &CancellationToken) -> AggregationResult {
        let succeeded: Vec<&LineResult> = lines.iter().filter(|l| l.is_success()).collect();

        let mut columns: FxHashMap<Arc<str>, Value> = FxHashMap::default();
        for source in self.plan.aggregation_sources() {
            let column = succeeded
                .iter()
                .map(|l| l.aggregation_inputs.get(source.as_ref()).cloned().unwrap_or(Value::Null))
                .collect();
            columns.insert(Arc::clone(source), Value::Array(column));
        }

        let mut inputs = Map::new();
        for name in self.plan.flow().inputs.keys() {
            let column = succeeded
                .iter()
                .map(|l| l.run_info.inputs.get(name).cloned().unwrap_or(Value::Null))
                .collect();
            inputs.insert(name.clone(), Value::Array(column));
        }

        self.executor
            .run_aggregation(run_id, succeeded.len(), inputs, columns, token)
            .await
    }
}

/// A line whose task died without reporting back
fn lost_line(run_id: &str, line: usize, inputs: Map<String, Value>, error: &JoinError) -> LineResult {
    error!(line, %error, "line task ended without a result");
    let error = if error.is_cancelled() {
        FlowError::Canceled {
            reason: "line task was aborted".to_string(),
        }
    } else {
        FlowError::WorkerPanicked {
            node: "<line>".to_string(),
            details: error.to_string(),
        }
    };
    LineResult::failed(run_id, line, inputs, &error)
}

/// One line task: waits for a line slot, never panics through
async fn run_guarded(
    runner: Arc<dyn LineRunner>,
    permits: Arc<Semaphore>,
    token: CancellationToken,
    run_id: String,
    line: usize,
    inputs: Map<String, Value>,
) -> LineResult {
    let canceled = || FlowError::Canceled {
        reason: "batch canceled before the line started".to_string(),
    };
    let _permit = tokio::select! {
        biased;
        _ = token.cancelled() => return LineResult::failed(&run_id, line, inputs, &canceled()),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return LineResult::failed(&run_id, line, inputs, &canceled()),
        },
    };

    let call = AssertUnwindSafe(runner.run_line(&run_id, line, inputs.clone(), &token))
        .catch_unwind()
        .await;
    match call {
        Ok(result) => result,
        Err(payload) => {
            let details = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            LineResult::failed(
                &run_id,
                line,
                inputs,
                &FlowError::WorkerPanicked {
                    node: "<line>".to_string(),
                    details,
                },
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Status;
    use crate::error::ErrorCategory;
    use crate::tool::ToolRegistry;
    use serde_json::json;

    /// Panics on odd lines, echoes the inputs otherwise
    struct Flaky;

    #[async_trait]
    impl LineRunner for Flaky {
        async fn run_line(
            &self,
            run_id: &str,
            line: usize,
            inputs: Map<String, Value>,
            _batch_token: &CancellationToken,
        ) -> LineResult {
            if line % 2 == 1 {
                panic!("line {} blew up", line);
            }
            let mut result = LineResult::failed(run_id, line, inputs.clone(), &FlowError::Canceled {
                reason: "placeholder".to_string(),
            });
            result.run_info.status = Status::Completed;
            result.run_info.error = None;
            result.output = inputs;
            result
        }
    }

    fn plan() -> Arc<FlowPlan> {
        let plan = FlowPlan::from_yaml(
            r#"
inputs: { q: {} }
outputs: { q: "${inputs.q}" }
nodes:
  - { name: a, tool: echo, inputs: { value: "${inputs.q}" } }
"#,
            &ToolRegistry::with_builtins(),
        )
        .unwrap();
        Arc::new(plan)
    }

    #[tokio::test]
    async fn panicking_runner_fails_only_its_line() {
        let engine = BatchEngine::new(plan(), EngineConfig::default()).with_runner(Arc::new(Flaky));
        let rows: Vec<Map<String, Value>> = (0..3)
            .map(|i| json!({ "q": i }).as_object().cloned().unwrap())
            .collect();

        let result = engine.run(rows, None, None, None, false).await.unwrap();

        assert_eq!(result.line_results.len(), 3);
        assert_eq!(result.failed_line_numbers(), vec![1]);
        let error = result.line_results[1].error().unwrap();
        assert_eq!(error.code, "FLOW-052");
        assert_eq!(error.category, ErrorCategory::System);
    }

    #[tokio::test]
    async fn lost_line_task_is_recorded_as_failed() {
        let task = tokio::spawn(async { std::future::pending::<()>().await });
        task.abort();
        let aborted = task.await.unwrap_err();
        let result = lost_line("run", 4, Map::new(), &aborted);
        assert_eq!(result.line_number, 4);
        assert_eq!(result.run_info.status, Status::Canceled);

        let task = tokio::spawn(async {
            panic!("gone");
        });
        let panicked = task.await.unwrap_err();
        let result = lost_line("run", 5, Map::new(), &panicked);
        assert_eq!(result.run_info.status, Status::Failed);
        assert_eq!(result.error().unwrap().code, "FLOW-052");
    }
}
