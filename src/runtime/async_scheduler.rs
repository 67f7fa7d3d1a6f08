//! AsyncScheduler - runs a line's DAG on the tokio runtime
//!
//! Same loop as [`SyncScheduler`](super::SyncScheduler): bypass, submit
//! ready nodes, wait for the first finished task, merge. Async tools are
//! awaited in place; blocking tools go to the blocking pool. A semaphore
//! bounds both kinds together.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn, Instrument};

use crate::config::clamp_concurrency;
use crate::dag::DagManager;
use crate::error::{FlowError, Result};
use crate::tool::Callable;

use super::context::ExecutionContext;
use super::interrupt::InFlightGuard;
use super::node::{
    bypass_to_fixpoint, call_blocking, not_started, panic_message, prepare_job, settle_finished, stalled,
    tool_failed, NodeJob, NodeOutcome, Recorder,
};
use super::plan::FlowPlan;
use super::ExecutionOutcome;

pub struct AsyncScheduler {
    concurrency: usize,
    timeout: Option<Duration>,
    recorder: Recorder,
}

enum Wait {
    Joined(NodeOutcome),
    TimedOut,
    Canceled,
}

type InFlight = FxHashMap<Arc<str>, (DateTime<Utc>, Instant)>;

impl AsyncScheduler {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: clamp_concurrency(concurrency),
            timeout: None,
            recorder: Recorder::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_recorder(mut self, recorder: Recorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub async fn execute(
        &self,
        plan: &FlowPlan,
        inputs: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let dag = self.execute_dag(plan, plan.line_dag(inputs), ctx).await?;
        Ok(ExecutionOutcome::from_dag(dag))
    }

    #[instrument(name = "async_dag", skip_all, fields(line = ?ctx.line_number()))]
    pub async fn execute_dag<'p>(
        &self,
        plan: &'p FlowPlan,
        mut dag: DagManager<'p>,
        ctx: &ExecutionContext,
    ) -> Result<DagManager<'p>> {
        let deadline = self.timeout.map(|t| tokio::time::Instant::now() + t);
        let permits = Arc::new(Semaphore::new(self.concurrency));
        // Not-yet-started tasks give up when this is canceled
        let local = ctx.cancel_token().child_token();
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();
        let mut in_flight = InFlight::default();

        loop {
            if let Err(e) = bypass_to_fixpoint(&mut dag, &self.recorder) {
                return Err(self.drain(tasks, &local, &mut in_flight, e).await);
            }

            for node in dag.pop_ready_nodes() {
                self.recorder.scheduled(&node.name);
                let job = match prepare_job(plan, &dag, &node, ctx) {
                    Ok(job) => job,
                    Err(e) => {
                        self.recorder.failed(&node.name, Utc::now(), Duration::ZERO, &e);
                        return Err(self.drain(tasks, &local, &mut in_flight, e).await);
                    }
                };
                in_flight.insert(Arc::clone(&job.node), (Utc::now(), Instant::now()));
                tasks.spawn(run_task(job, Arc::clone(&permits), local.clone()));
            }

            if dag.completed() {
                break;
            }
            if tasks.is_empty() {
                return Err(stalled(&dag));
            }

            let first = match next_finished(&mut tasks, deadline, ctx.cancel_token()).await {
                Wait::Joined(outcome) => outcome,
                Wait::TimedOut => {
                    let timeout_ms = self.timeout.map_or(0, |t| t.as_millis() as u64);
                    return Err(self.abandon(
                        tasks,
                        &local,
                        &mut in_flight,
                        ctx,
                        FlowError::LineTimeout {
                            line: ctx.line_number().unwrap_or(0),
                            timeout_ms,
                        },
                    ));
                }
                Wait::Canceled => {
                    return Err(self.abandon(
                        tasks,
                        &local,
                        &mut in_flight,
                        ctx,
                        FlowError::Canceled {
                            reason: "line canceled".to_string(),
                        },
                    ));
                }
            };

            let mut finished = vec![first];
            while let Some(joined) = tasks.try_join_next() {
                finished.extend(joined_outcome(joined));
            }

            if let Some(e) = settle_finished(&mut dag, &self.recorder, &mut in_flight, finished) {
                return Err(self.drain(tasks, &local, &mut in_flight, e).await);
            }
        }

        Ok(dag)
    }

    /// Stop tasks waiting for a permit, wait for running ones, return `error`
    async fn drain(
        &self,
        mut tasks: JoinSet<NodeOutcome>,
        local: &CancellationToken,
        in_flight: &mut InFlight,
        error: FlowError,
    ) -> FlowError {
        local.cancel();
        debug!(outstanding = tasks.len(), %error, "draining in-flight nodes after failure");
        while let Some(joined) = tasks.join_next().await {
            if let Some(outcome) = joined_outcome(joined) {
                in_flight.remove(&outcome.node);
                self.recorder.finished(&outcome);
            }
        }
        error
    }

    /// Abort everything outstanding without waiting
    fn abandon(
        &self,
        mut tasks: JoinSet<NodeOutcome>,
        local: &CancellationToken,
        in_flight: &mut InFlight,
        ctx: &ExecutionContext,
        error: FlowError,
    ) -> FlowError {
        warn!(line = ?ctx.line_number(), outstanding = in_flight.len(), %error, "abandoning running nodes");
        ctx.cancel_token().cancel();
        local.cancel();
        tasks.abort_all();
        for (node, (start, t0)) in in_flight.drain() {
            self.recorder.canceled(&node, start, t0.elapsed());
        }
        drop(tasks);
        error
    }
}

async fn next_finished(
    tasks: &mut JoinSet<NodeOutcome>,
    deadline: Option<tokio::time::Instant>,
    cancel: &CancellationToken,
) -> Wait {
    loop {
        let joined = async {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, tasks.join_next()).await.ok(),
                None => Some(tasks.join_next().await),
            }
        };

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Wait::Canceled,
            next = joined => next,
        };

        match next {
            None => return Wait::TimedOut,
            Some(Some(joined)) => {
                if let Some(outcome) = joined_outcome(joined) {
                    return Wait::Joined(outcome);
                }
            }
            // Only reachable with an empty set, which the caller rules out
            Some(None) => return Wait::Canceled,
        }
    }
}

/// run_task catches panics itself; a JoinError here is an abort
fn joined_outcome(joined: std::result::Result<NodeOutcome, tokio::task::JoinError>) -> Option<NodeOutcome> {
    match joined {
        Ok(outcome) => Some(outcome),
        Err(e) => {
            warn!(error = %e, "node task ended without an outcome");
            None
        }
    }
}

async fn run_task(job: NodeJob, permits: Arc<Semaphore>, cancel: CancellationToken) -> NodeOutcome {
    let start = Utc::now();
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return not_started(job.node, start),
        permit = permits.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return not_started(job.node, start),
        },
    };

    let t0 = Instant::now();
    let NodeJob {
        node,
        callable,
        args,
        ctx,
        span,
    } = job;

    let result = match callable {
        Callable::Blocking(tool) => {
            let blocking_span = span.clone();
            let handle = tokio::task::spawn_blocking(move || {
                let _guard = InFlightGuard::new();
                let _enter = blocking_span.enter();
                call_blocking(tool.as_ref(), &ctx, args)
            });
            match handle.await {
                Ok(result) => result,
                Err(e) => Err(FlowError::WorkerPanicked {
                    node: node.to_string(),
                    details: e.to_string(),
                }),
            }
        }
        Callable::Async(tool) => {
            let _guard = InFlightGuard::new();
            let call = AssertUnwindSafe(async move { tool.call(&ctx, args).await })
                .catch_unwind()
                .instrument(span)
                .await;
            match call {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(tool_failed(&node, e)),
                Err(payload) => Err(FlowError::WorkerPanicked {
                    node: node.to_string(),
                    details: panic_message(payload.as_ref()),
                }),
            }
        }
    };

    NodeOutcome {
        node,
        start,
        elapsed: t0.elapsed(),
        started: true,
        result,
    }
}
