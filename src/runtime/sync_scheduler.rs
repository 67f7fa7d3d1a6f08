//! SyncScheduler - runs a line's DAG on a pool of OS threads
//!
//! The calling thread owns the [`DagManager`]; workers only ever see a
//! [`NodeJob`] and send back a [`NodeOutcome`]. Outputs are merged into the
//! DAG after the tool returned, never from a worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::{Map, Value};
use tracing::{debug, instrument, warn};

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

/// How long the loop blocks on results before re-checking deadline and token
const WAIT_SLICE: Duration = Duration::from_millis(20);

pub struct SyncScheduler {
    concurrency: usize,
    timeout: Option<Duration>,
    recorder: Recorder,
}

impl SyncScheduler {
    /// Scheduler running at most `concurrency` nodes at once (clamped to the cap)
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

    /// Run every regular node of `plan` for one set of flow inputs
    pub fn execute(
        &self,
        plan: &FlowPlan,
        inputs: Map<String, Value>,
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome> {
        let dag = self.execute_dag(plan, plan.line_dag(inputs), ctx)?;
        Ok(ExecutionOutcome::from_dag(dag))
    }

    /// Drive `dag` to completion and hand it back
    #[instrument(name = "sync_dag", skip_all, fields(line = ?ctx.line_number()))]
    pub fn execute_dag<'p>(
        &self,
        plan: &'p FlowPlan,
        mut dag: DagManager<'p>,
        ctx: &ExecutionContext,
    ) -> Result<DagManager<'p>> {
        let deadline = self.timeout.map(|t| Instant::now() + t);
        let workers = self.concurrency.min(plan.graph().len()).max(1);
        let mut pool = WorkerPool::spawn(workers);
        let mut in_flight: FxHashMap<Arc<str>, (DateTime<Utc>, Instant)> = FxHashMap::default();

        loop {
            if let Err(e) = bypass_to_fixpoint(&mut dag, &self.recorder) {
                return Err(self.abort(pool, &mut in_flight, e));
            }

            for node in dag.pop_ready_nodes() {
                self.recorder.scheduled(&node.name);
                let job = match prepare_job(plan, &dag, &node, ctx) {
                    Ok(job) => job,
                    Err(e) => {
                        self.recorder.failed(&node.name, Utc::now(), Duration::ZERO, &e);
                        return Err(self.abort(pool, &mut in_flight, e));
                    }
                };
                in_flight.insert(Arc::clone(&job.node), (Utc::now(), Instant::now()));
                pool.submit(job);
            }

            if dag.completed() {
                break;
            }
            if in_flight.is_empty() {
                return Err(self.abort(pool, &mut in_flight, stalled(&dag)));
            }

            let first = match self.wait_first(&pool, deadline, ctx) {
                Wait::Outcome(outcome) => outcome,
                Wait::TimedOut => {
                    let timeout_ms = self.timeout.map_or(0, |t| t.as_millis() as u64);
                    return Err(self.detach(
                        pool,
                        &mut in_flight,
                        ctx,
                        FlowError::LineTimeout {
                            line: ctx.line_number().unwrap_or(0),
                            timeout_ms,
                        },
                    ));
                }
                Wait::Canceled => {
                    return Err(self.detach(
                        pool,
                        &mut in_flight,
                        ctx,
                        FlowError::Canceled {
                            reason: "line canceled".to_string(),
                        },
                    ));
                }
            };

            // Everything else that already finished goes into the same merge
            let mut finished = vec![first];
            finished.extend(pool.results.try_iter());

            if let Some(e) = settle_finished(&mut dag, &self.recorder, &mut in_flight, finished) {
                return Err(self.abort(pool, &mut in_flight, e));
            }
        }

        pool.shutdown();
        Ok(dag)
    }

    fn wait_first(&self, pool: &WorkerPool, deadline: Option<Instant>, ctx: &ExecutionContext) -> Wait {
        loop {
            if ctx.is_canceled() {
                return Wait::Canceled;
            }
            let slice = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Wait::TimedOut;
                    }
                    WAIT_SLICE.min(d - now)
                }
                None => WAIT_SLICE,
            };
            match pool.results.recv_timeout(slice) {
                Ok(outcome) => return Wait::Outcome(outcome),
                Err(RecvTimeoutError::Timeout) => continue,
                // Workers hold a sender while alive; all gone means all panicked
                Err(RecvTimeoutError::Disconnected) => return Wait::Canceled,
            }
        }
    }

    /// Stop jobs that have not started, wait for running ones, return `error`
    fn abort(
        &self,
        mut pool: WorkerPool,
        in_flight: &mut FxHashMap<Arc<str>, (DateTime<Utc>, Instant)>,
        error: FlowError,
    ) -> FlowError {
        pool.cancel.store(true, Ordering::Release);
        debug!(outstanding = in_flight.len(), %error, "draining in-flight nodes after failure");
        while !in_flight.is_empty() {
            match pool.results.recv() {
                Ok(outcome) => {
                    in_flight.remove(&outcome.node);
                    self.recorder.finished(&outcome);
                }
                Err(_) => break,
            }
        }
        pool.shutdown();
        error
    }

    /// Cancel the line and leave running jobs behind; their results are dropped
    fn detach(
        &self,
        pool: WorkerPool,
        in_flight: &mut FxHashMap<Arc<str>, (DateTime<Utc>, Instant)>,
        ctx: &ExecutionContext,
        error: FlowError,
    ) -> FlowError {
        warn!(line = ?ctx.line_number(), outstanding = in_flight.len(), %error, "abandoning running nodes");
        ctx.cancel_token().cancel();
        pool.cancel.store(true, Ordering::Release);
        for (node, (start, t0)) in in_flight.drain() {
            self.recorder.canceled(&node, start, t0.elapsed());
        }
        // Dropping the pool closes the job queue; workers exit after their current job
        drop(pool);
        error
    }
}

enum Wait {
    Outcome(NodeOutcome),
    TimedOut,
    Canceled,
}

struct WorkerPool {
    jobs: Option<Sender<NodeJob>>,
    results: Receiver<NodeOutcome>,
    cancel: Arc<AtomicBool>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    fn spawn(workers: usize) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<NodeJob>();
        let (result_tx, result_rx) = mpsc::channel();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let cancel = Arc::new(AtomicBool::new(false));

        let handles = (0..workers)
            .filter_map(|i| {
                let jobs = Arc::clone(&job_rx);
                let results = result_tx.clone();
                let cancel = Arc::clone(&cancel);
                thread::Builder::new()
                    .name(format!("flowline-node-{}", i))
                    .spawn(move || worker_loop(jobs, results, cancel))
                    .map_err(|e| warn!(error = %e, "failed to spawn node worker"))
                    .ok()
            })
            .collect();

        Self {
            jobs: Some(job_tx),
            results: result_rx,
            cancel,
            handles,
        }
    }

    fn submit(&self, job: NodeJob) {
        if let Some(jobs) = &self.jobs {
            if let Err(mpsc::SendError(job)) = jobs.send(job) {
                warn!(node = %job.node, "node pool closed before submit");
            }
        }
    }

    /// Close the queue and join idle workers
    fn shutdown(&mut self) {
        self.jobs.take();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(jobs: Arc<Mutex<Receiver<NodeJob>>>, results: Sender<NodeOutcome>, cancel: Arc<AtomicBool>) {
    let mut runtime: Option<tokio::runtime::Runtime> = None;
    loop {
        let job = jobs.lock().recv();
        let Ok(job) = job else { break };
        let outcome = run_job(job, &cancel, &mut runtime);
        if results.send(outcome).is_err() {
            break;
        }
    }
}

fn run_job(job: NodeJob, cancel: &AtomicBool, runtime: &mut Option<tokio::runtime::Runtime>) -> NodeOutcome {
    let start = Utc::now();
    if cancel.load(Ordering::Acquire) || job.ctx.is_canceled() {
        return not_started(job.node, start);
    }

    let _guard = InFlightGuard::new();
    let t0 = Instant::now();
    let NodeJob {
        node,
        callable,
        args,
        ctx,
        span,
    } = job;
    let _enter = span.enter();

    let result = match callable {
        Callable::Blocking(tool) => call_blocking(tool.as_ref(), &ctx, args),
        Callable::Async(tool) => match current_thread_runtime(runtime) {
            Ok(rt) => {
                let call = std::panic::AssertUnwindSafe(|| rt.block_on(tool.call(&ctx, args)));
                match std::panic::catch_unwind(call) {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(tool_failed(&node, e)),
                    Err(payload) => Err(FlowError::WorkerPanicked {
                        node: node.to_string(),
                        details: panic_message(payload.as_ref()),
                    }),
                }
            }
            Err(e) => Err(e),
        },
    };

    NodeOutcome {
        node,
        start,
        elapsed: t0.elapsed(),
        started: true,
        result,
    }
}

/// Async tools on a sync worker run on a per-worker current-thread runtime
fn current_thread_runtime(slot: &mut Option<tokio::runtime::Runtime>) -> Result<&tokio::runtime::Runtime> {
    if slot.is_none() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        *slot = Some(rt);
    }
    slot.as_ref().ok_or_else(|| FlowError::Canceled {
        reason: "worker runtime unavailable".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::ToolRegistry;
    use serde_json::json;

    fn plan(yaml: &str) -> FlowPlan {
        FlowPlan::from_yaml(yaml, &ToolRegistry::with_builtins()).unwrap()
    }

    fn inputs(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn runs_a_chain() {
        let plan = plan(
            r#"
inputs: { name: {} }
nodes:
  - name: greet
    tool: concat
    inputs: { left: "hello ", right: "${inputs.name}" }
  - name: shout
    tool: upper
    inputs: { text: "${greet.output}" }
"#,
        );
        let ctx = ExecutionContext::new("t");
        let outcome = SyncScheduler::new(4)
            .execute(&plan, inputs(json!({"name": "ada"})), &ctx)
            .unwrap();
        assert_eq!(outcome.completed["shout"], json!("HELLO ADA"));
    }

    #[test]
    fn runs_async_tools_on_workers() {
        let plan = plan(
            r#"
nodes:
  - name: nap
    tool: sleep
    inputs: { ms: 5, value: 7 }
"#,
        );
        let outcome = SyncScheduler::new(2)
            .execute(&plan, Map::new(), &ExecutionContext::new("t"))
            .unwrap();
        assert_eq!(outcome.completed["nap"], json!(7));
    }

    #[test]
    fn failure_drains_running_siblings() {
        let plan = plan(
            r#"
nodes:
  - name: slow
    tool: sleep_blocking
    inputs: { ms: 50, value: 1 }
  - name: boom
    tool: fail
  - name: after
    tool: echo
    inputs: { value: "${slow.output}" }
"#,
        );
        let scheduler = SyncScheduler::new(4);
        let err = scheduler
            .execute(&plan, Map::new(), &ExecutionContext::new("t"))
            .unwrap_err();
        assert_eq!(err.code(), "FLOW-031");
        // slow was running when boom failed and was waited for
        let slow = scheduler.recorder().tracker().get("slow").unwrap();
        assert_eq!(slow.status, crate::batch::Status::Completed);
        assert!(scheduler.recorder().tracker().get("after").is_none());
    }

    #[test]
    fn timeout_returns_without_waiting() {
        let plan = plan(
            r#"
nodes:
  - name: slow
    tool: sleep_blocking
    inputs: { ms: 2000 }
"#,
        );
        let started = Instant::now();
        let err = SyncScheduler::new(1)
            .with_timeout(Some(Duration::from_millis(50)))
            .execute(&plan, Map::new(), &ExecutionContext::for_line("t", 3))
            .unwrap_err();
        assert!(matches!(err, FlowError::LineTimeout { line: 3, .. }));
        assert!(started.elapsed() < Duration::from_millis(1500));
    }

    #[test]
    fn concurrency_is_clamped() {
        assert_eq!(SyncScheduler::new(0).concurrency(), 1);
        assert_eq!(SyncScheduler::new(500).concurrency(), 16);
    }
}
