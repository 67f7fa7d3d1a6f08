//! ProcessPool - lines executed in `flowline worker` child processes
//!
//! Protocol, one JSON document per line in each direction:
//! - parent → child: [`WorkerRequest`]
//! - child → parent: [`LineResult`]
//!
//! A worker that exits, closes stdout or answers garbage fails the line it
//! was running with a system error (FLOW-062) and is replaced on the next
//! checkout. A healthy worker goes back to the idle list.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{FlowError, Result};
use crate::runtime::LineExecutor;

use super::engine::LineRunner;
use super::result::LineResult;

/// One line sent to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub run_id: String,
    pub line: usize,
    pub inputs: Map<String, Value>,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    async fn exchange(&mut self, request: &WorkerRequest, token: &CancellationToken) -> Result<LineResult> {
        let mut payload = serde_json::to_vec(request)?;
        payload.push(b'\n');
        self.stdin.write_all(&payload).await?;
        self.stdin.flush().await?;

        let reply = tokio::select! {
            _ = token.cancelled() => {
                return Err(FlowError::Canceled {
                    reason: "batch canceled while the worker was running".to_string(),
                });
            }
            reply = self.stdout.next_line() => reply?,
        };

        let reply = reply.ok_or_else(|| FlowError::WorkerProcess {
            reason: "worker exited without answering".to_string(),
        })?;
        serde_json::from_str(&reply).map_err(|e| FlowError::WorkerProcess {
            reason: format!("unreadable worker reply: {}", e),
        })
    }
}

/// Pool of at most `size` worker processes
pub struct ProcessPool {
    program: PathBuf,
    args: Vec<String>,
    size: usize,
    slots: Semaphore,
    idle: Mutex<Vec<Worker>>,
}

impl ProcessPool {
    /// Workers started as `program args...`
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, size: usize) -> Self {
        let size = size.max(1);
        Self {
            program: program.into(),
            args,
            size,
            slots: Semaphore::new(size),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Workers re-running the current executable as `worker <flow>`
    pub fn for_flow(flow_path: &Path, config: &EngineConfig) -> Result<Self> {
        let program = std::env::current_exe()?;
        let mut args = vec![
            "worker".to_string(),
            flow_path.display().to_string(),
            "--scheduler".to_string(),
            config.scheduler.to_string(),
            "--node-concurrency".to_string(),
            config.effective_node_concurrency().to_string(),
        ];
        if let Some(secs) = config.line_timeout_secs {
            args.push("--line-timeout".to_string());
            args.push(secs.to_string());
        }
        Ok(Self::new(program, args, config.effective_line_concurrency()))
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub async fn idle_workers(&self) -> usize {
        self.idle.lock().await.len()
    }

    fn spawn_worker(&self) -> Result<Worker> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FlowError::WorkerProcess {
                reason: format!("cannot start {}: {}", self.program.display(), e),
            })?;

        let missing = |what: &str| FlowError::WorkerProcess {
            reason: format!("worker {} not captured", what),
        };
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        debug!(pid = ?child.id(), "worker process started");
        Ok(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn checkout(&self) -> Result<Worker> {
        if let Some(worker) = self.idle.lock().await.pop() {
            return Ok(worker);
        }
        self.spawn_worker()
    }

    /// Close every idle worker's stdin and wait for it to exit
    pub async fn shutdown(&self) {
        let workers: Vec<Worker> = self.idle.lock().await.drain(..).collect();
        for mut worker in workers {
            drop(worker.stdin);
            if let Err(e) = worker.child.wait().await {
                warn!(error = %e, "worker did not exit cleanly");
            }
        }
        info!("process pool shut down");
    }
}

#[async_trait]
impl LineRunner for ProcessPool {
    async fn run_line(
        &self,
        run_id: &str,
        line: usize,
        inputs: Map<String, Value>,
        batch_token: &CancellationToken,
    ) -> LineResult {
        let canceled = || FlowError::Canceled {
            reason: "process pool closed".to_string(),
        };
        let Ok(_slot) = self.slots.acquire().await else {
            return LineResult::failed(run_id, line, inputs, &canceled());
        };

        let mut worker = match self.checkout().await {
            Ok(worker) => worker,
            Err(e) => return LineResult::failed(run_id, line, inputs, &e),
        };

        let request = WorkerRequest {
            run_id: run_id.to_string(),
            line,
            inputs,
        };
        match worker.exchange(&request, batch_token).await {
            Ok(result) => {
                self.idle.lock().await.push(worker);
                result
            }
            Err(e) => {
                // Dropping the worker kills the process; the next checkout spawns a fresh one
                let e = match e {
                    FlowError::IoError(io) => FlowError::WorkerProcess {
                        reason: io.to_string(),
                    },
                    other => other,
                };
                warn!(line, pid = ?worker.child.id(), error = %e, "worker process failed, restarting");
                LineResult::failed(run_id, line, request.inputs, &e)
            }
        }
    }
}

/// Worker side: answer requests from `input` until it closes
pub async fn serve_worker<R, W>(executor: LineExecutor, input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let token = CancellationToken::new();
    let mut requests = BufReader::new(input).lines();
    while let Some(raw) = requests.next_line().await? {
        if raw.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = serde_json::from_str(&raw)?;
        let result = executor
            .run_line(&request.run_id, request.line, request.inputs, &token)
            .await;
        let mut payload = serde_json::to_vec(&result)?;
        payload.push(b'\n');
        output.write_all(&payload).await?;
        output.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::Status;
    use crate::runtime::FlowPlan;
    use crate::tool::ToolRegistry;
    use serde_json::json;
    use std::sync::Arc;

    #[cfg(unix)]
    #[tokio::test]
    async fn crashed_worker_is_a_system_error() {
        let pool = ProcessPool::new("sh", vec!["-c".into(), "exit 3".into()], 1);
        let result = pool
            .run_line("run", 4, Map::new(), &CancellationToken::new())
            .await;
        assert_eq!(result.run_info.status, Status::Failed);
        let error = result.error().unwrap();
        assert_eq!(error.code, "FLOW-062");
        assert_eq!(error.category, crate::error::ErrorCategory::System);
        assert_eq!(pool.idle_workers().await, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn garbage_reply_is_a_system_error() {
        let pool = ProcessPool::new("sh", vec!["-c".into(), "read line; echo nope".into()], 1);
        let result = pool
            .run_line("run", 0, Map::new(), &CancellationToken::new())
            .await;
        assert_eq!(result.error().unwrap().code, "FLOW-062");
    }

    #[tokio::test]
    async fn serve_worker_answers_each_request() {
        let plan = FlowPlan::from_yaml(
            r#"
inputs: { text: {} }
outputs: { loud: "${shout.output}" }
nodes:
  - name: shout
    tool: upper
    inputs: { text: "${inputs.text}" }
"#,
            &ToolRegistry::with_builtins(),
        )
        .unwrap();
        let executor = LineExecutor::new(Arc::new(plan), &EngineConfig::default());

        let mut input = Vec::new();
        for (line, text) in ["a", "b"].iter().enumerate() {
            let request = WorkerRequest {
                run_id: "r".into(),
                line,
                inputs: json!({ "text": text }).as_object().cloned().unwrap(),
            };
            input.extend(serde_json::to_vec(&request).unwrap());
            input.push(b'\n');
        }

        let mut output = Vec::new();
        serve_worker(executor, input.as_slice(), &mut output).await.unwrap();

        let results: Vec<LineResult> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].line_number, 1);
        assert_eq!(results[1].output["loud"], json!("B"));
    }
}
