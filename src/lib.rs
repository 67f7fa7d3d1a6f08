//! flowline - DAG flow execution engine for LLM pipelines
//!
//! A flow is a DAG of tool-invocation nodes. Each data row of a batch is one
//! *line*: an independent run of the flow's regular nodes. Aggregation
//! nodes run once afterwards over the lines' outputs.
//!
//! - `ast`: flow definition (nodes, input assignments, conditions)
//! - `binding`: value resolver
//! - `dag`: graph, validation and the per-line `DagManager`
//! - `runtime`: sync and async schedulers, line executor, interrupts
//! - `batch`: batch engine, input mapping, process pool, results
//! - `tool`: tool traits, registry and builtins

pub mod ast;
pub mod batch;
pub mod binding;
pub mod config;
pub mod dag;
pub mod error;
pub mod event;
pub mod runtime;
pub mod store;
pub mod tool;
pub mod util;

pub use ast::{Flow, InputAssignment, Node};
pub use batch::{BatchEngine, BatchResult, InputMapping, LineResult, ProcessPool};
pub use config::{EngineConfig, Isolation, SchedulerMode};
pub use dag::{DagManager, FlowGraph};
pub use error::{FixSuggestion, FlowError, Result, ToolError};
pub use event::{Event, EventKind, EventLog};
pub use runtime::{AsyncScheduler, ExecutionContext, FlowPlan, LineExecutor, SyncScheduler};
pub use tool::{Tool, ToolRegistry, ToolResolver};
