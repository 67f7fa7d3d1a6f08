//! Batch Module - many lines through one flow
//!
//! - `mapping`: row columns → flow inputs (`${data.col}` or literal)
//! - `engine`: `BatchEngine::run`, line concurrency, aggregation phase
//! - `process_pool`: line execution in `flowline worker` child processes
//! - `writer`: JSONL output artifact
//! - `result`: line/aggregation/batch records

mod engine;
mod mapping;
mod process_pool;
mod result;
mod writer;

pub use engine::{BatchEngine, LineRunner};
pub use mapping::{apply_mapping, default_mapping, InputMapping, MappingValue};
pub use process_pool::{serve_worker, ProcessPool, WorkerRequest};
pub use result::{
    AggregationResult, BatchResult, BatchStatus, ErrorInfo, ErrorSummary, FlowRunInfo, LineError,
    LineResult, NodeRunInfo, Status, SystemMetrics, Usage,
};
pub use writer::{JsonlOutputWriter, OutputWriter};
