//! DAG Module - dependency graph and per-line state
//!
//! - `graph`: FlowGraph (dense indices, cycle detection)
//! - `validate`: load-time structural checks
//! - `manager`: DagManager, the readiness/bypass state machine

mod graph;
mod manager;
mod validate;

pub use graph::{DepVec, FlowGraph};
pub use manager::{DagManager, NodeState};
pub use validate::{validate_flow, validate_tools};
