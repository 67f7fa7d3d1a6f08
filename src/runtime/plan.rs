//! FlowPlan - a validated flow with its tools resolved
//!
//! Built once per batch and shared read-only (behind `Arc`) by every line.
//! Each line or aggregation phase borrows it to create a fresh
//! [`DagManager`].

use std::path::Path;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

use crate::ast::Flow;
use crate::dag::{validate_flow, validate_tools, DagManager, FlowGraph};
use crate::error::{FlowError, Result};
use crate::tool::{ResolvedTool, ToolResolver};

#[derive(Debug)]
pub struct FlowPlan {
    flow: Flow,
    graph: FlowGraph,
    /// Indexed like the graph
    tools: Vec<ResolvedTool>,
    /// Regular nodes read by at least one aggregation node
    aggregation_sources: Vec<Arc<str>>,
}

impl FlowPlan {
    /// Validate `flow` and resolve every tool reference
    pub fn new(flow: Flow, resolver: &dyn ToolResolver) -> Result<Self> {
        let graph = validate_flow(&flow)?;
        validate_tools(&flow, resolver)?;

        let tools = flow
            .nodes
            .iter()
            .map(|node| {
                resolver.resolve(&node.tool).ok_or_else(|| FlowError::UnknownTool {
                    node: node.name.to_string(),
                    tool: node.tool.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let regular: FxHashSet<&str> = flow.regular_nodes().map(|n| n.name.as_ref()).collect();
        let mut aggregation_sources: Vec<Arc<str>> = Vec::new();
        for node in flow.aggregation_nodes() {
            for dep in node.dependencies() {
                if regular.contains(dep.as_ref()) && !aggregation_sources.contains(&dep) {
                    aggregation_sources.push(dep);
                }
            }
        }

        Ok(Self {
            flow,
            graph,
            tools,
            aggregation_sources,
        })
    }

    pub fn from_yaml(yaml: &str, resolver: &dyn ToolResolver) -> Result<Self> {
        Self::new(Flow::from_yaml(yaml)?, resolver)
    }

    pub fn from_file(path: impl AsRef<Path>, resolver: &dyn ToolResolver) -> Result<Self> {
        Self::new(Flow::from_file(path)?, resolver)
    }

    pub fn flow(&self) -> &Flow {
        &self.flow
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    /// Resolved tool of a node
    pub fn tool(&self, node: &str) -> Result<&ResolvedTool> {
        self.graph
            .index_of(node)
            .map(|idx| &self.tools[idx])
            .ok_or_else(|| FlowError::BindingError {
                reason: format!("no tool resolved for node '{}'", node),
            })
    }

    pub fn aggregation_sources(&self) -> &[Arc<str>] {
        &self.aggregation_sources
    }

    pub fn has_aggregation(&self) -> bool {
        self.flow.has_aggregation()
    }

    pub fn line_dag(&self, inputs: Map<String, Value>) -> DagManager<'_> {
        DagManager::for_line(&self.flow, &self.graph, inputs)
    }

    pub fn aggregation_dag(
        &self,
        inputs: Map<String, Value>,
        columns: FxHashMap<Arc<str>, Value>,
    ) -> DagManager<'_> {
        DagManager::for_aggregation(&self.flow, &self.graph, inputs, columns)
    }
}
