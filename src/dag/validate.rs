//! Flow Validation - load-time structural checks
//!
//! Validates:
//! - Node names are unique and not the reserved `inputs` keyword
//! - Node references (inputs, conditions, flow outputs) name existing nodes
//! - Flow-input references name declared inputs
//! - Only aggregation nodes consume aggregation node outputs (flow outputs
//!   may read them; they are resolved after the aggregation phase)
//! - No flow output is named like the injected `line_number` key
//! - Tool references resolve (when a resolver is given)
//! - The dependency graph is acyclic
//!
//! Every failure here is a configuration error: the flow never starts.

use rustc_hash::FxHashSet;

use crate::ast::{Flow, InputAssignment, INPUTS_SECTION};
use crate::error::{FlowError, Result};
use crate::tool::ToolResolver;
use crate::util::constants::LINE_NUMBER_KEY;

use super::graph::FlowGraph;

/// Validate a flow's structure and build its graph
pub fn validate_flow(flow: &Flow) -> Result<FlowGraph> {
    if flow.nodes.is_empty() {
        return Err(FlowError::ValidationError {
            reason: "flow declares no nodes".to_string(),
        });
    }

    let mut names: FxHashSet<&str> = FxHashSet::default();
    let mut aggregation: FxHashSet<&str> = FxHashSet::default();
    for node in &flow.nodes {
        if node.name.as_ref() == INPUTS_SECTION {
            return Err(FlowError::ValidationError {
                reason: format!("'{}' is reserved and cannot name a node", INPUTS_SECTION),
            });
        }
        if !names.insert(node.name.as_ref()) {
            return Err(FlowError::DuplicateNode {
                node: node.name.to_string(),
            });
        }
        if node.aggregation {
            aggregation.insert(node.name.as_ref());
        }
    }

    for node in &flow.nodes {
        for assignment in node.assignments() {
            check_assignment(
                &node.name,
                assignment,
                flow,
                &names,
                (!node.aggregation).then_some(&aggregation),
            )?;
        }
    }

    for (output, assignment) in &flow.outputs {
        if output == LINE_NUMBER_KEY {
            return Err(FlowError::ValidationError {
                reason: format!("'{}' is reserved and cannot name a flow output", LINE_NUMBER_KEY),
            });
        }
        let owner = format!("outputs.{}", output);
        check_assignment(&owner, assignment, flow, &names, None)?;
    }

    let graph = FlowGraph::from_flow(flow);
    graph.detect_cycles()?;
    Ok(graph)
}

/// Check every node's tool reference against a resolver
pub fn validate_tools(flow: &Flow, resolver: &dyn ToolResolver) -> Result<()> {
    for node in &flow.nodes {
        if resolver.resolve(&node.tool).is_none() {
            return Err(FlowError::UnknownTool {
                node: node.name.to_string(),
                tool: node.tool.clone(),
            });
        }
    }
    Ok(())
}

/// `forbidden` holds the aggregation nodes `owner` may not reference
fn check_assignment(
    owner: &str,
    assignment: &InputAssignment,
    flow: &Flow,
    names: &FxHashSet<&str>,
    forbidden: Option<&FxHashSet<&str>>,
) -> Result<()> {
    match assignment {
        InputAssignment::Literal(_) => Ok(()),
        InputAssignment::FlowInput { name, .. } => {
            if flow.inputs.contains_key(name.as_ref()) {
                Ok(())
            } else {
                Err(FlowError::UnknownFlowInput {
                    owner: owner.to_string(),
                    input: name.to_string(),
                })
            }
        }
        InputAssignment::NodeOutput { node, .. } => {
            if !names.contains(node.as_ref()) {
                return Err(FlowError::UnknownNodeReference {
                    node: owner.to_string(),
                    reference: node.to_string(),
                });
            }
            if forbidden.is_some_and(|f| f.contains(node.as_ref())) {
                return Err(FlowError::AggregationReference {
                    owner: owner.to_string(),
                    reference: node.to_string(),
                });
            }
            Ok(())
        }
    }
}
