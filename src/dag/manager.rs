//! DagManager - per-line node state machine
//!
//! `PENDING → RUNNING → COMPLETED`, or `PENDING → BYPASSED`, or
//! `PENDING → COMPLETED` directly for a skipped node.
//!
//! A node is READY when every node it references (inputs, `activate.when`,
//! `skip.when`, `skip.return`) is completed or bypassed. A READY node is
//! bypassed instead of run when:
//! - (a) its activate condition reads a bypassed node
//! - (b) its activate condition resolves to something other than `is`
//! - (c) it has no activate condition, has node dependencies, and all of
//!   them are bypassed
//!
//! An explicit activate condition alone decides (a)/(b); rule (c) is not
//! consulted for such nodes.
//!
//! A READY node that is not bypassable and whose skip condition resolves
//! equal to `is` is skipped: it completes with its resolved `return` value
//! (`null` without one), and dependents read it like any completed output.
//!
//! State is kept in a dense vector indexed like the [`FlowGraph`]. Nodes
//! outside the current phase (aggregation nodes during a line, line nodes
//! during aggregation) are excluded or pre-completed.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};
use tracing::warn;

use crate::ast::{Flow, Node};
use crate::binding::{resolve, Bypass, BypassReason, Resolution, ResolveScope};
use crate::error::{FlowError, Result};
use crate::tool::{Args, ToolSignature};

use super::graph::FlowGraph;

/// Lifecycle state of one node within a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Pending,
    /// Popped as ready, executing under the scheduler
    Running,
    Completed,
    Bypassed,
    /// Not part of this phase
    Excluded,
}

/// Per-line (or per-aggregation) DAG state
pub struct DagManager<'f> {
    flow: &'f Flow,
    graph: &'f FlowGraph,
    states: Vec<NodeState>,
    completed: FxHashMap<Arc<str>, Value>,
    bypassed: FxHashMap<Arc<str>, Bypass>,
    inputs: Map<String, Value>,
    columnar: Option<FxHashSet<Arc<str>>>,
}

impl<'f> DagManager<'f> {
    /// Manager for one line: regular nodes only, scalar flow inputs
    pub fn for_line(flow: &'f Flow, graph: &'f FlowGraph, inputs: Map<String, Value>) -> Self {
        let states = flow
            .nodes
            .iter()
            .map(|n| {
                if n.aggregation {
                    NodeState::Excluded
                } else {
                    NodeState::Pending
                }
            })
            .collect();

        Self {
            flow,
            graph,
            states,
            completed: FxHashMap::default(),
            bypassed: FxHashMap::default(),
            inputs,
            columnar: None,
        }
    }

    /// Manager for the aggregation phase
    ///
    /// `columns` holds, per regular node, the list of its outputs across
    /// lines (already aligned to line order); `inputs` holds the flow inputs
    /// as lists in the same order. Regular nodes start completed.
    pub fn for_aggregation(
        flow: &'f Flow,
        graph: &'f FlowGraph,
        inputs: Map<String, Value>,
        mut columns: FxHashMap<Arc<str>, Value>,
    ) -> Self {
        let mut states = Vec::with_capacity(flow.nodes.len());
        let mut completed = FxHashMap::default();
        let mut columnar = FxHashSet::default();

        for node in &flow.nodes {
            if node.aggregation {
                states.push(NodeState::Pending);
            } else {
                let column = columns.remove(&node.name).unwrap_or(Value::Array(Vec::new()));
                completed.insert(Arc::clone(&node.name), column);
                columnar.insert(Arc::clone(&node.name));
                states.push(NodeState::Completed);
            }
        }

        Self {
            flow,
            graph,
            states,
            completed,
            bypassed: FxHashMap::default(),
            inputs,
            columnar: Some(columnar),
        }
    }

    fn scope(&self) -> ResolveScope<'_> {
        ResolveScope {
            completed: &self.completed,
            bypassed: &self.bypassed,
            inputs: &self.inputs,
            columnar: self.columnar.as_ref(),
        }
    }

    fn is_ready(&self, idx: usize) -> bool {
        self.states[idx] == NodeState::Pending
            && self.graph.dependencies(idx).iter().all(|&d| {
                matches!(
                    self.states[d as usize],
                    NodeState::Completed | NodeState::Bypassed
                )
            })
    }

    fn ready_indices(&self) -> Vec<usize> {
        (0..self.states.len()).filter(|&i| self.is_ready(i)).collect()
    }

    /// Pop every READY node, moving it to RUNNING
    ///
    /// Call after [`pop_bypassable_nodes`](Self::pop_bypassable_nodes) has
    /// reached its fixpoint, otherwise bypassable nodes are returned too.
    pub fn pop_ready_nodes(&mut self) -> Vec<Arc<Node>> {
        let ready = self.ready_indices();
        ready
            .into_iter()
            .map(|idx| {
                self.states[idx] = NodeState::Running;
                Arc::clone(&self.flow.nodes[idx])
            })
            .collect()
    }

    /// Pop every READY node that must be bypassed, moving it to BYPASSED
    ///
    /// Single pass: bypassing a node can make others bypassable, so callers
    /// repeat until an empty list comes back.
    pub fn pop_bypassable_nodes(&mut self) -> Result<Vec<(Arc<Node>, BypassReason)>> {
        let mut popped = Vec::new();
        for idx in self.ready_indices() {
            let node = Arc::clone(&self.flow.nodes[idx]);
            if let Some(reason) = self.bypass_reason(idx, &node)? {
                self.states[idx] = NodeState::Bypassed;
                popped.push((Arc::clone(&node), reason.clone()));
                self.bypassed.insert(Arc::clone(&node.name), Bypass { reason });
            }
        }
        Ok(popped)
    }

    /// Pop every READY, non-bypassable node whose skip condition matches,
    /// completing it with its resolved `return` value
    ///
    /// Single pass, like [`pop_bypassable_nodes`](Self::pop_bypassable_nodes).
    pub fn pop_skipped_nodes(&mut self) -> Result<Vec<(Arc<Node>, Value)>> {
        let mut popped = Vec::new();
        for idx in self.ready_indices() {
            let node = Arc::clone(&self.flow.nodes[idx]);
            let Some(skip) = &node.skip else {
                continue;
            };
            if self.bypass_reason(idx, &node)?.is_some() {
                continue;
            }
            if resolve(&skip.when, &self.scope())?.into_value() != skip.is {
                continue;
            }
            let value = match &skip.return_value {
                Some(ret) => resolve(ret, &self.scope())?.into_value(),
                None => Value::Null,
            };
            self.states[idx] = NodeState::Completed;
            self.completed.insert(Arc::clone(&node.name), value.clone());
            popped.push((node, value));
        }
        Ok(popped)
    }

    fn bypass_reason(&self, idx: usize, node: &Node) -> Result<Option<BypassReason>> {
        if let Some(activate) = &node.activate {
            if let Some(dep) = activate.when.node_ref() {
                if self.bypassed.contains_key(dep) {
                    return Ok(Some(BypassReason::ActivateDependencyBypassed {
                        dependency: dep.to_string(),
                    }));
                }
            }
            let actual = resolve(&activate.when, &self.scope())?.into_value();
            if actual != activate.is {
                return Ok(Some(BypassReason::ActivateConditionNotMet));
            }
            return Ok(None);
        }

        let deps = self.graph.dependencies(idx);
        // Seeded columns and skipped nodes count as completed, never as bypassed
        if !deps.is_empty()
            && deps
                .iter()
                .all(|&d| self.states[d as usize] == NodeState::Bypassed)
        {
            return Ok(Some(BypassReason::AllDependenciesBypassed));
        }
        Ok(None)
    }

    /// Resolve a node's inputs for a call with `signature`
    ///
    /// An input reading a bypassed node that left no value is omitted when
    /// the parameter has a default, otherwise passed as `null` with a warning.
    pub fn get_node_valid_inputs(&self, node: &Node, signature: &ToolSignature) -> Result<Args> {
        let scope = self.scope();
        let mut args = Args::new();
        for (name, assignment) in &node.inputs {
            match resolve(assignment, &scope)? {
                Resolution::Value(value) => {
                    args.insert(name.clone(), value);
                }
                Resolution::Bypassed if signature.has_default(name) => {}
                Resolution::Bypassed => {
                    warn!(
                        node = %node.name,
                        input = %name,
                        "input reads a bypassed node and has no default, passing null"
                    );
                    args.insert(name.clone(), Value::Null);
                }
            }
        }
        Ok(args)
    }

    /// Merge finished node outputs
    ///
    /// Completing a node twice, or completing a bypassed node, is an error.
    pub fn complete_nodes(&mut self, outputs: impl IntoIterator<Item = (Arc<str>, Value)>) -> Result<()> {
        for (name, output) in outputs {
            let idx = self
                .graph
                .index_of(&name)
                .ok_or_else(|| FlowError::BindingError {
                    reason: format!("cannot complete unknown node '{}'", name),
                })?;
            match self.states[idx] {
                NodeState::Pending | NodeState::Running => {
                    self.states[idx] = NodeState::Completed;
                    self.completed.insert(name, output);
                }
                NodeState::Completed | NodeState::Bypassed | NodeState::Excluded => {
                    return Err(FlowError::DuplicateCompletion {
                        node: name.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// True iff every node of this phase is completed or bypassed
    pub fn completed(&self) -> bool {
        self.states.iter().all(|s| {
            matches!(
                s,
                NodeState::Completed | NodeState::Bypassed | NodeState::Excluded
            )
        })
    }

    pub fn state(&self, name: &str) -> Option<NodeState> {
        self.graph.index_of(name).map(|idx| self.states[idx])
    }

    /// Names still pending (for stalled-graph diagnostics)
    pub fn pending_names(&self) -> Vec<Arc<str>> {
        self.names_in(NodeState::Pending)
    }

    fn names_in(&self, state: NodeState) -> Vec<Arc<str>> {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, s)| **s == state)
            .map(|(i, _)| Arc::clone(self.graph.name(i)))
            .collect()
    }

    pub fn completed_outputs(&self) -> &FxHashMap<Arc<str>, Value> {
        &self.completed
    }

    pub fn bypassed_nodes(&self) -> &FxHashMap<Arc<str>, Bypass> {
        &self.bypassed
    }

    pub fn inputs(&self) -> &Map<String, Value> {
        &self.inputs
    }

    /// Scope over the current state, for resolving flow outputs
    pub fn resolve_scope(&self) -> ResolveScope<'_> {
        self.scope()
    }

    /// Completed outputs of this phase's own nodes, and its bypassed nodes
    ///
    /// In the aggregation phase the seeded line columns are left out.
    pub fn into_parts(self) -> (FxHashMap<Arc<str>, Value>, FxHashMap<Arc<str>, Bypass>) {
        let mut completed = self.completed;
        if let Some(columnar) = &self.columnar {
            completed.retain(|name, _| !columnar.contains(name));
        }
        (completed, self.bypassed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Flow;
    use crate::dag::validate_flow;
    use crate::tool::ParamSpec;
    use serde_json::json;

    fn load(yaml: &str) -> (Flow, FlowGraph) {
        let flow = Flow::from_yaml(yaml).unwrap();
        let graph = validate_flow(&flow).unwrap();
        (flow, graph)
    }

    fn names(nodes: &[Arc<Node>]) -> Vec<&str> {
        let mut v: Vec<&str> = nodes.iter().map(|n| n.name.as_ref()).collect();
        v.sort_unstable();
        v
    }

    const CHAIN: &str = r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: x }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
  - name: c
    tool: echo
    inputs: { value: "${b.output}" }
"#;

    #[test]
    fn readiness_follows_dependencies() {
        let (flow, graph) = load(CHAIN);
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());

        assert!(dag.pop_bypassable_nodes().unwrap().is_empty());
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["a"]);
        // a is running, nothing else is ready
        assert!(dag.pop_ready_nodes().is_empty());
        assert_eq!(dag.state("a"), Some(NodeState::Running));

        dag.complete_nodes([(Arc::from("a"), json!("x"))]).unwrap();
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["b"]);
        assert!(!dag.completed());
    }

    #[test]
    fn duplicate_completion_is_rejected() {
        let (flow, graph) = load(CHAIN);
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        dag.pop_ready_nodes();
        dag.complete_nodes([(Arc::from("a"), json!(1))]).unwrap();
        let err = dag.complete_nodes([(Arc::from("a"), json!(2))]).unwrap_err();
        assert_eq!(err.code(), "FLOW-051");
        assert_eq!(dag.completed_outputs()["a"], json!(1));
    }

    #[test]
    fn activate_false_bypasses_and_propagates() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: x }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
  - name: c
    tool: echo
    inputs: { value: "${a.output}" }
    activate: { when: "${a.output}", is: skip_value }
  - name: d
    tool: echo
    inputs: { value: "${c.output}" }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        dag.pop_ready_nodes();
        dag.complete_nodes([(Arc::from("a"), json!("x"))]).unwrap();

        let first = dag.pop_bypassable_nodes().unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(&*first[0].0.name, "c");
        assert_eq!(first[0].1, BypassReason::ActivateConditionNotMet);

        // d only depends on c: rule (c)
        let second = dag.pop_bypassable_nodes().unwrap();
        assert_eq!(&*second[0].0.name, "d");
        assert_eq!(second[0].1, BypassReason::AllDependenciesBypassed);
        assert!(dag.pop_bypassable_nodes().unwrap().is_empty());

        assert_eq!(names(&dag.pop_ready_nodes()), vec!["b"]);
        dag.complete_nodes([(Arc::from("b"), json!("x"))]).unwrap();
        assert!(dag.completed());
    }

    #[test]
    fn activate_condition_overrides_all_bypassed_rule() {
        let (flow, graph) = load(
            r#"
inputs:
  go: {}
nodes:
  - name: a
    tool: echo
    inputs: { value: 1 }
    activate: { when: "${inputs.go}", is: false }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
    activate: { when: "${inputs.go}", is: true }
"#,
        );
        let mut inputs = Map::new();
        inputs.insert("go".into(), json!(true));
        let mut dag = DagManager::for_line(&flow, &graph, inputs);

        let bypassed = dag.pop_bypassable_nodes().unwrap();
        assert_eq!(bypassed.len(), 1);
        assert_eq!(&*bypassed[0].0.name, "a");

        // b's only dependency is bypassed, but its own condition holds
        assert!(dag.pop_bypassable_nodes().unwrap().is_empty());
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["b"]);
    }

    #[test]
    fn activate_reading_bypassed_node_is_bypassed() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: 1 }
    activate: { when: 1, is: 2 }
  - name: b
    tool: echo
    inputs: { value: 3 }
    activate: { when: "${a.output}", is: null }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        dag.pop_bypassable_nodes().unwrap();
        let second = dag.pop_bypassable_nodes().unwrap();
        assert_eq!(
            second[0].1,
            BypassReason::ActivateDependencyBypassed {
                dependency: "a".into()
            }
        );
    }

    #[test]
    fn skip_completes_with_return_value() {
        let (flow, graph) = load(
            r#"
inputs:
  mode: {}
nodes:
  - name: a
    tool: upper
    inputs: { text: hi }
    skip: { when: "${inputs.mode}", is: fast, return: cached }
  - name: b
    tool: echo
    inputs: { value: "${a.output}" }
"#,
        );
        let mut inputs = Map::new();
        inputs.insert("mode".into(), json!("fast"));
        let mut dag = DagManager::for_line(&flow, &graph, inputs);

        assert!(dag.pop_bypassable_nodes().unwrap().is_empty());
        let skipped = dag.pop_skipped_nodes().unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].1, json!("cached"));
        assert_eq!(dag.state("a"), Some(NodeState::Completed));
        assert!(dag.bypassed_nodes().is_empty());

        // b's only dependency was skipped, not bypassed: rule (c) does not apply
        assert!(dag.pop_bypassable_nodes().unwrap().is_empty());
        let ready = dag.pop_ready_nodes();
        assert_eq!(names(&ready), vec!["b"]);
        let sig = ToolSignature::new([ParamSpec::required("value")]);
        let args = dag.get_node_valid_inputs(&ready[0], &sig).unwrap();
        assert_eq!(args["value"], json!("cached"));
    }

    #[test]
    fn skip_without_return_completes_with_null() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: upper
    inputs: { text: hi }
    skip: { when: 1, is: 1 }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        let skipped = dag.pop_skipped_nodes().unwrap();
        assert_eq!(skipped[0].1, Value::Null);
        assert_eq!(dag.completed_outputs()["a"], Value::Null);
        assert!(dag.completed());
    }

    #[test]
    fn unmet_activate_wins_over_matching_skip() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: upper
    inputs: { text: hi }
    activate: { when: 1, is: 2 }
    skip: { when: 1, is: 1, return: cached }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        assert!(dag.pop_skipped_nodes().unwrap().is_empty());
        let bypassed = dag.pop_bypassable_nodes().unwrap();
        assert_eq!(bypassed[0].1, BypassReason::ActivateConditionNotMet);
        assert_eq!(dag.state("a"), Some(NodeState::Bypassed));
    }

    #[test]
    fn unmatched_skip_leaves_node_ready() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: upper
    inputs: { text: hi }
    skip: { when: 1, is: 2, return: cached }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        assert!(dag.pop_skipped_nodes().unwrap().is_empty());
        assert_eq!(names(&dag.pop_ready_nodes()), vec!["a"]);
    }

    #[test]
    fn bypassed_input_omitted_when_default_exists() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: a
    tool: echo
    inputs: { value: 1 }
    activate: { when: 1, is: 2 }
  - name: b
    tool: concat
    inputs: { left: "x", separator: "${a.output}", right: "${a.output}" }
    activate: { when: 1, is: 1 }
"#,
        );
        let mut dag = DagManager::for_line(&flow, &graph, Map::new());
        dag.pop_bypassable_nodes().unwrap();
        let ready = dag.pop_ready_nodes();
        let sig = ToolSignature::new([
            ParamSpec::required("left"),
            ParamSpec::required("right"),
            ParamSpec::optional("separator", json!("-")),
        ]);
        let args = dag.get_node_valid_inputs(&ready[0], &sig).unwrap();
        assert!(!args.contains_key("separator"));
        assert_eq!(args["right"], Value::Null);
        assert_eq!(args["left"], json!("x"));
    }

    #[test]
    fn aggregation_phase_sees_columns() {
        let (flow, graph) = load(
            r#"
nodes:
  - name: grade
    tool: echo
    inputs: { value: 1 }
  - name: total
    tool: count
    aggregation: true
    inputs: { items: "${grade.output}" }
"#,
        );
        let mut line = DagManager::for_line(&flow, &graph, Map::new());
        assert_eq!(names(&line.pop_ready_nodes()), vec!["grade"]);
        assert_eq!(line.state("total"), Some(NodeState::Excluded));

        let mut columns = FxHashMap::default();
        columns.insert(Arc::from("grade"), json!([1, 2, 3]));
        let mut agg = DagManager::for_aggregation(&flow, &graph, Map::new(), columns);
        let ready = agg.pop_ready_nodes();
        assert_eq!(names(&ready), vec!["total"]);

        let sig = ToolSignature::new([ParamSpec::required("items")]);
        let args = agg.get_node_valid_inputs(&ready[0], &sig).unwrap();
        assert_eq!(args["items"], json!([1, 2, 3]));

        agg.complete_nodes([(Arc::from("total"), json!(3))]).unwrap();
        assert!(agg.completed());
        let (completed, _) = agg.into_parts();
        assert_eq!(completed.len(), 1);
    }
}
