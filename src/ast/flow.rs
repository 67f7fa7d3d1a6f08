//! Flow Types - the parsed YAML flow definition
//!
//! ```yaml
//! inputs:
//!   question: { type: string }
//!   style: { default: "short" }
//! outputs:
//!   answer: ${answer.output}
//! nodes:
//!   - name: answer
//!     tool: mock_llm
//!     inputs:
//!       prompt: ${inputs.question}
//!     activate: { when: "${inputs.style}", is: "short" }
//!   - name: report
//!     tool: count
//!     aggregation: true
//!     inputs:
//!       items: ${answer.output}
//! ```
//!
//! Nodes are wrapped in `Arc` once at load time and shared read-only by every
//! line of a batch.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::error::{FlowError, Result};
use crate::util::intern;

use super::assignment::InputAssignment;

/// `skip: { when, is, return }`
///
/// When `when` resolves equal to `is`, the node is not executed and the
/// resolved `return` value stands in for its output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkipCondition {
    pub when: InputAssignment,
    pub is: Value,
    #[serde(rename = "return", default)]
    pub return_value: Option<InputAssignment>,
}

/// `activate: { when, is }`
///
/// The node only runs when `when` resolves equal to `is`; otherwise it is
/// bypassed with no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivateCondition {
    pub when: InputAssignment,
    pub is: Value,
}

/// A single node of the flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: Arc<str>,
    /// Opaque tool reference, resolved through a `ToolResolver`
    pub tool: String,
    #[serde(default)]
    pub inputs: BTreeMap<String, InputAssignment>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<SkipCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activate: Option<ActivateCondition>,
    #[serde(default)]
    pub aggregation: bool,
}

impl Node {
    /// Every assignment this node evaluates, inputs first then conditions
    pub fn assignments(&self) -> impl Iterator<Item = &InputAssignment> {
        let skip = self.skip.iter().flat_map(|s| {
            std::iter::once(&s.when).chain(s.return_value.as_ref())
        });
        self.inputs
            .values()
            .chain(self.activate.iter().map(|a| &a.when))
            .chain(skip)
    }

    /// Names of nodes this node depends on (deduplicated, declaration order)
    pub fn dependencies(&self) -> SmallVec<[Arc<str>; 4]> {
        let mut deps: SmallVec<[Arc<str>; 4]> = SmallVec::new();
        for node in self.assignments().filter_map(InputAssignment::node_ref) {
            if !deps.iter().any(|d| d == node) {
                deps.push(Arc::clone(node));
            }
        }
        deps
    }

    /// Node referenced by the activate condition, if any
    pub fn activate_dependency(&self) -> Option<&Arc<str>> {
        self.activate.as_ref().and_then(|a| a.when.node_ref())
    }
}

/// Declared flow input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowInputDef {
    /// Informational type name (`string`, `int`, `list`...)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Defaults to `true` unless a default value is declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

impl FlowInputDef {
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }
}

/// Flow parsed from YAML (raw)
#[derive(Debug, Deserialize)]
struct FlowRaw {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    inputs: BTreeMap<String, Option<FlowInputDef>>,
    #[serde(default)]
    outputs: BTreeMap<String, InputAssignment>,
    nodes: Vec<Node>,
}

/// Flow definition with Arc-wrapped nodes
#[derive(Debug, Clone)]
pub struct Flow {
    pub name: Option<String>,
    pub inputs: BTreeMap<String, FlowInputDef>,
    pub outputs: BTreeMap<String, InputAssignment>,
    pub nodes: Vec<Arc<Node>>,
}

impl Flow {
    /// Parse a flow from YAML text
    ///
    /// Only syntax and expression grammar are checked here; structural
    /// checks (references, cycles, tools) happen in `dag::validate`.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let raw: FlowRaw = serde_yaml::from_str(yaml).map_err(|e| FlowError::ParseError {
            details: e.to_string(),
        })?;

        let inputs: BTreeMap<String, FlowInputDef> = raw
            .inputs
            .into_iter()
            .map(|(name, def)| (name, def.unwrap_or_default()))
            .collect();

        let node_names: Vec<Arc<str>> = raw.nodes.iter().map(|n| intern(&n.name)).collect();
        let mut flow = Self {
            name: raw.name,
            outputs: raw.outputs,
            nodes: Vec::with_capacity(raw.nodes.len()),
            inputs,
        };

        for (mut node, name) in raw.nodes.into_iter().zip(node_names.iter()) {
            node.name = Arc::clone(name);
            for assignment in node.inputs.values_mut() {
                flow.settle_bare_name(assignment, &node_names);
            }
            if let Some(activate) = node.activate.as_mut() {
                flow.settle_bare_name(&mut activate.when, &node_names);
            }
            if let Some(skip) = node.skip.as_mut() {
                flow.settle_bare_name(&mut skip.when, &node_names);
                if let Some(ret) = skip.return_value.as_mut() {
                    flow.settle_bare_name(ret, &node_names);
                }
            }
            flow.nodes.push(Arc::new(node));
        }

        let mut outputs = std::mem::take(&mut flow.outputs);
        for assignment in outputs.values_mut() {
            flow.settle_bare_name(assignment, &node_names);
        }
        flow.outputs = outputs;

        Ok(flow)
    }

    /// Load a flow from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(FlowError::FlowNotFound {
                path: path.display().to_string(),
            });
        }
        let yaml = fs::read_to_string(path)?;
        Self::from_yaml(&yaml)
    }

    /// `${name}` is a node reference unless no node has that name and a
    /// flow input does
    fn settle_bare_name(&self, assignment: &mut InputAssignment, node_names: &[Arc<str>]) {
        if let InputAssignment::NodeOutput { node, path } = assignment {
            if !node_names.contains(node) && self.inputs.contains_key(node.as_ref()) {
                *assignment = InputAssignment::FlowInput {
                    name: Arc::clone(node),
                    path: std::mem::take(path),
                };
            }
        }
    }

    pub fn node(&self, name: &str) -> Option<&Arc<Node>> {
        self.nodes.iter().find(|n| n.name.as_ref() == name)
    }

    /// Nodes executed once per line
    pub fn regular_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter().filter(|n| !n.aggregation)
    }

    /// Nodes executed once per batch, after every line
    pub fn aggregation_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.nodes.iter().filter(|n| n.aggregation)
    }

    pub fn has_aggregation(&self) -> bool {
        self.nodes.iter().any(|n| n.aggregation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const FLOW: &str = r#"
name: qa
inputs:
  question: { type: string }
  style:
    default: short
outputs:
  answer: ${answer.output.text}
  echo: ${inputs.question}
nodes:
  - name: answer
    tool: mock_llm
    inputs:
      prompt: ${inputs.question}
      temperature: 0.2
    activate:
      when: ${style}
      is: short
  - name: tidy
    tool: upper
    inputs:
      text: ${answer.output.text}
    skip:
      when: ${inputs.style}
      is: raw
      return: ${answer}
  - name: report
    tool: count
    aggregation: true
    inputs:
      items: ${tidy.output}
"#;

    #[test]
    fn parses_full_flow() {
        let flow = Flow::from_yaml(FLOW).unwrap();
        assert_eq!(flow.name.as_deref(), Some("qa"));
        assert_eq!(flow.nodes.len(), 3);
        assert!(flow.inputs["question"].is_required());
        assert!(!flow.inputs["style"].is_required());
        assert_eq!(flow.regular_nodes().count(), 2);
        assert!(flow.has_aggregation());
    }

    #[test]
    fn bare_flow_input_name_becomes_flow_input() {
        let flow = Flow::from_yaml(FLOW).unwrap();
        let answer = flow.node("answer").unwrap();
        let when = &answer.activate.as_ref().unwrap().when;
        assert_eq!(when.flow_input_ref().map(|n| n.as_ref()), Some("style"));
        assert!(answer.activate_dependency().is_none());
    }

    #[test]
    fn dependencies_cover_inputs_and_conditions() {
        let flow = Flow::from_yaml(FLOW).unwrap();
        let tidy = flow.node("tidy").unwrap();
        let tidy_deps = tidy.dependencies();
        let deps: Vec<&str> = tidy_deps.iter().map(|d| d.as_ref()).collect();
        // text and skip.return both point at `answer`
        assert_eq!(deps, vec!["answer"]);
        assert_eq!(
            tidy.skip.as_ref().unwrap().is,
            json!("raw")
        );
    }

    #[test]
    fn literal_inputs_kept_verbatim() {
        let flow = Flow::from_yaml(FLOW).unwrap();
        let answer = flow.node("answer").unwrap();
        assert_eq!(
            answer.inputs["temperature"],
            InputAssignment::Literal(json!(0.2))
        );
    }

    #[test]
    fn malformed_expression_is_parse_error() {
        let yaml = r#"
nodes:
  - name: a
    tool: echo
    inputs:
      x: "say ${oops}"
"#;
        let err = Flow::from_yaml(yaml).unwrap_err();
        assert_eq!(err.code(), "FLOW-001");
        assert!(err.to_string().contains("whole value"));
    }

    #[test]
    fn missing_file_is_flow_not_found() {
        let err = Flow::from_file("/definitely/not/here.yaml").unwrap_err();
        assert_eq!(err.code(), "FLOW-003");
    }

    #[test]
    fn null_input_declaration_is_required() {
        let yaml = r#"
inputs:
  q:
nodes:
  - name: a
    tool: echo
    inputs: { value: "${inputs.q}" }
"#;
        let flow = Flow::from_yaml(yaml).unwrap();
        assert!(flow.inputs["q"].is_required());
    }
}
