//! Value Resolver
//!
//! `resolve(assignment, scope)`:
//! - Literal -> the literal, verbatim
//! - FlowInput -> the named flow input, path applied
//! - NodeOutput -> the completed output, path applied; a bypassed node
//!   yields [`Resolution::Bypassed`] whatever the path
//!
//! Skipped nodes are completed (with their `return` value) and resolve like
//! any other completed node.
//!
//! In columnar scopes (the aggregation phase) flow inputs and the outputs of
//! line-phase nodes are lists with one entry per line; paths then apply to
//! each element, and elements where the path is missing become `null`.

use std::fmt;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ast::InputAssignment;
use crate::error::{FlowError, Result};
use crate::util::jsonpath::{self, Segment};

/// Why a node was bypassed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BypassReason {
    /// The node its activate condition reads was itself bypassed
    ActivateDependencyBypassed { dependency: String },
    /// The activate condition evaluated to something else than expected
    ActivateConditionNotMet,
    /// No activate condition and every node dependency was bypassed
    AllDependenciesBypassed,
}

impl fmt::Display for BypassReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ActivateDependencyBypassed { dependency } => {
                write!(f, "activate dependency '{}' was bypassed", dependency)
            }
            Self::ActivateConditionNotMet => f.write_str("activate condition not met"),
            Self::AllDependenciesBypassed => f.write_str("all dependencies bypassed"),
        }
    }
}

/// A bypassed node
#[derive(Debug, Clone, PartialEq)]
pub struct Bypass {
    pub reason: BypassReason,
}

/// Result of resolving one assignment
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Value(Value),
    /// Referenced node was bypassed
    Bypassed,
}

impl Resolution {
    /// The value, with a valueless bypass read as `null`
    pub fn into_value(self) -> Value {
        match self {
            Self::Value(v) => v,
            Self::Bypassed => Value::Null,
        }
    }

    pub fn is_bypassed(&self) -> bool {
        matches!(self, Self::Bypassed)
    }
}

/// Everything an assignment can read from
#[derive(Debug, Clone, Copy)]
pub struct ResolveScope<'a> {
    pub completed: &'a FxHashMap<Arc<str>, Value>,
    pub bypassed: &'a FxHashMap<Arc<str>, Bypass>,
    pub inputs: &'a Map<String, Value>,
    /// Aggregation phase: nodes whose completed output is a per-line column
    pub columnar: Option<&'a FxHashSet<Arc<str>>>,
}

impl<'a> ResolveScope<'a> {
    pub fn is_columnar(&self) -> bool {
        self.columnar.is_some()
    }
}

/// Resolve one assignment against the scope
pub fn resolve(assignment: &InputAssignment, scope: &ResolveScope<'_>) -> Result<Resolution> {
    match assignment {
        InputAssignment::Literal(value) => Ok(Resolution::Value(value.clone())),

        InputAssignment::FlowInput { name, path } => {
            let value = scope
                .inputs
                .get(name.as_ref())
                .ok_or_else(|| FlowError::MissingInput {
                    input: name.to_string(),
                })?;
            let reference = format!("inputs.{}", name);
            if scope.is_columnar() {
                Ok(Resolution::Value(apply_columnar(value, path)))
            } else {
                apply_strict(value, path, &reference).map(Resolution::Value)
            }
        }

        InputAssignment::NodeOutput { node, path } => {
            if let Some(value) = scope.completed.get(node) {
                let columnar = scope.columnar.is_some_and(|c| c.contains(node));
                return if columnar {
                    Ok(Resolution::Value(apply_columnar(value, path)))
                } else {
                    apply_strict(value, path, node).map(Resolution::Value)
                };
            }

            if scope.bypassed.contains_key(node) {
                return Ok(Resolution::Bypassed);
            }
            Err(FlowError::BindingError {
                reason: format!("node '{}' has not completed", node),
            })
        }
    }
}

fn apply_strict(value: &Value, path: &[Segment], reference: &str) -> Result<Value> {
    jsonpath::apply(value, path)
        .cloned()
        .ok_or_else(|| FlowError::PathNotFound {
            reference: reference.to_string(),
            path: jsonpath::render(path),
        })
}

fn apply_columnar(column: &Value, path: &[Segment]) -> Value {
    if path.is_empty() {
        return column.clone();
    }
    match column {
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| jsonpath::apply(item, path).cloned().unwrap_or(Value::Null))
                .collect(),
        ),
        other => jsonpath::apply(other, path).cloned().unwrap_or(Value::Null),
    }
}
