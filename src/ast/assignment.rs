//! Input assignments - the value-expression grammar
//!
//! A node input (or a condition, or a flow output) is one of:
//! - `${inputs.NAME[.path]}` -> flow input
//! - `${NODE.output[.path]}` -> output of another node
//! - `${NAME}` -> whole output of a node, or a flow input when no node has
//!   that name (settled by [`Flow`](super::Flow) after parsing)
//! - anything else -> literal, passed through verbatim
//!
//! Expressions must span the whole string; `"Hello ${x}"` is rejected rather
//! than silently treated as a literal.

use std::fmt;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{FlowError, Result};
use crate::util::jsonpath::{self, Segment};
use crate::util::intern;

/// Pre-compiled regex for a whole-value `${...}` expression
static EXPR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{\s*([^{}]*?)\s*\}$").expect("expression regex is valid"));

/// Section keyword for flow-input references
pub const INPUTS_SECTION: &str = "inputs";

/// Section keyword following a node name
pub const OUTPUT_SECTION: &str = "output";

/// A parsed input value: literal, flow input or node output
#[derive(Debug, Clone, PartialEq)]
pub enum InputAssignment {
    Literal(Value),
    FlowInput {
        name: Arc<str>,
        path: Vec<Segment>,
    },
    NodeOutput {
        node: Arc<str>,
        path: Vec<Segment>,
    },
}

impl InputAssignment {
    /// Parse a raw YAML/JSON value
    ///
    /// Only strings can carry expressions; every other value is a literal.
    pub fn parse(raw: Value) -> Result<Self> {
        match raw {
            Value::String(s) => Self::parse_str(&s).map(|parsed| parsed.unwrap_or(Self::Literal(Value::String(s)))),
            other => Ok(Self::Literal(other)),
        }
    }

    /// Parse a string; `Ok(None)` means "plain literal"
    fn parse_str(s: &str) -> Result<Option<Self>> {
        if !s.contains("${") {
            return Ok(None);
        }

        let invalid = |reason: &str| FlowError::InvalidExpression {
            expr: s.to_string(),
            reason: reason.to_string(),
        };

        let caps = EXPR_RE
            .captures(s.trim())
            .ok_or_else(|| invalid("expressions must span the whole value"))?;
        let body = &caps[1];
        if body.is_empty() {
            return Err(invalid("empty expression"));
        }

        let (head, rest) = match body.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (body, None),
        };
        if !is_identifier(head) {
            return Err(invalid("expected a node name or `inputs`"));
        }

        if head == INPUTS_SECTION {
            let rest = rest.ok_or_else(|| invalid("missing input name after `inputs.`"))?;
            let (name, path) = match rest.split_once('.') {
                Some((name, path)) => (name, path),
                None => split_index(rest),
            };
            if !is_identifier(name) {
                return Err(invalid("invalid flow input name"));
            }
            return Ok(Some(Self::FlowInput {
                name: intern(name),
                path: jsonpath::parse(path)?,
            }));
        }

        let path = match rest {
            None => Vec::new(),
            Some(rest) => {
                let (section, path) = match rest.split_once('.') {
                    Some((section, path)) => (section, path),
                    None => split_index(rest),
                };
                if section != OUTPUT_SECTION {
                    return Err(invalid("expected `.output` after the node name"));
                }
                jsonpath::parse(path)?
            }
        };

        Ok(Some(Self::NodeOutput {
            node: intern(head),
            path,
        }))
    }

    /// The node this assignment depends on, if any
    pub fn node_ref(&self) -> Option<&Arc<str>> {
        match self {
            Self::NodeOutput { node, .. } => Some(node),
            _ => None,
        }
    }

    pub fn flow_input_ref(&self) -> Option<&Arc<str>> {
        match self {
            Self::FlowInput { name, .. } => Some(name),
            _ => None,
        }
    }

    /// Render back to the serialized form
    pub fn to_value(&self) -> Value {
        match self {
            Self::Literal(v) => v.clone(),
            other => Value::String(other.to_string()),
        }
    }
}

impl fmt::Display for InputAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (head, path) = match self {
            Self::Literal(v) => return write!(f, "{}", v),
            Self::FlowInput { name, path } => (format!("{}.{}", INPUTS_SECTION, name), path),
            Self::NodeOutput { node, path } => (format!("{}.{}", node, OUTPUT_SECTION), path),
        };
        match path.first() {
            None => write!(f, "${{{}}}", head),
            Some(Segment::Index(_)) => write!(f, "${{{}{}}}", head, jsonpath::render(path)),
            Some(Segment::Field(_)) => write!(f, "${{{}.{}}}", head, jsonpath::render(path)),
        }
    }
}

impl<'de> Deserialize<'de> for InputAssignment {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        Self::parse(raw).map_err(serde::de::Error::custom)
    }
}

impl Serialize for InputAssignment {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.to_value().serialize(serializer)
    }
}

/// `name[0].x` has no dot before its index; split at the bracket instead
fn split_index(s: &str) -> (&str, &str) {
    match s.find('[') {
        Some(pos) => (&s[..pos], &s[pos..]),
        None => (s, ""),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_' || c == '-')
}
