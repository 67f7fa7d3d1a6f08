//! Input mapping - project data-row columns onto flow inputs
//!
//! ```yaml
//! question: ${data.q}
//! context: ${data.doc.body}
//! temperature: 0.2
//! ```
//!
//! A value is either `${data.<column>[.path]}` or a literal. Inputs the
//! mapping does not mention are read from the column of the same name.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::ast::Flow;
use crate::error::{FlowError, Result};
use crate::util::jsonpath::{self, Segment};

static DATA_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\$\{\s*data\.([^{}]+?)\s*\}$").expect("data regex is valid"));

#[derive(Debug, Clone, PartialEq)]
pub enum MappingValue {
    /// `${data.col[.path]}`
    Column { name: String, path: Vec<Segment> },
    Literal(Value),
}

impl MappingValue {
    pub fn parse(value: Value) -> Result<Self> {
        let Value::String(s) = &value else {
            return Ok(Self::Literal(value));
        };
        if !s.trim_start().starts_with("${") {
            return Ok(Self::Literal(value));
        }

        let invalid = |reason: &str| FlowError::InvalidExpression {
            expr: s.clone(),
            reason: reason.to_string(),
        };
        let caps = DATA_RE
            .captures(s.trim())
            .ok_or_else(|| invalid("mapping expressions must read ${data.<column>}"))?;
        let mut segments = jsonpath::parse(&caps[1])?;
        if segments.is_empty() {
            return Err(invalid("missing column name"));
        }
        let name = match segments.remove(0) {
            Segment::Field(name) => name,
            Segment::Index(idx) => idx.to_string(),
        };
        Ok(Self::Column {
            name,
            path: segments,
        })
    }

    /// Value for one row; `None` when the column (or path) is absent
    fn extract(&self, row: &Map<String, Value>) -> Option<Value> {
        match self {
            Self::Literal(value) => Some(value.clone()),
            Self::Column { name, path } => row
                .get(name)
                .and_then(|v| jsonpath::apply(v, path))
                .cloned(),
        }
    }
}

/// Flow input name → mapping value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputMapping {
    entries: BTreeMap<String, MappingValue>,
}

impl InputMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(raw: &Map<String, Value>) -> Result<Self> {
        let entries = raw
            .iter()
            .map(|(k, v)| Ok((k.clone(), MappingValue::parse(v.clone())?)))
            .collect::<Result<_>>()?;
        Ok(Self { entries })
    }

    /// Parse CLI pairs `input=${data.col}` / `input=literal`
    ///
    /// The right-hand side is read as JSON when it parses, else as a string.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = &'a str>) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for pair in pairs {
            let (key, raw) = pair.split_once('=').ok_or_else(|| FlowError::ConfigError {
                reason: format!("mapping '{}' must look like input=value", pair),
            })?;
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            entries.insert(key.trim().to_string(), MappingValue::parse(value)?);
        }
        Ok(Self { entries })
    }

    pub fn insert(&mut self, input: impl Into<String>, value: MappingValue) -> &mut Self {
        self.entries.insert(input.into(), value);
        self
    }

    pub fn get(&self, input: &str) -> Option<&MappingValue> {
        self.entries.get(input)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Mapping reading every flow input from the column of the same name
pub fn default_mapping(flow: &Flow) -> InputMapping {
    let entries = flow
        .inputs
        .keys()
        .map(|name| {
            (
                name.clone(),
                MappingValue::Column {
                    name: name.clone(),
                    path: Vec::new(),
                },
            )
        })
        .collect();
    InputMapping { entries }
}

/// Build a line's flow inputs from one data row
///
/// Defaults are applied here, once per row. A required input without a
/// value is `MissingInput`; an optional one without a default is left out.
pub fn apply_mapping(flow: &Flow, mapping: &InputMapping, row: &Map<String, Value>) -> Result<Map<String, Value>> {
    let mut inputs = Map::new();
    for (name, def) in &flow.inputs {
        let value = match mapping.get(name) {
            Some(entry) => entry.extract(row),
            None => row.get(name).cloned(),
        };
        match value.or_else(|| def.default.clone()) {
            Some(value) => {
                inputs.insert(name.clone(), value);
            }
            None if def.is_required() => {
                return Err(FlowError::MissingInput { input: name.clone() });
            }
            None => {}
        }
    }
    Ok(inputs)
}
