//! Minimal path parser for value references
//!
//! Paths appear after the section of a reference:
//! `${grade.output.scores[0]}` carries the path `scores[0]`.
//!
//! Supports:
//! - a.b.c (dot notation)
//! - a[0].b (array index)
//! - a.0.b (numeric segment as index)
//!
//! Does NOT support filters, wildcards or slices.

use serde_json::Value;

use crate::error::FlowError;

/// A parsed path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Object field access: .field
    Field(String),
    /// Array index access: [0]
    Index(usize),
}

/// Parse a dotted path into segments
///
/// An empty path parses to no segments (the whole value).
pub fn parse(path: &str) -> Result<Vec<Segment>, FlowError> {
    let path = path.strip_prefix("$.").unwrap_or(path);
    if path.is_empty() || path == "$" {
        return Ok(vec![]);
    }

    let invalid = || FlowError::InvalidPath {
        path: path.to_string(),
    };

    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return Err(invalid());
        }

        if let Some(bracket_pos) = part.find('[') {
            let field = &part[..bracket_pos];
            if !field.is_empty() {
                segments.push(Segment::Field(field.to_string()));
            }
            if !part.ends_with(']') {
                return Err(invalid());
            }
            // Chained indices: items[0][1]
            for index_str in part[bracket_pos + 1..part.len() - 1].split("][") {
                let index: usize = index_str.parse().map_err(|_| invalid())?;
                segments.push(Segment::Index(index));
            }
        } else if let Ok(index) = part.parse::<usize>() {
            segments.push(Segment::Index(index));
        } else {
            segments.push(Segment::Field(part.to_string()));
        }
    }

    Ok(segments)
}

/// Apply segments to a value without cloning intermediate nodes
pub fn apply<'v>(value: &'v Value, segments: &[Segment]) -> Option<&'v Value> {
    segments
        .iter()
        .try_fold(value, |current, segment| match segment {
            Segment::Field(name) => current.get(name.as_str()),
            Segment::Index(idx) => current.get(*idx),
        })
}

/// Render segments back to their dotted form (for error messages)
pub fn render(segments: &[Segment]) -> String {
    let mut out = String::new();
    for segment in segments {
        match segment {
            Segment::Field(name) => {
                if !out.is_empty() {
                    out.push('.');
                }
                out.push_str(name);
            }
            Segment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            }
        }
    }
    out
}
