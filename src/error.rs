// The #[error] attribute from thiserror uses struct fields via string interpolation,
// but Rust's unused_assignments lint doesn't recognize this.
#![allow(unused_assignments)]

//! flowline Error Types with Error Codes
//!
//! Error code ranges:
//! - FLOW-000-009: Flow definition errors
//! - FLOW-010-019: Value expression errors
//! - FLOW-020-029: DAG errors
//! - FLOW-030-039: Tool errors
//! - FLOW-040-049: Binding/resolution errors
//! - FLOW-050-059: Scheduling errors
//! - FLOW-060-069: Batch/line errors
//! - FLOW-090-099: IO/serialization errors
//! - FLOW-140: Config errors

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Trait for errors that provide fix suggestions
pub trait FixSuggestion {
    fn fix_suggestion(&self) -> Option<&str>;
}

/// Who is responsible for a failure.
///
/// User errors come from the flow, its inputs or its tools. System errors
/// point at the engine itself (stalled graph, panicked worker, crashed
/// worker process).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    User,
    System,
}

/// Error returned by a tool invocation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct ToolError {
    /// Tool-defined error code (e.g. "InvalidArgument", "UpstreamTimeout")
    pub code: String,
    pub message: String,
}

impl ToolError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error for arguments the tool cannot work with
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new("InvalidArgument", message)
    }
}

/// All error variants are part of the public API.
///
/// Implements both `thiserror::Error` for std error compatibility
/// and `miette::Diagnostic` for fancy terminal error display.
#[derive(Error, Debug, Diagnostic)]
#[diagnostic(url(docsrs))]
pub enum FlowError {
    // ═══════════════════════════════════════════
    // FLOW DEFINITION ERRORS (000-009)
    // ═══════════════════════════════════════════
    #[error("[FLOW-001] Failed to parse flow: {details}")]
    #[diagnostic(
        code(flowline::parse_error),
        help("Check YAML syntax: indentation and quoting")
    )]
    ParseError { details: String },

    #[error("[FLOW-003] Flow file not found: {path}")]
    #[diagnostic(code(flowline::flow_not_found), help("Check the file path exists"))]
    FlowNotFound { path: String },

    #[error("[FLOW-004] Flow validation failed: {reason}")]
    #[diagnostic(code(flowline::validation_error))]
    ValidationError { reason: String },

    #[error("[FLOW-005] Duplicate node name '{node}'")]
    #[diagnostic(code(flowline::duplicate_node))]
    DuplicateNode { node: String },

    // ═══════════════════════════════════════════
    // VALUE EXPRESSION ERRORS (010-019)
    // ═══════════════════════════════════════════
    #[error("[FLOW-010] Invalid value expression '{expr}': {reason}")]
    #[diagnostic(
        code(flowline::invalid_expression),
        help("Use ${{inputs.name}}, ${{node.output}} or ${{node.output.field}}")
    )]
    InvalidExpression { expr: String, reason: String },

    // ═══════════════════════════════════════════
    // DAG ERRORS (020-029)
    // ═══════════════════════════════════════════
    #[error("[FLOW-020] Cycle detected in flow: {cycle}")]
    #[diagnostic(code(flowline::cycle_detected))]
    CycleDetected { cycle: String },

    #[error("[FLOW-021] Node '{node}' references unknown node '{reference}'")]
    #[diagnostic(code(flowline::unknown_node_reference))]
    UnknownNodeReference { node: String, reference: String },

    #[error("[FLOW-022] '{owner}' references undeclared flow input '{input}'")]
    #[diagnostic(code(flowline::unknown_flow_input))]
    UnknownFlowInput { owner: String, input: String },

    #[error("[FLOW-023] '{owner}' cannot reference aggregation node '{reference}'")]
    #[diagnostic(
        code(flowline::aggregation_reference),
        help("Only aggregation nodes may consume aggregation node outputs")
    )]
    AggregationReference { owner: String, reference: String },

    // ═══════════════════════════════════════════
    // TOOL ERRORS (030-039)
    // ═══════════════════════════════════════════
    #[error("[FLOW-030] Node '{node}' uses unknown tool '{tool}'")]
    #[diagnostic(code(flowline::unknown_tool))]
    UnknownTool { node: String, tool: String },

    #[error("[FLOW-031] Node '{node}' failed: {error}")]
    ToolFailed { node: String, error: ToolError },

    #[error("[FLOW-032] Invalid arguments for node '{node}': {reason}")]
    InvalidArguments { node: String, reason: String },

    // ═══════════════════════════════════════════
    // BINDING/RESOLUTION ERRORS (040-049)
    // ═══════════════════════════════════════════
    #[error("[FLOW-040] Binding resolution failed: {reason}")]
    BindingError { reason: String },

    #[error("[FLOW-041] Invalid path syntax: {path}")]
    InvalidPath { path: String },

    #[error("[FLOW-042] Path '{path}' not found in output of '{reference}'")]
    PathNotFound { reference: String, path: String },

    #[error("[FLOW-043] Required flow input '{input}' was not provided")]
    #[diagnostic(
        code(flowline::missing_input),
        help("Map the input with --map or declare a default in the flow")
    )]
    MissingInput { input: String },

    // ═══════════════════════════════════════════
    // SCHEDULING ERRORS (050-059)
    // ═══════════════════════════════════════════
    #[error("[FLOW-050] Stalled graph: no ready nodes but pending {pending}")]
    StalledGraph { pending: String },

    #[error("[FLOW-051] Node '{node}' completed more than once")]
    DuplicateCompletion { node: String },

    #[error("[FLOW-052] Worker executing node '{node}' panicked: {details}")]
    WorkerPanicked { node: String, details: String },

    #[error("[FLOW-053] Execution canceled: {reason}")]
    Canceled { reason: String },

    #[error("[FLOW-054] Line {line} timed out after {timeout_ms}ms")]
    LineTimeout { line: usize, timeout_ms: u64 },

    // ═══════════════════════════════════════════
    // BATCH/LINE ERRORS (060-069)
    // ═══════════════════════════════════════════
    #[error("[FLOW-060] Line {line} failed: {error}")]
    LineFailed { line: usize, error: String },

    #[error("[FLOW-061] Aggregation failed: {reason}")]
    AggregationFailed { reason: String },

    #[error("[FLOW-062] Worker process error: {reason}")]
    WorkerProcess { reason: String },

    // ═══════════════════════════════════════════
    // IO / SERIALIZATION ERRORS (090-099)
    // ═══════════════════════════════════════════
    #[error("[FLOW-093] IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("[FLOW-094] JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("[FLOW-095] YAML parse error: {0}")]
    #[diagnostic(
        code(flowline::yaml_parse),
        help("Check YAML syntax: indentation and quoting")
    )]
    YamlParse(#[from] serde_yaml::Error),

    // ═══════════════════════════════════════════
    // CONFIG ERRORS (140)
    // ═══════════════════════════════════════════
    #[error("[FLOW-140] Config error: {reason}")]
    #[diagnostic(code(flowline::config_error))]
    ConfigError { reason: String },
}

impl FlowError {
    /// Get the error code (e.g., "FLOW-001")
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseError { .. } => "FLOW-001",
            Self::FlowNotFound { .. } => "FLOW-003",
            Self::ValidationError { .. } => "FLOW-004",
            Self::DuplicateNode { .. } => "FLOW-005",
            Self::InvalidExpression { .. } => "FLOW-010",
            Self::CycleDetected { .. } => "FLOW-020",
            Self::UnknownNodeReference { .. } => "FLOW-021",
            Self::UnknownFlowInput { .. } => "FLOW-022",
            Self::AggregationReference { .. } => "FLOW-023",
            Self::UnknownTool { .. } => "FLOW-030",
            Self::ToolFailed { .. } => "FLOW-031",
            Self::InvalidArguments { .. } => "FLOW-032",
            Self::BindingError { .. } => "FLOW-040",
            Self::InvalidPath { .. } => "FLOW-041",
            Self::PathNotFound { .. } => "FLOW-042",
            Self::MissingInput { .. } => "FLOW-043",
            Self::StalledGraph { .. } => "FLOW-050",
            Self::DuplicateCompletion { .. } => "FLOW-051",
            Self::WorkerPanicked { .. } => "FLOW-052",
            Self::Canceled { .. } => "FLOW-053",
            Self::LineTimeout { .. } => "FLOW-054",
            Self::LineFailed { .. } => "FLOW-060",
            Self::AggregationFailed { .. } => "FLOW-061",
            Self::WorkerProcess { .. } => "FLOW-062",
            Self::IoError(_) => "FLOW-093",
            Self::JsonError(_) => "FLOW-094",
            Self::YamlParse(_) => "FLOW-095",
            Self::ConfigError { .. } => "FLOW-140",
        }
    }

    /// Classify the error for batch error summaries
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::StalledGraph { .. }
            | Self::DuplicateCompletion { .. }
            | Self::WorkerPanicked { .. }
            | Self::WorkerProcess { .. }
            | Self::Canceled { .. }
            | Self::IoError(_) => ErrorCategory::System,
            _ => ErrorCategory::User,
        }
    }

    /// Check if error is recoverable (a rerun of the line may succeed)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::LineTimeout { .. }
                | Self::ToolFailed { .. }
                | Self::WorkerPanicked { .. }
                | Self::WorkerProcess { .. }
        )
    }

    /// Name of the node the error originated in, if any
    pub fn node(&self) -> Option<&str> {
        match self {
            Self::ToolFailed { node, .. }
            | Self::InvalidArguments { node, .. }
            | Self::WorkerPanicked { node, .. }
            | Self::DuplicateCompletion { node } => Some(node),
            _ => None,
        }
    }
}

impl FixSuggestion for FlowError {
    fn fix_suggestion(&self) -> Option<&str> {
        match self {
            FlowError::ParseError { .. } | FlowError::YamlParse(_) => {
                Some("Check YAML syntax: indentation and quoting")
            }
            FlowError::FlowNotFound { .. } => Some("Check the file path exists"),
            FlowError::DuplicateNode { .. } => Some("Give every node a unique name"),
            FlowError::InvalidExpression { .. } => {
                Some("Use ${inputs.name}, ${node.output} or ${node.output.field}")
            }
            FlowError::CycleDetected { .. } => Some("Remove circular references between nodes"),
            FlowError::UnknownNodeReference { .. } => {
                Some("Add the missing node or fix the reference")
            }
            FlowError::UnknownFlowInput { .. } => Some("Declare the input under `inputs:`"),
            FlowError::AggregationReference { .. } => {
                Some("Only aggregation nodes may consume aggregation node outputs")
            }
            FlowError::UnknownTool { .. } => Some("Register the tool before loading the flow"),
            FlowError::InvalidArguments { .. } => {
                Some("Match node inputs to the tool's declared parameters")
            }
            FlowError::MissingInput { .. } => {
                Some("Map the input with --map or declare a default in the flow")
            }
            FlowError::LineTimeout { .. } => Some("Increase line_timeout_secs in config"),
            FlowError::StalledGraph { .. } | FlowError::DuplicateCompletion { .. } => {
                Some("This is an engine bug; please report it with the flow file")
            }
            FlowError::ConfigError { .. } => {
                Some("Check ~/.config/flowline/config.toml for syntax errors")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_code_and_display() {
        let err = FlowError::ParseError {
            details: "unexpected token at line 5".to_string(),
        };
        assert_eq!(err.code(), "FLOW-001");
        let msg = err.to_string();
        assert!(msg.contains("[FLOW-001]"));
        assert!(msg.contains("unexpected token"));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = FlowError::CycleDetected {
            cycle: "a → b → a".to_string(),
        };
        assert_eq!(err.code(), "FLOW-020");
        assert!(err.to_string().contains("a → b → a"));
        assert!(err.fix_suggestion().unwrap().contains("circular"));
    }

    #[test]
    fn test_tool_failed_carries_tool_code() {
        let err = FlowError::ToolFailed {
            node: "grade".to_string(),
            error: ToolError::new("RateLimited", "429 from upstream"),
        };
        let msg = err.to_string();
        assert!(msg.contains("[FLOW-031]"));
        assert!(msg.contains("[RateLimited] 429 from upstream"));
        assert_eq!(err.node(), Some("grade"));
        assert_eq!(err.category(), ErrorCategory::User);
    }

    #[test]
    fn test_stalled_graph_is_system_error() {
        let err = FlowError::StalledGraph {
            pending: "[c]".to_string(),
        };
        assert_eq!(err.category(), ErrorCategory::System);
        assert!(err.fix_suggestion().is_some());
    }

    #[test]
    fn test_expression_error_display_keeps_braces() {
        let err = FlowError::InvalidExpression {
            expr: "${a.".to_string(),
            reason: "unterminated".to_string(),
        };
        assert_eq!(err.code(), "FLOW-010");
        assert!(err.to_string().contains("${a."));
    }

    #[test]
    fn test_io_error_from_std() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: FlowError = io.into();
        assert_eq!(err.code(), "FLOW-093");
        assert_eq!(err.category(), ErrorCategory::System);
    }

    #[test]
    fn test_json_error_from_serde() {
        let err: FlowError = serde_json::from_str::<serde_json::Value>("{bad")
            .unwrap_err()
            .into();
        assert_eq!(err.code(), "FLOW-094");
    }

    #[test]
    fn test_is_recoverable() {
        assert!(FlowError::LineTimeout {
            line: 0,
            timeout_ms: 10
        }
        .is_recoverable());
        assert!(!FlowError::CycleDetected {
            cycle: "a → a".into()
        }
        .is_recoverable());
    }

    #[test]
    fn test_line_timeout_is_user_error() {
        let err = FlowError::LineTimeout {
            line: 3,
            timeout_ms: 500,
        };
        assert_eq!(err.category(), ErrorCategory::User);
        assert!(err.to_string().contains("Line 3"));
    }
}
