//! Run records: per-node, per-line and per-batch
//!
//! Everything here is serde-serialisable; worker processes send
//! [`LineResult`]s back as JSON and the CLI can dump a [`BatchResult`].

use std::collections::BTreeMap;
use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ErrorCategory, FlowError};

/// Status of a node, a line or the aggregation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Completed,
    Failed,
    Bypassed,
    Canceled,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Bypassed => "bypassed",
            Self::Canceled => "canceled",
        })
    }
}

/// Serialisable error payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Engine error code (`FLOW-031`)
    pub code: String,
    pub category: ErrorCategory,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
    /// Tool-defined code for tool failures (`RateLimited`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_code: Option<String>,
}

impl From<&FlowError> for ErrorInfo {
    fn from(err: &FlowError) -> Self {
        let tool_code = match err {
            FlowError::ToolFailed { error, .. } => Some(error.code.clone()),
            _ => None,
        };
        Self {
            code: err.code().to_string(),
            category: err.category(),
            message: err.to_string(),
            node: err.node().map(str::to_string),
            tool_code,
        }
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Token usage reported by an LLM-style tool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    /// Extract an OpenAI-style `usage` object from a node output
    pub fn from_output(output: &Value) -> Option<Self> {
        let usage = output.get("usage")?.as_object()?;
        let field = |name: &str| usage.get(name).and_then(Value::as_u64);
        let prompt_tokens = field("prompt_tokens").unwrap_or(0);
        let completion_tokens = field("completion_tokens").unwrap_or(0);
        let total_tokens = field("total_tokens").unwrap_or(prompt_tokens + completion_tokens);
        Some(Self {
            prompt_tokens,
            completion_tokens,
            total_tokens,
        })
    }
}

impl AddAssign for Usage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
        self.total_tokens += rhs.total_tokens;
    }
}

/// Record of one node execution (or bypass)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRunInfo {
    pub node: String,
    #[serde(default)]
    pub line_number: Option<usize>,
    pub status: Status,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bypass_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Flow-level record for one line (or the aggregation phase)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowRunInfo {
    pub run_id: String,
    #[serde(default)]
    pub line_number: Option<usize>,
    pub status: Status,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// Everything produced by one line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineResult {
    pub line_number: usize,
    /// Named flow outputs (empty when the line failed)
    pub output: Map<String, Value>,
    /// Outputs of nodes read by aggregation nodes (`null` when bypassed)
    pub aggregation_inputs: Map<String, Value>,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
    pub run_info: FlowRunInfo,
}

impl LineResult {
    /// Record for a line that failed before or outside its scheduler
    pub fn failed(run_id: &str, line_number: usize, inputs: Map<String, Value>, error: &FlowError) -> Self {
        let now = Utc::now();
        let status = match error {
            FlowError::Canceled { .. } => Status::Canceled,
            _ => Status::Failed,
        };
        Self {
            line_number,
            output: Map::new(),
            aggregation_inputs: Map::new(),
            node_run_infos: BTreeMap::new(),
            run_info: FlowRunInfo {
                run_id: run_id.to_string(),
                line_number: Some(line_number),
                status,
                inputs,
                start_time: now,
                end_time: now,
                duration_ms: 0,
                error: Some(ErrorInfo::from(error)),
            },
        }
    }

    pub fn is_success(&self) -> bool {
        self.run_info.status == Status::Completed
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.run_info.error.as_ref()
    }

    /// Token usage summed over this line's nodes
    pub fn usage(&self) -> Usage {
        let mut total = Usage::default();
        for usage in self.node_run_infos.values().filter_map(|info| info.usage) {
            total += usage;
        }
        total
    }
}

/// Outcome of the aggregation phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Flow outputs that read aggregation nodes
    pub output: Map<String, Value>,
    pub node_run_infos: BTreeMap<String, NodeRunInfo>,
    pub run_info: FlowRunInfo,
}

impl AggregationResult {
    pub fn is_success(&self) -> bool {
        self.run_info.status == Status::Completed
    }
}

/// Aggregated system metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: u64,
}

/// One failed line, as reported in the summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineError {
    pub line_number: usize,
    pub error: ErrorInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub failed_user_error_lines: usize,
    pub failed_system_error_lines: usize,
    /// First N failed lines, in line order
    pub error_list: Vec<LineError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggr_error: Option<ErrorInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    /// Some lines (or the aggregation phase) failed
    PartiallyCompleted,
    /// Every line failed
    Failed,
    Canceled,
}

/// Result of a batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    pub run_id: String,
    pub status: BatchStatus,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub failed_lines: usize,
    /// node -> status -> number of lines
    pub node_status: BTreeMap<String, BTreeMap<Status, usize>>,
    pub system_metrics: SystemMetrics,
    pub error_summary: ErrorSummary,
    /// Sorted by line number
    pub line_results: Vec<LineResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggr_results: Option<AggregationResult>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

impl BatchResult {
    /// Build the batch record from finished lines
    pub fn build(
        run_id: impl Into<String>,
        mut line_results: Vec<LineResult>,
        aggr_results: Option<AggregationResult>,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        error_report_limit: usize,
        canceled: bool,
    ) -> Self {
        line_results.sort_by_key(|l| l.line_number);

        let total_lines = line_results.len();
        let completed_lines = line_results.iter().filter(|l| l.is_success()).count();
        let failed_lines = total_lines - completed_lines;

        let mut node_status: BTreeMap<String, BTreeMap<Status, usize>> = BTreeMap::new();
        let mut usage = Usage::default();
        let mut error_summary = ErrorSummary::default();

        for line in &line_results {
            for (node, info) in &line.node_run_infos {
                *node_status
                    .entry(node.clone())
                    .or_default()
                    .entry(info.status)
                    .or_insert(0) += 1;
            }
            usage += line.usage();

            if let Some(error) = line.error().filter(|_| !line.is_success()) {
                match error.category {
                    ErrorCategory::User => error_summary.failed_user_error_lines += 1,
                    ErrorCategory::System => error_summary.failed_system_error_lines += 1,
                }
                if error_summary.error_list.len() < error_report_limit {
                    error_summary.error_list.push(LineError {
                        line_number: line.line_number,
                        error: error.clone(),
                    });
                }
            }
        }

        if let Some(aggr) = &aggr_results {
            for (node, info) in &aggr.node_run_infos {
                *node_status
                    .entry(node.clone())
                    .or_default()
                    .entry(info.status)
                    .or_insert(0) += 1;
                if let Some(u) = info.usage {
                    usage += u;
                }
            }
            error_summary.aggr_error = aggr.run_info.error.clone();
        }

        let aggr_failed = aggr_results.as_ref().is_some_and(|a| !a.is_success());
        let status = if canceled {
            BatchStatus::Canceled
        } else if total_lines > 0 && completed_lines == 0 {
            BatchStatus::Failed
        } else if failed_lines > 0 || aggr_failed {
            BatchStatus::PartiallyCompleted
        } else {
            BatchStatus::Completed
        };

        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

        Self {
            run_id: run_id.into(),
            status,
            total_lines,
            completed_lines,
            failed_lines,
            node_status,
            system_metrics: SystemMetrics {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
                duration_ms,
            },
            error_summary,
            line_results,
            aggr_results,
            start_time,
            end_time,
        }
    }

    /// Indexes of failed lines, ascending
    pub fn failed_line_numbers(&self) -> Vec<usize> {
        self.line_results
            .iter()
            .filter(|l| !l.is_success())
            .map(|l| l.line_number)
            .collect()
    }

    /// `X/Y lines failed, indexes: [...], exception of first failing index: ...`
    ///
    /// `None` when every line succeeded.
    pub fn summary(&self) -> Option<String> {
        let failed = self.failed_line_numbers();
        let first = failed.first()?;
        let message = self
            .line_results
            .iter()
            .find(|l| l.line_number == *first)
            .and_then(LineResult::error)
            .map(|e| e.message.as_str())
            .unwrap_or("unknown error");
        let indexes: Vec<String> = failed.iter().map(ToString::to_string).collect();
        Some(format!(
            "{}/{} lines failed, indexes: [{}], exception of first failing index: {}",
            failed.len(),
            self.total_lines,
            indexes.join(", "),
            message
        ))
    }

    /// Outputs of successful lines, in line order
    pub fn outputs(&self) -> impl Iterator<Item = (usize, &Map<String, Value>)> {
        self.line_results
            .iter()
            .filter(|l| l.is_success())
            .map(|l| (l.line_number, &l.output))
    }
}
