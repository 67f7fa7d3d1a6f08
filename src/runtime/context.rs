//! Execution context passed explicitly to every tool call
//!
//! Each node gets its own copy (`for_node`), so concurrently running nodes
//! never observe each other's node name. The cancellation token is shared by
//! every copy made for the same line.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    run_id: Arc<str>,
    line_number: Option<usize>,
    node: Option<Arc<str>>,
    cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(run_id: impl Into<Arc<str>>) -> Self {
        Self {
            run_id: run_id.into(),
            line_number: None,
            node: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Context for one line of a batch
    pub fn for_line(run_id: impl Into<Arc<str>>, line_number: usize) -> Self {
        Self {
            line_number: Some(line_number),
            ..Self::new(run_id)
        }
    }

    /// Replace the cancellation token (e.g. with a child of the batch token)
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Copy of this context scoped to one node
    pub fn for_node(&self, node: &Arc<str>) -> Self {
        Self {
            node: Some(Arc::clone(node)),
            ..self.clone()
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn line_number(&self) -> Option<usize> {
        self.line_number
    }

    /// Current node name, empty outside a node
    pub fn node_name(&self) -> &str {
        self.node.as_deref().unwrap_or("")
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Span every log line of this node's execution is recorded under
    pub fn span(&self) -> Span {
        tracing::info_span!(
            "node",
            run_id = %self.run_id,
            line = ?self.line_number,
            node = self.node_name(),
        )
    }
}
