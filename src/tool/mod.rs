//! Tool Module - callables invoked by nodes
//!
//! A node's `tool:` field is an opaque reference resolved through a
//! [`ToolResolver`] into a [`ResolvedTool`]: a [`Callable`] plus its declared
//! [`ToolSignature`].
//!
//! Two flavours of callable:
//! - [`Tool`] - blocking; runs on a worker thread (sync scheduler) or the
//!   tokio blocking pool (async scheduler)
//! - [`AsyncTool`] - awaited directly on the runtime
//!
//! Arguments are a JSON object. [`ToolSignature::bind`] is the adapter that
//! turns a node's resolved inputs into a call: it fills declared defaults and
//! rejects unknown or missing parameters.

mod builtin;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ToolError;
use crate::runtime::ExecutionContext;

pub use builtin::register_builtins;

/// Named arguments passed to a tool
pub type Args = Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════
// SIGNATURE
// ═══════════════════════════════════════════════════════════════════════════

/// One declared parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, default: Value) -> Self {
        Self {
            name: name.into(),
            default: Some(default),
        }
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

/// Declared parameter list of a tool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolSignature {
    pub params: Vec<ParamSpec>,
    /// Accept parameters not listed in `params` (`**kwargs` style tools)
    #[serde(default)]
    pub variadic: bool,
}

impl ToolSignature {
    pub fn new(params: impl IntoIterator<Item = ParamSpec>) -> Self {
        Self {
            params: params.into_iter().collect(),
            variadic: false,
        }
    }

    /// Signature accepting any named argument
    pub fn variadic() -> Self {
        Self {
            params: Vec::new(),
            variadic: true,
        }
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn has_default(&self, name: &str) -> bool {
        self.param(name).is_some_and(ParamSpec::has_default)
    }

    /// Bind resolved node inputs to this signature
    ///
    /// Missing parameters take their declared default; a missing parameter
    /// without default or an undeclared one (unless variadic) is an error.
    pub fn bind(&self, mut args: Args) -> Result<Args, String> {
        if !self.variadic {
            if let Some(unknown) = args.keys().find(|k| self.param(k).is_none()) {
                return Err(format!("unexpected parameter '{}'", unknown));
            }
        }

        let mut missing = Vec::new();
        for param in &self.params {
            if args.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    args.insert(param.name.clone(), default.clone());
                }
                None => missing.push(param.name.as_str()),
            }
        }

        if missing.is_empty() {
            Ok(args)
        } else {
            Err(format!("missing required parameter(s): {}", missing.join(", ")))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// TOOL TRAITS
// ═══════════════════════════════════════════════════════════════════════════

/// Blocking tool
pub trait Tool: Send + Sync {
    fn signature(&self) -> ToolSignature;

    fn call(&self, ctx: &ExecutionContext, args: Args) -> Result<Value, ToolError>;
}

/// Tool awaited on the async runtime
#[async_trait]
pub trait AsyncTool: Send + Sync {
    fn signature(&self) -> ToolSignature;

    async fn call(&self, ctx: &ExecutionContext, args: Args) -> Result<Value, ToolError>;
}

/// A resolved callable, blocking or async
#[derive(Clone)]
pub enum Callable {
    Blocking(Arc<dyn Tool>),
    Async(Arc<dyn AsyncTool>),
}

impl Callable {
    pub fn signature(&self) -> ToolSignature {
        match self {
            Self::Blocking(tool) => tool.signature(),
            Self::Async(tool) => tool.signature(),
        }
    }

    pub fn is_async(&self) -> bool {
        matches!(self, Self::Async(_))
    }
}

impl fmt::Debug for Callable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocking(_) => f.write_str("Callable::Blocking"),
            Self::Async(_) => f.write_str("Callable::Async"),
        }
    }
}

/// Callable with its signature computed once at load time
#[derive(Debug, Clone)]
pub struct ResolvedTool {
    pub callable: Callable,
    pub signature: ToolSignature,
}

impl From<Callable> for ResolvedTool {
    fn from(callable: Callable) -> Self {
        let signature = callable.signature();
        Self {
            callable,
            signature,
        }
    }
}

/// Resolve a node's tool reference
pub trait ToolResolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Option<ResolvedTool>;
}

/// Blocking tool backed by a closure
pub struct FnTool<F> {
    signature: ToolSignature,
    func: F,
}

impl<F> FnTool<F>
where
    F: Fn(&ExecutionContext, Args) -> Result<Value, ToolError> + Send + Sync,
{
    pub fn new(signature: ToolSignature, func: F) -> Self {
        Self { signature, func }
    }
}

impl<F> Tool for FnTool<F>
where
    F: Fn(&ExecutionContext, Args) -> Result<Value, ToolError> + Send + Sync,
{
    fn signature(&self) -> ToolSignature {
        self.signature.clone()
    }

    fn call(&self, ctx: &ExecutionContext, args: Args) -> Result<Value, ToolError> {
        (self.func)(ctx, args)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// REGISTRY
// ═══════════════════════════════════════════════════════════════════════════

/// Name-keyed tool resolver
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: FxHashMap<String, Callable>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with the builtin tools
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, callable: Callable) -> &mut Self {
        self.tools.insert(name.into(), callable);
        self
    }

    pub fn register_blocking(&mut self, name: impl Into<String>, tool: impl Tool + 'static) -> &mut Self {
        self.register(name, Callable::Blocking(Arc::new(tool)))
    }

    pub fn register_async(&mut self, name: impl Into<String>, tool: impl AsyncTool + 'static) -> &mut Self {
        self.register(name, Callable::Async(Arc::new(tool)))
    }

    /// Register a blocking closure
    pub fn register_fn<F>(&mut self, name: impl Into<String>, signature: ToolSignature, func: F) -> &mut Self
    where
        F: Fn(&ExecutionContext, Args) -> Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.register_blocking(name, FnTool::new(signature, func))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ToolResolver for ToolRegistry {
    fn resolve(&self, reference: &str) -> Option<ResolvedTool> {
        self.tools.get(reference).cloned().map(ResolvedTool::from)
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
