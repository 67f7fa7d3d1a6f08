//! Builtin tools
//!
//! Small, dependency-free tools used by the CLI and tests:
//!
//! | Tool | Kind | Parameters |
//! |------|------|------------|
//! | `echo` | blocking | `value` |
//! | `concat` | blocking | `left`, `right`, `separator = ""` |
//! | `upper` | blocking | `text` |
//! | `equals` | blocking | `left`, `right` |
//! | `mock_llm` | blocking | `prompt`, `model = "mock-1"` |
//! | `sleep` | async | `ms`, `value = null` |
//! | `sleep_blocking` | blocking | `ms`, `value = null` |
//! | `fail` | blocking | `message = "forced failure"`, `when = true`, `value = null` |
//! | `collect` | blocking | `items` |
//! | `count` | blocking | `items` |
//! | `mean` | blocking | `items` |

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::error::ToolError;
use crate::runtime::ExecutionContext;

use super::{Args, AsyncTool, ParamSpec, ToolRegistry, ToolSignature};

/// Register every builtin into `registry`
pub fn register_builtins(registry: &mut ToolRegistry) {
    registry
        .register_fn("echo", sig(&["value"], &[]), |_, mut args| {
            Ok(take(&mut args, "value"))
        })
        .register_fn(
            "concat",
            sig(&["left", "right"], &[("separator", json!(""))]),
            |_, args| {
                let separator = as_text(arg(&args, "separator"));
                Ok(Value::String(format!(
                    "{}{}{}",
                    as_text(arg(&args, "left")),
                    separator,
                    as_text(arg(&args, "right"))
                )))
            },
        )
        .register_fn("upper", sig(&["text"], &[]), |_, args| {
            let text = arg(&args, "text")
                .as_str()
                .ok_or_else(|| ToolError::invalid_argument("'text' must be a string"))?;
            Ok(Value::String(text.to_uppercase()))
        })
        .register_fn("equals", sig(&["left", "right"], &[]), |_, args| {
            Ok(Value::Bool(arg(&args, "left") == arg(&args, "right")))
        })
        .register_fn(
            "mock_llm",
            sig(&["prompt"], &[("model", json!("mock-1"))]),
            |ctx, args| mock_llm(ctx, &args),
        )
        .register_async("sleep", Sleep)
        .register_fn(
            "sleep_blocking",
            sig(&["ms"], &[("value", Value::Null)]),
            |_, mut args| {
                std::thread::sleep(Duration::from_millis(millis(&args)?));
                Ok(take(&mut args, "value"))
            },
        )
        .register_fn(
            "fail",
            sig(
                &[],
                &[
                    ("message", json!("forced failure")),
                    ("when", json!(true)),
                    ("value", Value::Null),
                ],
            ),
            |_, mut args| {
                if is_truthy(arg(&args, "when")) {
                    Err(ToolError::new("ForcedFailure", as_text(arg(&args, "message"))))
                } else {
                    Ok(take(&mut args, "value"))
                }
            },
        )
        .register_fn("collect", sig(&["items"], &[]), |_, mut args| {
            items(&args)?;
            Ok(take(&mut args, "items"))
        })
        .register_fn("count", sig(&["items"], &[]), |_, args| {
            Ok(json!(items(&args)?.len()))
        })
        .register_fn("mean", sig(&["items"], &[]), |_, args| {
            let numbers: Vec<f64> = items(&args)?.iter().filter_map(Value::as_f64).collect();
            if numbers.is_empty() {
                return Ok(Value::Null);
            }
            Ok(json!(numbers.iter().sum::<f64>() / numbers.len() as f64))
        });
}

/// Async sleep; returns `value` after `ms` milliseconds
struct Sleep;

#[async_trait]
impl AsyncTool for Sleep {
    fn signature(&self) -> ToolSignature {
        sig(&["ms"], &[("value", Value::Null)])
    }

    async fn call(&self, ctx: &ExecutionContext, mut args: Args) -> Result<Value, ToolError> {
        let duration = Duration::from_millis(millis(&args)?);
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(take(&mut args, "value")),
            _ = ctx.cancel_token().cancelled() => Err(ToolError::new("Canceled", "sleep interrupted")),
        }
    }
}

/// Deterministic stand-in for a language model call
///
/// Replies with the prompt echoed back and an OpenAI-style `usage` block
/// (one token per whitespace-separated word).
fn mock_llm(ctx: &ExecutionContext, args: &Args) -> Result<Value, ToolError> {
    let prompt = arg(args, "prompt")
        .as_str()
        .ok_or_else(|| ToolError::invalid_argument("'prompt' must be a string"))?;
    let text = format!("echo: {}", prompt);
    let prompt_tokens = prompt.split_whitespace().count();
    let completion_tokens = text.split_whitespace().count();

    tracing::debug!(node = ctx.node_name(), prompt_tokens, "mock llm call");

    Ok(json!({
        "text": text,
        "model": arg(args, "model"),
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        }
    }))
}

fn sig(required: &[&str], optional: &[(&str, Value)]) -> ToolSignature {
    ToolSignature::new(
        required
            .iter()
            .map(|name| ParamSpec::required(*name))
            .chain(
                optional
                    .iter()
                    .map(|(name, default)| ParamSpec::optional(*name, default.clone())),
            ),
    )
}

static NULL: Value = Value::Null;

/// Bound argument, `null` when absent
fn arg<'a>(args: &'a Args, name: &str) -> &'a Value {
    args.get(name).unwrap_or(&NULL)
}

fn take(args: &mut Args, name: &str) -> Value {
    args.remove(name).unwrap_or(Value::Null)
}

/// Strings verbatim, everything else as compact JSON
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn millis(args: &Args) -> Result<u64, ToolError> {
    arg(args, "ms")
        .as_u64()
        .ok_or_else(|| ToolError::invalid_argument("'ms' must be a non-negative integer"))
}

fn items(args: &Args) -> Result<&Vec<Value>, ToolError> {
    arg(args, "items")
        .as_array()
        .ok_or_else(|| ToolError::invalid_argument("'items' must be a list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tool::{Callable, ToolResolver};

    fn call(name: &str, input: Value) -> Result<Value, ToolError> {
        let registry = ToolRegistry::with_builtins();
        let resolved = registry.resolve(name).unwrap();
        let args = match input {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let bound = resolved.signature.bind(args).unwrap();
        match resolved.callable {
            Callable::Blocking(tool) => tool.call(&ExecutionContext::new("test"), bound),
            Callable::Async(_) => unreachable!("use the async test"),
        }
    }

    #[test]
    fn echo_returns_value() {
        assert_eq!(call("echo", json!({"value": [1, 2]})).unwrap(), json!([1, 2]));
    }

    #[test]
    fn concat_uses_separator_default() {
        assert_eq!(
            call("concat", json!({"left": "a", "right": 3})).unwrap(),
            json!("a3")
        );
        assert_eq!(
            call("concat", json!({"left": "a", "right": "b", "separator": "-"})).unwrap(),
            json!("a-b")
        );
    }

    #[test]
    fn upper_rejects_non_string() {
        assert_eq!(call("upper", json!({"text": "abc"})).unwrap(), json!("ABC"));
        let err = call("upper", json!({"text": 1})).unwrap_err();
        assert_eq!(err.code, "InvalidArgument");
    }

    #[test]
    fn mock_llm_reports_usage() {
        let out = call("mock_llm", json!({"prompt": "two words"})).unwrap();
        assert_eq!(out["text"], json!("echo: two words"));
        assert_eq!(out["usage"]["prompt_tokens"], json!(2));
        assert_eq!(out["usage"]["completion_tokens"], json!(3));
        assert_eq!(out["usage"]["total_tokens"], json!(5));
    }

    #[test]
    fn fail_is_conditional() {
        let err = call("fail", json!({"message": "boom"})).unwrap_err();
        assert_eq!(err.code, "ForcedFailure");
        assert_eq!(err.message, "boom");

        let ok = call("fail", json!({"when": false, "value": "fine"})).unwrap();
        assert_eq!(ok, json!("fine"));
    }

    #[test]
    fn aggregation_helpers() {
        assert_eq!(call("count", json!({"items": [1, null, 3]})).unwrap(), json!(3));
        assert_eq!(call("mean", json!({"items": [1, null, 3]})).unwrap(), json!(2.0));
        assert_eq!(call("mean", json!({"items": []})).unwrap(), Value::Null);
        assert!(call("collect", json!({"items": "nope"})).is_err());
    }

    #[tokio::test]
    async fn sleep_returns_value() {
        let out = Sleep
            .call(
                &ExecutionContext::new("test"),
                Sleep.signature().bind(json!({"ms": 1, "value": 7}).as_object().unwrap().clone()).unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(out, json!(7));
    }

    #[tokio::test]
    async fn sleep_observes_cancellation() {
        let ctx = ExecutionContext::new("test");
        ctx.cancel_token().cancel();
        let args = json!({"ms": 60_000}).as_object().unwrap().clone();
        let err = Sleep
            .call(&ctx, Sleep.signature().bind(args).unwrap())
            .await
            .unwrap_err();
        assert_eq!(err.code, "Canceled");
    }
}
