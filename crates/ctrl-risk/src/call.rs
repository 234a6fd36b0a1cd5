// call.rs - The intercepted tool call every engine evaluates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A proposed tool invocation as handed over by an agent adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Logical name of the external action server (e.g., "github").
    pub server: String,
    /// Tool on that server (e.g., "create_issue").
    pub tool: String,
    /// Environment tag (e.g., "dev", "prod").
    pub env: String,
    /// Argument payload, arbitrary nesting.
    #[serde(default = "empty_args")]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

fn empty_args() -> Value {
    Value::Object(Default::default())
}

impl ToolCall {
    pub fn new(server: impl Into<String>, tool: impl Into<String>, env: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            tool: tool.into(),
            env: env.into(),
            args: empty_args(),
            actor: None,
        }
    }

    pub fn with_args(mut self, args: Value) -> Self {
        self.args = args;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Resolve a dotted path (`payload.html`, `items.0`) inside the
    /// argument payload.
    pub fn arg(&self, path: &str) -> Option<&Value> {
        path.split('.').try_fold(&self.args, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_nested_argument_paths() {
        let call = ToolCall::new("web", "publish", "prod")
            .with_args(json!({"page": {"html": "<p>", "tags": ["a", "b"]}}));
        assert_eq!(call.arg("page.html"), Some(&json!("<p>")));
        assert_eq!(call.arg("page.tags.1"), Some(&json!("b")));
        assert_eq!(call.arg("page.missing"), None);
        assert_eq!(call.arg("page.html.deeper"), None);
    }

    #[test]
    fn args_default_to_empty_object() {
        let call: ToolCall =
            serde_json::from_str(r#"{"server":"s","tool":"t","env":"dev"}"#).unwrap();
        assert_eq!(call.args, json!({}));
        assert!(call.actor.is_none());
    }
}
