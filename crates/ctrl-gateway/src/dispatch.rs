// dispatch.rs - Delivering an approved or allowed call to its action server.
//
// The coordinator only knows the ActionDispatcher trait. HttpDispatcher speaks
// MCP over streamable HTTP to the server's base_url. Each dispatch opens a
// session (`initialize`, then `notifications/initialized`), confirms the tool
// through `tools/list`, sends `tools/call` and ends the session. Responses
// may be plain JSON or an event stream.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

use crate::config::{ServerDef, ServersConfig};
use crate::error::DispatchError;

/// MCP revision offered in `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-03-26";

const SESSION_HEADER: &str = "mcp-session-id";
const PROTOCOL_HEADER: &str = "mcp-protocol-version";

/// JSON-RPC code used when a tool reports `isError`.
const TOOL_ERROR_CODE: i64 = -32000;

/// Pages of `tools/list` read before giving up on finding a tool.
const MAX_TOOL_PAGES: usize = 32;

/// Executes a tool call against an external action server.
///
/// Implementations must not retry on their own: a failed call is recorded as
/// terminal and retrying is an operator decision.
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    async fn dispatch(&self, server: &str, tool: &str, args: &Value) -> Result<Value, DispatchError>;
}

/// Dispatcher for servers registered with `transport: http`.
pub struct HttpDispatcher {
    client: Client,
    servers: BTreeMap<String, ServerDef>,
}

impl HttpDispatcher {
    pub fn new(servers: &ServersConfig) -> Self {
        Self::with_client(Client::new(), servers)
    }

    pub fn with_client(client: Client, servers: &ServersConfig) -> Self {
        Self {
            client,
            servers: servers
                .servers
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
        }
    }
}

#[async_trait]
impl ActionDispatcher for HttpDispatcher {
    async fn dispatch(&self, server: &str, tool: &str, args: &Value) -> Result<Value, DispatchError> {
        let target = self
            .servers
            .get(server)
            .ok_or_else(|| DispatchError::UnknownServer {
                name: server.to_string(),
            })?;
        debug!(server, tool, url = %target.base_url, "opening MCP session");

        let session = Session::open(&self.client, &target.base_url).await?;
        let result = session.call_tool(server, tool, args).await;
        session.close().await;
        result
    }
}

/// One MCP session with an action server.
struct Session<'a> {
    client: &'a Client,
    url: &'a str,
    id: Option<String>,
    protocol: String,
}

impl<'a> Session<'a> {
    /// Run the `initialize` handshake and remember the session id the server
    /// assigned, if any.
    async fn open(client: &'a Client, url: &'a str) -> Result<Session<'a>, DispatchError> {
        let mut session = Session {
            client,
            url,
            id: None,
            protocol: PROTOCOL_VERSION.to_string(),
        };
        let response = session
            .send(&rpc_request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {"name": "ctrl", "version": env!("CARGO_PKG_VERSION")},
                }),
            ))
            .await?;
        session.id = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let init = rpc_result(read_message(response).await?)?;
        if let Some(version) = init.get("protocolVersion").and_then(Value::as_str) {
            session.protocol = version.to_string();
        }
        debug!(session = ?session.id, protocol = %session.protocol, "MCP session initialized");

        session
            .send(&json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await?;
        Ok(session)
    }

    async fn call_tool(&self, server: &str, tool: &str, args: &Value) -> Result<Value, DispatchError> {
        if !self.offers_tool(tool).await? {
            return Err(DispatchError::UnknownTool {
                server: server.to_string(),
                tool: tool.to_string(),
            });
        }
        debug!(server, tool, "dispatching tools/call");
        let response = self
            .send(&rpc_request(
                "tools/call",
                json!({ "name": tool, "arguments": args }),
            ))
            .await?;
        read_tool_result(read_message(response).await?)
    }

    /// Walk `tools/list`, following `nextCursor`, until `tool` turns up.
    async fn offers_tool(&self, tool: &str) -> Result<bool, DispatchError> {
        let mut cursor: Option<String> = None;
        for _ in 0..MAX_TOOL_PAGES {
            let params = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({}),
            };
            let response = self.send(&rpc_request("tools/list", params)).await?;
            let page = rpc_result(read_message(response).await?)?;
            let listed = page
                .get("tools")
                .and_then(Value::as_array)
                .is_some_and(|tools| {
                    tools
                        .iter()
                        .any(|t| t.get("name").and_then(Value::as_str) == Some(tool))
                });
            if listed {
                return Ok(true);
            }
            match page.get("nextCursor").and_then(Value::as_str) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => return Ok(false),
            }
        }
        Ok(false)
    }

    /// End the session. Servers may refuse with 405; that is not an error.
    async fn close(self) {
        let Some(id) = self.id.as_deref() else { return };
        if let Err(e) = self.request(Method::DELETE).send().await {
            debug!(session = id, error = %e, "MCP session close failed");
        }
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, self.url)
            .header(ACCEPT, "application/json, text/event-stream")
            .header(PROTOCOL_HEADER, self.protocol.as_str());
        if let Some(id) = &self.id {
            builder = builder.header(SESSION_HEADER, id.as_str());
        }
        builder
    }

    async fn send(&self, body: &Value) -> Result<Response, DispatchError> {
        Ok(self
            .request(Method::POST)
            .json(body)
            .send()
            .await?
            .error_for_status()?)
    }
}

fn rpc_request(method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": Uuid::new_v4().to_string(),
        "method": method,
        "params": params,
    })
}

/// Body of a JSON-RPC response, from either content type.
async fn read_message(response: Response) -> Result<Value, DispatchError> {
    let is_stream = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"));
    let text = response.text().await?;
    if is_stream {
        last_event_data(&text)
    } else {
        serde_json::from_str(&text).map_err(|e| DispatchError::InvalidResponse {
            detail: e.to_string(),
        })
    }
}

/// The JSON payload of the last `data:` line of an event stream.
fn last_event_data(stream: &str) -> Result<Value, DispatchError> {
    let data = stream
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .last()
        .ok_or_else(|| DispatchError::InvalidResponse {
            detail: "event stream carried no data".to_string(),
        })?;
    serde_json::from_str(data).map_err(|e| DispatchError::InvalidResponse {
        detail: e.to_string(),
    })
}

/// The `result` member of a JSON-RPC response, or its error.
fn rpc_result(mut message: Value) -> Result<Value, DispatchError> {
    if let Some(error) = message.get("error") {
        return Err(DispatchError::Remote {
            code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
        });
    }
    message
        .get_mut("result")
        .map(Value::take)
        .ok_or_else(|| DispatchError::InvalidResponse {
            detail: "response has neither result nor error".to_string(),
        })
}

/// Unwrap a `tools/call` response into the tool result.
fn read_tool_result(message: Value) -> Result<Value, DispatchError> {
    let result = rpc_result(message)?;
    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(DispatchError::Remote {
            code: TOOL_ERROR_CODE,
            message: content_text(&result).unwrap_or_else(|| result.to_string()),
        });
    }
    Ok(result)
}

/// Concatenated text parts of an MCP `content` array.
fn content_text(result: &Value) -> Option<String> {
    let parts: Vec<&str> = result
        .get("content")?
        .as_array()?
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    (!parts.is_empty()).then(|| parts.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_is_unwrapped() {
        let result = read_tool_result(json!({
            "jsonrpc": "2.0", "id": "1",
            "result": {"content": [{"type": "text", "text": "ok"}]}
        }))
        .unwrap();
        assert_eq!(result["content"][0]["text"], "ok");
    }

    #[test]
    fn rpc_and_tool_errors_become_remote_errors() {
        let err = read_tool_result(json!({"error": {"code": -32601, "message": "no such tool"}}))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Remote { code: -32601, .. }));

        let err = read_tool_result(json!({
            "result": {"isError": true, "content": [{"type": "text", "text": "quota exceeded"}]}
        }))
        .unwrap_err();
        match err {
            DispatchError::Remote { message, .. } => assert_eq!(message, "quota exceeded"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn event_stream_uses_last_data_line() {
        let stream = "event: message\ndata: {\"id\":1}\n\nevent: message\ndata: {\"result\":{\"v\":2}}\n\n";
        let message = last_event_data(stream).unwrap();
        assert_eq!(read_tool_result(message).unwrap(), json!({"v": 2}));
        assert!(last_event_data("event: ping\n\n").is_err());
    }

    #[tokio::test]
    async fn unknown_server_is_reported_without_network() {
        let dispatcher = HttpDispatcher::new(&ServersConfig::default());
        let err = dispatcher
            .dispatch("nowhere", "tool", &json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnknownServer { name } if name == "nowhere"));
    }
}
