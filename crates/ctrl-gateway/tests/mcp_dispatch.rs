// HttpDispatcher against a local MCP server: session handshake, tool
// discovery and the call itself.

use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use ctrl_gateway::{ActionDispatcher, DispatchError, HttpDispatcher, ServersConfig, PROTOCOL_VERSION};
use serde_json::{json, Value};

const SESSION: &str = "session-7f3a";

#[derive(Default)]
struct Mock {
    /// Issue a session id on `initialize` and require it afterwards.
    stateful: bool,
    /// `(method, session header, protocol header)` per request received.
    seen: Mutex<Vec<(String, Option<String>, Option<String>)>>,
}

impl Mock {
    fn methods(&self) -> Vec<String> {
        self.seen.lock().unwrap().iter().map(|(m, _, _)| m.clone()).collect()
    }
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn reply(id: &Value, result: Value) -> Response {
    Json(json!({"jsonrpc": "2.0", "id": id, "result": result})).into_response()
}

async fn rpc(State(mock): State<Arc<Mock>>, headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let method = body["method"].as_str().unwrap_or_default().to_string();
    let session = header(&headers, "mcp-session-id");
    mock.seen.lock().unwrap().push((
        method.clone(),
        session.clone(),
        header(&headers, "mcp-protocol-version"),
    ));
    let id = &body["id"];

    if method == "initialize" {
        let result = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock-cms", "version": "1.0.0"},
        });
        let mut response = reply(id, result);
        if mock.stateful {
            response
                .headers_mut()
                .insert("mcp-session-id", SESSION.parse().unwrap());
        }
        return response;
    }
    if mock.stateful && session.as_deref() != Some(SESSION) {
        return (StatusCode::BAD_REQUEST, "missing or unknown session").into_response();
    }

    match method.as_str() {
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => match body["params"]["cursor"].as_str() {
            None => reply(
                id,
                json!({"tools": [{"name": "list_posts", "inputSchema": {"type": "object"}}], "nextCursor": "page-2"}),
            ),
            Some(_) => reply(
                id,
                json!({"tools": [{"name": "publish_post", "inputSchema": {"type": "object"}}]}),
            ),
        },
        "tools/call" => {
            let message = json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {"content": [{"type": "text", "text": format!("published {}", body["params"]["arguments"]["title"])}]},
            });
            (
                [(CONTENT_TYPE, "text/event-stream")],
                format!("event: message\ndata: {message}\n\n"),
            )
                .into_response()
        }
        _ => Json(json!({"jsonrpc": "2.0", "id": id, "error": {"code": -32601, "message": "method not found"}}))
            .into_response(),
    }
}

async fn end_session(State(mock): State<Arc<Mock>>, headers: HeaderMap) -> StatusCode {
    mock.seen
        .lock()
        .unwrap()
        .push(("DELETE".to_string(), header(&headers, "mcp-session-id"), None));
    StatusCode::OK
}

/// Serve the mock on an ephemeral port and point a dispatcher at it.
async fn serve(stateful: bool) -> (HttpDispatcher, Arc<Mock>) {
    let mock = Arc::new(Mock {
        stateful,
        ..Mock::default()
    });
    let app = Router::new()
        .route("/mcp", post(rpc).delete(end_session))
        .with_state(Arc::clone(&mock));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let servers = ServersConfig::from_yaml(&format!(
        "servers:\n  - {{name: cms, transport: http, base_url: \"http://{addr}/mcp\"}}\n"
    ))
    .unwrap();
    (HttpDispatcher::new(&servers), mock)
}

#[tokio::test]
async fn session_handshake_precedes_the_tool_call() {
    let (dispatcher, mock) = serve(true).await;
    let result = dispatcher
        .dispatch("cms", "publish_post", &json!({"title": "Q3"}))
        .await
        .unwrap();
    assert_eq!(result["content"][0]["text"], "published \"Q3\"");

    assert_eq!(
        mock.methods(),
        [
            "initialize",
            "notifications/initialized",
            "tools/list",
            "tools/list",
            "tools/call",
            "DELETE",
        ]
    );
    let seen = mock.seen.lock().unwrap();
    assert_eq!(seen[0].1, None);
    for (method, session, _) in seen.iter().skip(1) {
        assert_eq!(session.as_deref(), Some(SESSION), "{method} sent without the session");
    }
    let call = seen.iter().find(|(m, _, _)| m == "tools/call").unwrap();
    assert_eq!(call.2.as_deref(), Some(PROTOCOL_VERSION));
}

#[tokio::test]
async fn unknown_tool_is_rejected_before_calling() {
    let (dispatcher, mock) = serve(true).await;
    let err = dispatcher
        .dispatch("cms", "drop_database", &json!({}))
        .await
        .unwrap_err();
    assert!(
        matches!(&err, DispatchError::UnknownTool { server, tool } if server == "cms" && tool == "drop_database"),
        "{err:?}"
    );
    assert!(!mock.methods().iter().any(|m| m == "tools/call"));
    assert_eq!(mock.methods().last().map(String::as_str), Some("DELETE"));
}

#[tokio::test]
async fn stateless_server_needs_no_session() {
    let (dispatcher, mock) = serve(false).await;
    dispatcher
        .dispatch("cms", "publish_post", &json!({"title": "draft"}))
        .await
        .unwrap();
    let methods = mock.methods();
    assert_eq!(methods.first().map(String::as_str), Some("initialize"));
    assert!(methods.iter().any(|m| m == "tools/call"));
    // No session was issued, so there is none to end.
    assert!(!methods.iter().any(|m| m == "DELETE"));
}
