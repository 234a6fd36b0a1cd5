// api.rs - HTTP routes for operators and agent adapters.
//
// Operator routes:
//   GET  /pending, /held        held requests, oldest first
//   GET  /requests?status&limit ledger scan, newest first
//   GET  /status/{id}           request, latest decision, result preview
//   POST /approve/{id}          approve and replay     body {approved_by}
//   POST /deny/{id}             deny                   body {approved_by}
//   GET  /alerts/stale          requests stuck in approved/executing
// Adapter routes:
//   POST /intercept             score, decide, record
//   POST /forward/{id}          dispatch an allowed request
//   POST /result/{id}           record the result of a self-forwarded call
//   POST /explain               dry run, writes nothing
//   GET  /healthz
//
// The ledger is a synchronous SQLite handle. Routes that only read or write
// the ledger run on the blocking pool. Approve and forward make one or two
// short conditional writes inline and then hand dispatch to its own task.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ctrl_gateway::{
    ActionDispatcher, ApprovalCoordinator, CoordinatorError, Explanation, Gateway, GatewayError,
    InterceptOutcome, RequestView, Resolution, ResolveOutcome, StaleAlert, DEFAULT_APPROVER,
};
use ctrl_ledger::{LedgerError, RequestRecord, RequestStatus};
use ctrl_risk::ToolCall;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Header an adapter may use to tag the environment of a call.
pub const ENV_HEADER: &str = "x-ctrl-env";

/// Shared state behind every route.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub coordinator: Arc<ApprovalCoordinator>,
    pub dispatcher: Arc<dyn ActionDispatcher>,
    pub dispatch_timeout: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/pending", get(held))
        .route("/held", get(held))
        .route("/requests", get(list_requests))
        .route("/status/{id}", get(status))
        .route("/approve/{id}", post(approve))
        .route("/deny/{id}", post(deny))
        .route("/alerts/stale", get(stale_alerts))
        .route("/intercept", post(intercept))
        .route("/forward/{id}", post(forward))
        .route("/result/{id}", post(record_result))
        .route("/explain", post(explain))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

// ── Errors ───────────────────────────────────────────────────────

pub enum ApiError {
    BadRequest(String),
    Internal(String),
    Coordinator(CoordinatorError),
    Gateway(GatewayError),
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        ApiError::Coordinator(e)
    }
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        ApiError::Gateway(e)
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        ApiError::Coordinator(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            ApiError::Internal(message) => {
                tracing::error!(error = %message, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, message)
            }
            ApiError::Coordinator(e) => {
                let status = match &e {
                    CoordinatorError::UnknownRequestId { .. } => StatusCode::NOT_FOUND,
                    CoordinatorError::AlreadyResolved { .. } => StatusCode::CONFLICT,
                    CoordinatorError::ExternalDispatchFailure { .. } => StatusCode::BAD_GATEWAY,
                    CoordinatorError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, e.to_string())
            }
            ApiError::Gateway(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ── Bodies ───────────────────────────────────────────────────────

/// Row shape for list endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct RequestSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub server: String,
    pub tool: String,
    pub env: String,
    pub status: RequestStatus,
    pub risk_mode: Option<String>,
    pub risk_score: Option<i64>,
}

impl From<RequestRecord> for RequestSummary {
    fn from(r: RequestRecord) -> Self {
        Self {
            id: r.id,
            created_at: r.created_at,
            server: r.server,
            tool: r.tool,
            env: r.env,
            status: r.status,
            risk_mode: r.risk_mode,
            risk_score: r.risk_score,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveBody {
    pub approved_by: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

/// A tool call as posted by an adapter. `env` falls back to the
/// `x-ctrl-env` header and then to the configured default.
#[derive(Debug, Deserialize)]
pub struct CallBody {
    pub server: String,
    pub tool: String,
    #[serde(default)]
    pub env: Option<String>,
    #[serde(default)]
    pub args: Option<Value>,
    #[serde(default)]
    pub actor: Option<String>,
}

impl CallBody {
    fn into_call(self, headers: &HeaderMap) -> ToolCall {
        let env = self
            .env
            .or_else(|| {
                headers
                    .get(ENV_HEADER)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            })
            .unwrap_or_default();
        let mut call = ToolCall::new(self.server, self.tool, env);
        if let Some(args) = self.args {
            call = call.with_args(args);
        }
        call.actor = self.actor;
        call
    }
}

/// Result reported by an adapter that forwarded an allowed call itself.
#[derive(Debug, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {e}")))
}

// ── Handlers ─────────────────────────────────────────────────────

/// Run synchronous ledger work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, ApiError>
where
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| ApiError::Internal(format!("ledger task failed: {e}")))?
}

async fn healthz(State(state): State<AppState>) -> ApiResult<Value> {
    let engines = state.gateway.engines()?;
    Ok(Json(json!({ "ok": true, "generation": engines.generation })))
}

async fn held(State(state): State<AppState>) -> ApiResult<Vec<RequestSummary>> {
    let held = blocking(move || Ok(state.coordinator.list_held()?)).await?;
    Ok(Json(held.into_iter().map(RequestSummary::from).collect()))
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<RequestSummary>> {
    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(
            s.parse::<RequestStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
        None => None,
    };
    let rows =
        blocking(move || Ok(state.gateway.ledger().list_requests(status, query.limit)?)).await?;
    Ok(Json(rows.into_iter().map(RequestSummary::from).collect()))
}

async fn status(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RequestView> {
    Ok(Json(blocking(move || Ok(state.coordinator.status(&id)?)).await?))
}

async fn approve(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<ResolveOutcome> {
    resolve(state, id, Resolution::Approve, body).await
}

async fn deny(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> ApiResult<ResolveOutcome> {
    resolve(state, id, Resolution::Deny, body).await
}

async fn resolve(
    state: AppState,
    id: String,
    resolution: Resolution,
    body: Bytes,
) -> ApiResult<ResolveOutcome> {
    let body: ResolveBody = parse_body(&body)?;
    let approver = body.approved_by.unwrap_or_else(|| DEFAULT_APPROVER.to_string());
    Ok(Json(state.coordinator.resolve(&id, resolution, &approver).await?))
}

async fn stale_alerts(State(state): State<AppState>) -> ApiResult<Vec<StaleAlert>> {
    Ok(Json(blocking(move || Ok(state.coordinator.stale_alerts()?)).await?))
}

async fn intercept(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CallBody>,
) -> ApiResult<InterceptOutcome> {
    let call = body.into_call(&headers);
    Ok(Json(blocking(move || Ok(state.gateway.intercept(call)?)).await?))
}

async fn forward(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Value> {
    let result = state
        .gateway
        .forward(&id, Arc::clone(&state.dispatcher), state.dispatch_timeout)
        .await?;
    Ok(Json(json!({ "ok": true, "request_id": id, "result": result })))
}

async fn record_result(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ResultBody>,
) -> ApiResult<Value> {
    let outcome = match (body.result, body.error) {
        (_, Some(error)) => Err(error),
        (Some(result), None) => Ok(result),
        (None, None) => return Err(ApiError::BadRequest("one of result or error is required".into())),
    };
    let record = blocking(move || Ok(state.gateway.record_forward_result(&id, outcome)?)).await?;
    Ok(Json(json!({ "ok": true, "request_id": record.id, "status": record.status })))
}

async fn explain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CallBody>,
) -> ApiResult<Explanation> {
    Ok(Json(state.gateway.explain(&body.into_call(&headers))?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use ctrl_gateway::{DispatchError, EngineSet};
    use ctrl_ledger::Ledger;
    use ctrl_policy::{Effect, PolicyConfig, PolicyEngine, PolicyMatch, PolicyRule};
    use ctrl_risk::{RiskConfig, RiskEngine};
    use tower::ServiceExt;

    struct EchoDispatcher;

    #[async_trait]
    impl ActionDispatcher for EchoDispatcher {
        async fn dispatch(&self, _server: &str, tool: &str, args: &Value) -> Result<Value, DispatchError> {
            Ok(json!({ "tool": tool, "args": args }))
        }
    }

    fn app() -> Router {
        let policy = PolicyConfig::new(vec![
            PolicyRule::new("mail-review", PolicyMatch::new("mail", "*", "*"), Effect::Hold)
                .with_reason("outbound mail is reviewed"),
            PolicyRule::new("dev-open", PolicyMatch::new("*", "*", "dev"), Effect::Allow),
        ]);
        let ledger = Ledger::in_memory().unwrap();
        let gateway = Gateway::new(
            ledger.clone(),
            EngineSet::new(
                RiskEngine::new(&RiskConfig::minimal()).unwrap(),
                PolicyEngine::new(&policy).unwrap(),
            ),
        );
        let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(EchoDispatcher);
        router(AppState {
            gateway: Arc::new(gateway),
            coordinator: Arc::new(ApprovalCoordinator::new(ledger, Arc::clone(&dispatcher))),
            dispatcher,
            dispatch_timeout: Duration::from_secs(5),
        })
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                builder = builder.header("content-type", "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn hold_approve_and_status_over_http() {
        let app = app();
        let (code, out) = call(
            &app,
            "POST",
            "/intercept",
            Some(json!({"server": "mail", "tool": "send", "env": "prod", "args": {"to": "a@b.c"}})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(out["verdict"], "hold");
        let id = out["request_id"].as_str().unwrap().to_string();

        let (_, pending) = call(&app, "GET", "/pending", None).await;
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["id"], id.as_str());

        let (code, resolved) = call(
            &app,
            "POST",
            &format!("/approve/{id}"),
            Some(json!({"approved_by": "alice"})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(resolved["status"], "executed");

        let (code, again) = call(&app, "POST", &format!("/deny/{id}"), None).await;
        assert_eq!(code, StatusCode::CONFLICT);
        assert!(again["error"].as_str().unwrap().contains("already resolved"));

        let (_, view) = call(&app, "GET", &format!("/status/{id}"), None).await;
        assert_eq!(view["request"]["status"], "executed");
        assert_eq!(view["latest_decision"]["decided_by"], "alice");
        assert!(view["result_preview"].as_str().unwrap().contains("send"));
    }

    #[tokio::test]
    async fn env_header_and_forwarding() {
        let app = app();
        let request = Request::builder()
            .method("POST")
            .uri("/intercept")
            .header("content-type", "application/json")
            .header(ENV_HEADER, "dev")
            .body(Body::from(json!({"server": "github", "tool": "list"}).to_string()))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let out: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(out["verdict"], "allow");
        let id = out["request_id"].as_str().unwrap().to_string();

        let (code, forwarded) = call(&app, "POST", &format!("/forward/{id}"), None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(forwarded["result"]["tool"], "list");

        let (_, rows) = call(&app, "GET", "/requests?status=executed&limit=5", None).await;
        assert_eq!(rows.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lookup_and_validation_errors() {
        let app = app();
        let (code, _) = call(&app, "GET", "/status/nope", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, _) = call(&app, "GET", "/requests?status=paused", None).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        let (code, _) = call(&app, "POST", "/approve/nope", None).await;
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, body) = call(&app, "GET", "/healthz", None).await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["generation"], 1);
        let (code, stale) = call(&app, "GET", "/alerts/stale", None).await;
        assert_eq!(code, StatusCode::OK);
        assert!(stale.as_array().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_ledger_routes_all_complete() {
        let app = app();
        let tasks: Vec<_> = (0..24)
            .map(|n| {
                let app = app.clone();
                tokio::spawn(async move {
                    let server = if n % 3 == 0 { "mail" } else { "github" };
                    call(
                        &app,
                        "POST",
                        "/intercept",
                        Some(json!({"server": server, "tool": "op", "env": "dev", "args": {"n": n}})),
                    )
                    .await
                })
            })
            .collect();
        for task in tasks {
            let (code, out) = task.await.unwrap();
            assert_eq!(code, StatusCode::OK);
            assert!(out["request_id"].is_string());
        }

        let (_, rows) = call(&app, "GET", "/requests?limit=100", None).await;
        assert_eq!(rows.as_array().unwrap().len(), 24);
        let (_, held) = call(&app, "GET", "/held", None).await;
        assert_eq!(held.as_array().unwrap().len(), 8);
    }

    #[tokio::test]
    async fn explain_is_a_dry_run() {
        let app = app();
        let (code, out) = call(
            &app,
            "POST",
            "/explain",
            Some(json!({"server": "mail", "tool": "send", "env": "dev"})),
        )
        .await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(out["trace"]["decision"]["verdict"], "hold");
        assert_eq!(out["risk"]["mode"], "safe");
        let (_, rows) = call(&app, "GET", "/requests", None).await;
        assert!(rows.as_array().unwrap().is_empty());
    }
}
