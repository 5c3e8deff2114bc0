//! The runner's internal HTTP surface.
//!
//! Consumed by the gateway and by operators: health, detailed status, the
//! MCP roster, breaker administration, a raw tool-dispatch passthrough,
//! and the internal agent endpoint the gateway forwards `agent:*` traffic
//! to. The agent endpoint streams [`StreamEvent`] frames as SSE; the
//! OpenAI dialect facing the outside world is the gateway's business.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{header, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;
use ulid::Ulid;

use switchboard_core::{
    AuthVerdict, Core, ModelSpec, QualityTier, RequestEnvelope, TokenGate, TokenStream,
};
use switchboard_providers::wire::from_wire_message;
use switchboard_providers::{ChatCompletionRequest, ProviderRegistry};
use switchboard_protocol::{ErrorBody, ServiceError};

use crate::agent::AgentLoop;
use crate::catalog::{canonical_name, ToolCatalog};
use crate::dispatch::{ToolDispatcher, ToolOutcome};
use crate::roster::McpRoster;

/// Shared state of the runner service.
#[derive(Clone)]
pub struct RunnerState {
    /// The substrate.
    pub core: Core,
    /// Chat backends.
    pub providers: Arc<ProviderRegistry>,
    /// MCP fleet.
    pub roster: Arc<McpRoster>,
    /// Published tool catalog.
    pub catalog: Arc<ToolCatalog>,
    /// Breaker-wrapped dispatch.
    pub dispatcher: Arc<ToolDispatcher>,
    /// The loop.
    pub agent: Arc<AgentLoop>,
    /// Credential gate.
    pub gate: TokenGate,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// Process start, for uptime.
    pub started_at: Instant,
}

/// Build the runner router.
pub fn build_router(state: RunnerState) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/status", get(status))
        .route("/metrics", get(render_metrics))
        .route("/admin/mcp", get(mcp_roster))
        .route("/admin/breakers", get(breakers))
        .route("/admin/breakers/{target}/reset", post(reset_breaker))
        .route("/admin/mcp/tool", post(dispatch_tool))
        .route("/admin/reload", post(reload))
        .route("/v1/chat/completions", post(agent_completions))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_auth(
    State(state): State<RunnerState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match state.gate.check(authorization, peer.ip()) {
        AuthVerdict::Allowed => next.run(request).await,
        AuthVerdict::Denied => error_response(&ServiceError::auth("missing or invalid token")),
    }
}

fn error_response(error: &ServiceError) -> Response {
    let status =
        StatusCode::from_u16(error.kind.http_status(false)).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json::<ErrorBody>(error.to_body())).into_response()
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "ok": true}))
}

async fn status(State(state): State<RunnerState>) -> Json<Value> {
    let observability = state.core.observability.export_snapshot();
    Json(json!({
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "active_requests": state.core.observability.active_request_count(),
        "providers": state.providers.summaries(),
        "mcp_servers": state.roster.statuses(),
        "breakers": state.core.breakers.snapshot(),
        "budget": state.core.budget.snapshot(),
        "catalog_version": state.catalog.snapshot().version,
        "catalog_tools": state.catalog.snapshot().len(),
        "component_health": observability.component_health,
        "dropped_events": observability.dropped_events,
    }))
}

async fn render_metrics(State(state): State<RunnerState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

async fn mcp_roster(State(state): State<RunnerState>) -> Json<Value> {
    Json(json!({"servers": state.roster.statuses()}))
}

async fn breakers(State(state): State<RunnerState>) -> Json<Value> {
    Json(json!({"breakers": state.core.breakers.snapshot()}))
}

async fn reset_breaker(
    State(state): State<RunnerState>,
    Path(target): Path<String>,
) -> Response {
    if state.core.breakers.reset(&target) {
        Json(json!({"reset": target})).into_response()
    } else {
        error_response(&ServiceError::not_found(format!("no breaker for '{target}'")))
    }
}

#[derive(Debug, Deserialize)]
struct ToolPassthrough {
    server: String,
    tool: String,
    #[serde(default)]
    arguments: Value,
}

async fn dispatch_tool(
    State(state): State<RunnerState>,
    Json(body): Json<ToolPassthrough>,
) -> Json<Value> {
    let snapshot = state.core.config.snapshot();
    let deadline = Duration::from_secs(snapshot.timeouts.tool_call_secs.max(1));
    let name = if body.server == "fs" {
        format!("fs__{}", body.tool)
    } else {
        canonical_name(&body.server, &body.tool)
    };
    let dispatched = state.dispatcher.dispatch(&name, body.arguments, deadline).await;
    let (ok, detail) = match &dispatched.outcome {
        ToolOutcome::Ok(result) => (!result.is_error, result.joined_text()),
        other => (false, other.observation_text()),
    };
    Json(json!({
        "ok": ok,
        "tool": name,
        "result": detail,
        "elapsed_ms": dispatched.elapsed_ms,
    }))
}

async fn reload(State(state): State<RunnerState>) -> Response {
    match state.core.config.reload() {
        Ok(outcome) => {
            state.providers.sync();
            state.roster.resync().await;
            info!(?outcome, "configuration reloaded");
            Json(json!({"reloaded": true})).into_response()
        }
        Err(error) => error_response(&ServiceError::validation(error.to_string())),
    }
}

async fn agent_completions(
    State(state): State<RunnerState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    if !body.stream {
        return error_response(&ServiceError::validation(
            "the internal agent endpoint only serves streaming requests",
        ));
    }
    if body.messages.is_empty() {
        return error_response(&ServiceError::validation("messages must not be empty"));
    }

    let snapshot = state.core.config.snapshot();
    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Ulid::from_string(raw).ok())
        .unwrap_or_else(Ulid::new);
    let quality_tier = headers
        .get("x-quality-tier")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(QualityTier::Balanced);
    let allow_fallback = headers
        .get("x-allow-fallback")
        .and_then(|value| value.to_str().ok())
        .map(|raw| raw != "false")
        .unwrap_or(true);

    let envelope = RequestEnvelope {
        request_id,
        model_spec: ModelSpec::parse(&body.model),
        messages: body.messages.iter().map(from_wire_message).collect(),
        stream: true,
        quality_tier,
        temperature: body.temperature,
        deadline: Instant::now()
            + Duration::from_secs(snapshot.gateway.request_deadline_secs.max(1)),
        allow_fallback,
    };

    let (sink, stream) = TokenStream::channel(64);
    let agent = state.agent.clone();
    tokio::spawn(async move {
        agent.run(envelope, sink).await;
    });

    let sse_stream = ReceiverStream::new(stream.into_inner()).map(|event| {
        let payload = serde_json::to_string(&event)
            .unwrap_or_else(|_| "{\"type\":\"error\",\"kind\":\"internal\"}".to_owned());
        Ok::<Event, Infallible>(Event::default().data(payload))
    });

    let mut response = Sse::new(sse_stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    response.headers_mut().insert(
        "x-request-id",
        request_id.to_string().parse().unwrap_or_else(|_| header::HeaderValue::from_static("")),
    );
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selector::{Judge, JudgeReply, MaitreD};
    use async_trait::async_trait;
    use axum::body::Body;
    use pretty_assertions::assert_eq;
    use switchboard_core::config::Snapshot;
    use switchboard_core::ConfigStore;
    use switchboard_providers::ProviderError;
    use tower::ServiceExt;

    struct NoJudge;
    #[async_trait]
    impl Judge for NoJudge {
        async fn classify(
            &self,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<JudgeReply, ProviderError> {
            Err(ProviderError::Timeout)
        }
    }

    fn state(auth_token: Option<&str>) -> RunnerState {
        let mut snapshot = Snapshot::default();
        snapshot.gateway.auth_token = auth_token.map(str::to_owned);
        snapshot.fs.root = std::env::temp_dir().join("switchboard-service-tests");
        let core = Core::new(ConfigStore::from_snapshot(snapshot));
        let providers = ProviderRegistry::new(core.clone());
        let catalog = Arc::new(ToolCatalog::new());
        let roster = McpRoster::new(core.clone(), catalog.clone());
        let dispatcher = Arc::new(ToolDispatcher::new(core.clone(), roster.clone()));
        let selector = Arc::new(MaitreD::new(core.clone(), Arc::new(NoJudge)));
        let agent = Arc::new(AgentLoop::new(
            core.clone(),
            providers.clone(),
            dispatcher.clone(),
            selector,
            catalog.clone(),
        ));
        RunnerState {
            gate: TokenGate::new(core.config.snapshot().gateway.auth_token.clone()),
            core,
            providers,
            roster,
            catalog,
            dispatcher,
            agent,
            metrics: metrics_handle(),
            started_at: Instant::now(),
        }
    }

    fn metrics_handle() -> PrometheusHandle {
        use std::sync::OnceLock;
        static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
        HANDLE
            .get_or_init(|| {
                metrics_exporter_prometheus::PrometheusBuilder::new()
                    .install_recorder()
                    .expect("prometheus recorder")
            })
            .clone()
    }

    async fn request(
        router: Router,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let mut request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        // The auth middleware extracts ConnectInfo; fake a loopback peer.
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([127, 0, 0, 1], 9))));
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, value)
    }

    #[tokio::test]
    async fn health_is_public() {
        let router = build_router(state(Some("sekrit")));
        let (status, body) = request(router, "GET", "/health", None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(true));
    }

    #[tokio::test]
    async fn status_requires_the_token() {
        let router = build_router(state(Some("sekrit")));
        let (status, body) = request(router.clone(), "GET", "/status", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"]["code"], json!("authentication_error"));

        let (status, body) = request(router, "GET", "/status", Some("sekrit"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["uptime_secs"].is_number());
        assert!(body["mcp_servers"].is_array());
    }

    #[tokio::test]
    async fn breaker_reset_round_trip() {
        let state = state(None);
        state.core.breakers.record_failure("mcp:flaky", "down");
        let router = build_router(state);

        let (status, _) =
            request(router.clone(), "POST", "/admin/breakers/mcp:flaky/reset", None, None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) =
            request(router, "POST", "/admin/breakers/ghost/reset", None, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("not_found"));
    }

    #[tokio::test]
    async fn tool_passthrough_reaches_the_dispatcher() {
        let router = build_router(state(None));
        let (status, body) = request(
            router,
            "POST",
            "/admin/mcp/tool",
            None,
            Some(json!({"server": "ghost", "tool": "probe", "arguments": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], json!(false));
        assert_eq!(body["tool"], json!("mcp__ghost__probe"));
    }

    #[tokio::test]
    async fn agent_endpoint_rejects_non_streaming_requests() {
        let router = build_router(state(None));
        let (status, body) = request(
            router,
            "POST",
            "/v1/chat/completions",
            None,
            Some(json!({
                "model": "agent:mcp",
                "messages": [{"role": "user", "content": "hi"}],
                "stream": false
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], json!("validation_error"));
    }
}
