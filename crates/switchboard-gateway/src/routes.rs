//! Gateway routes.
//!
//! `POST /v1/chat/completions` is the hot path: validate, admit under the
//! global semaphore, capture one config snapshot, parse the model prefix,
//! and hand the request to the right producer. Producers write into a
//! bounded token stream; this module only translates that stream into the
//! client's dialect. The gateway never retries a user request on its own;
//! only the idempotent runner lookups in the admin handlers retry.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};
use ulid::Ulid;

use switchboard_core::{
    AuthVerdict, ModelSpec, QualityTier, Severity, StageOutcome, TokenSink, TokenStream,
};
use switchboard_protocol::{ErrorBody, ErrorKind, ServiceError};
use switchboard_providers::wire::ModelEntry;
use switchboard_providers::{ChatCompletionRequest, ProviderError};

use crate::openai::{collect_events, completion_envelope, validate_chat_request, SseFrames};
use crate::state::GatewayState;

/// Build the public router.
pub fn build_router(state: GatewayState) -> Router {
    let public = Router::new().route("/health", get(health));

    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models))
        .route("/admin/reload", post(reload))
        .route("/admin/system-status", get(system_status))
        .route("/metrics", get(render_metrics))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    public
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

async fn require_auth(
    State(state): State<GatewayState>,
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
        AuthVerdict::Denied => {
            error_response(&ServiceError::auth("missing or invalid token"), false)
        }
    }
}

fn error_response(error: &ServiceError, budget_as_payment: bool) -> Response {
    let status = StatusCode::from_u16(error.kind.http_status(budget_as_payment))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json::<ErrorBody>(error.to_body())).into_response()
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "ok": true}))
}

async fn chat_completions(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(body): Json<ChatCompletionRequest>,
) -> Response {
    // One snapshot per request, captured at admission.
    let snapshot = state.core.config.snapshot();
    let budget_as_payment = snapshot.gateway.budget_as_payment;

    if let Err(error) = validate_chat_request(&body) {
        return error_response(&error, budget_as_payment);
    }

    let deadline = Duration::from_secs(snapshot.gateway.request_deadline_secs);
    if deadline.is_zero() {
        return error_response(
            &ServiceError::timeout("request deadline is zero"),
            budget_as_payment,
        );
    }

    let permit = match state.admission.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            metrics::counter!("switchboard_admission_rejected_total").increment(1);
            let error =
                ServiceError::unavailable("too many in-flight requests").with_retry_after(1);
            return (StatusCode::TOO_MANY_REQUESTS, Json::<ErrorBody>(error.to_body()))
                .into_response();
        }
    };

    let request_id = headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| Ulid::from_string(raw).ok())
        .unwrap_or_else(Ulid::new);
    let rid = request_id.to_string();
    let quality_tier: QualityTier = headers
        .get("x-quality-tier")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.parse().ok())
        .unwrap_or_default();

    // Bare names resolve to a locally served model, then the default.
    let spec = match ModelSpec::parse(&body.model) {
        ModelSpec::Named(name) if snapshot.is_local_model(&name) => ModelSpec::Local(name),
        ModelSpec::Named(_) => ModelSpec::parse(&snapshot.gateway.default_model),
        parsed => parsed,
    };
    let model_label = spec.to_string();
    let wants_stream = body.stream;

    state.core.observability.start_stage(&rid, "admission");
    state.core.observability.end_stage(&rid, "admission", StageOutcome::Ok);
    state.core.observability.record_event(
        "request_admitted",
        Severity::Debug,
        json!({"request_id": rid, "model": model_label, "tier": quality_tier, "stream": wants_stream}),
    );
    debug!(request = %rid, model = %model_label, stream = wants_stream, "request admitted");

    let (sink, stream) = TokenStream::channel(64);
    {
        let state = state.clone();
        let rid = rid.clone();
        let spec = spec.clone();
        let fail_sink = sink.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let produced = tokio::time::timeout(
                deadline,
                produce(state.clone(), spec, body, rid.clone(), quality_tier, sink),
            )
            .await;
            if produced.is_err() {
                let _ = fail_sink
                    .fail(ErrorKind::Timeout, "request deadline exceeded")
                    .await;
                state.core.observability.finish_request(&rid, StageOutcome::Failed);
            }
        });
    }

    if wants_stream {
        let mut frames = SseFrames::new(format!("chatcmpl-{rid}"), model_label);
        let sse_stream = ReceiverStream::new(stream.into_inner()).flat_map(move |event| {
            let payloads = frames.render(&event);
            futures::stream::iter(
                payloads
                    .into_iter()
                    .map(|payload| Ok::<Event, Infallible>(Event::default().data(payload))),
            )
        });
        let mut response = Sse::new(sse_stream)
            .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
            .into_response();
        echo_request_id(&mut response, &rid);
        response
    } else {
        let collected = collect_events(stream.collect_all().await);
        if let Some(error) = collected.error {
            return error_response(&error, budget_as_payment);
        }
        let mut response =
            Json(completion_envelope(&format!("chatcmpl-{rid}"), &model_label, &collected))
                .into_response();
        echo_request_id(&mut response, &rid);
        response
    }
}

fn echo_request_id(response: &mut Response, rid: &str) {
    if let Ok(value) = rid.parse() {
        response.headers_mut().insert("x-request-id", value);
    }
}

/// Drive one admitted request to completion, writing into `sink`.
async fn produce(
    state: GatewayState,
    spec: ModelSpec,
    body: ChatCompletionRequest,
    rid: String,
    quality_tier: QualityTier,
    sink: TokenSink,
) {
    state.core.observability.start_stage(&rid, "completion");
    let allow_fallback = true;

    let outcome = match &spec {
        ModelSpec::Agent(_) => {
            match state
                .runner
                .stream_agent(&body, &rid, quality_tier, allow_fallback, sink.clone())
                .await
            {
                Ok(()) => StageOutcome::Ok,
                Err(error) => {
                    let _ = sink.fail(error.kind, error.message.clone()).await;
                    StageOutcome::Failed
                }
            }
        }
        _ => {
            // Incoming `tools` never pass through; the runner decides tool
            // exposure.
            let mut request = body;
            request.tools = None;
            match state.providers.stream_completion(&spec, request, allow_fallback, sink).await {
                Ok(_served) => StageOutcome::Ok,
                Err(ProviderError::Cancelled) => StageOutcome::Cancelled,
                Err(_) => StageOutcome::Failed,
            }
        }
    };

    state.core.observability.end_stage(&rid, "completion", outcome);
    state.core.observability.finish_request(&rid, outcome);
}

async fn models(State(state): State<GatewayState>) -> Json<Value> {
    let mut entries = state.providers.list_models();
    // The agent capability set rides alongside the provider catalog.
    entries.push(ModelEntry::new("agent:mcp"));
    Json(json!({"object": "list", "data": entries}))
}

async fn reload(State(state): State<GatewayState>) -> Response {
    match state.core.config.reload() {
        Ok(outcome) => {
            state.providers.sync();
            let runner_reloaded = state.runner.reload().await;
            info!(?outcome, runner_reloaded, "configuration reloaded");
            Json(json!({
                "reloaded": true,
                "runner_reloaded": runner_reloaded,
                "version": state.core.config.snapshot().version,
            }))
            .into_response()
        }
        Err(error) => error_response(&ServiceError::validation(error.to_string()), false),
    }
}

async fn system_status(State(state): State<GatewayState>) -> Json<Value> {
    let observability = state.core.observability.export_snapshot();
    let runner = state.runner.fetch_status().await;
    Json(json!({
        "tempo": {
            "uptime_secs": state.started_at.elapsed().as_secs(),
            "now": chrono::Utc::now().to_rfc3339(),
        },
        "active_requests": state.core.observability.active_request_count(),
        "breakers": state.core.breakers.snapshot(),
        "providers": state.providers.summaries(),
        "budget": state.core.budget.snapshot(),
        "component_health": observability.component_health,
        "dropped_events": observability.dropped_events,
        "runner": runner,
    }))
}

async fn render_metrics(State(state): State<GatewayState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::RunnerClient;
    use axum::body::Body;
    use metrics_exporter_prometheus::PrometheusHandle;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use switchboard_core::config::{
        FallbackSettings, ProviderKind, ProviderSettings, Snapshot,
    };
    use switchboard_core::{ConfigStore, Core};
    use switchboard_providers::ProviderRegistry;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

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

    fn snapshot_with_local(base_url: String) -> Snapshot {
        Snapshot {
            providers: vec![ProviderSettings {
                id: "ollama".into(),
                kind: ProviderKind::Local,
                base_url,
                api_key: None,
                api_key_env: None,
                models: vec!["tiny".into()],
                probe_interval_secs: 3_600,
            }],
            fallback: FallbackSettings { enabled: true, model: "local:tiny".into() },
            ..Snapshot::default()
        }
    }

    fn gateway(snapshot: Snapshot) -> GatewayState {
        let core = Core::new(ConfigStore::from_snapshot(snapshot));
        let providers = ProviderRegistry::new(core.clone());
        let runner = RunnerClient::new("http://127.0.0.1:1", None, Duration::from_millis(200));
        GatewayState::new(core, providers, runner, metrics_handle())
    }

    async fn send(
        router: Router,
        method_name: &str,
        uri: &str,
        peer: [u8; 4],
        body: Option<Value>,
    ) -> (StatusCode, String) {
        let builder = Request::builder().method(method_name).uri(uri);
        let mut request = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((peer, 4242))));
        let response = router.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1 << 22).await.unwrap();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    fn chat_body(model: &str, stream: bool) -> Value {
        json!({
            "model": model,
            "messages": [{"role": "user", "content": "ping"}],
            "stream": stream,
        })
    }

    async fn mount_completion(server: &MockServer) {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"po\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ng\"},\"finish_reason\":\"stop\"}],",
            "\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":2,\"total_tokens\":3}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn plain_completion_against_local_provider() {
        let server = MockServer::start().await;
        mount_completion(&server).await;

        let state = gateway(snapshot_with_local(format!("{}/v1", server.uri())));
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("local:tiny", false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["choices"][0]["message"]["role"], json!("assistant"));
        assert_eq!(value["choices"][0]["message"]["content"], json!("pong"));
        assert_eq!(value["usage"]["total_tokens"], json!(3));
    }

    #[tokio::test]
    async fn streaming_completion_emits_frames_and_done() {
        let server = MockServer::start().await;
        mount_completion(&server).await;

        let state = gateway(snapshot_with_local(format!("{}/v1", server.uri())));
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("local:tiny", true)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let data_frames = body.matches("data: ").count();
        assert!(data_frames >= 3, "expected several SSE frames, got: {body}");
        assert!(body.trim_end().ends_with("data: [DONE]"));
        assert!(body.contains("\"content\":\"po\""));
    }

    #[tokio::test]
    async fn empty_messages_are_rejected() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(json!({"model": "local:tiny", "messages": [], "stream": false})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("validation_error"));
    }

    #[tokio::test]
    async fn unknown_model_is_not_found() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("ghost:model", false)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body.contains("not_found"));
    }

    #[tokio::test]
    async fn zero_deadline_times_out_without_upstream_calls() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut snapshot = snapshot_with_local(format!("{}/v1", server.uri()));
        snapshot.gateway.request_deadline_secs = 0;
        let router = build_router(gateway(snapshot));

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("local:tiny", false)),
        )
        .await;
        assert_eq!(status, StatusCode::GATEWAY_TIMEOUT);
        assert!(body.contains("timeout"));
    }

    #[tokio::test]
    async fn admission_cap_rejects_with_retry_after() {
        let mut snapshot = snapshot_with_local("http://127.0.0.1:1/v1".into());
        snapshot.gateway.max_concurrency = 1;
        let state = gateway(snapshot);
        // Exhaust the only permit.
        let _held = state.admission.clone().try_acquire_owned().unwrap();
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("local:tiny", false)),
        )
        .await;
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert!(body.contains("retry_after"));
    }

    #[tokio::test]
    async fn loopback_only_when_no_token_is_configured() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);

        let (status, _) = send(router.clone(), "GET", "/v1/models", [127, 0, 0, 1], None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(router, "GET", "/v1/models", [203, 0, 113, 9], None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body.contains("authentication_error"));

        // Health stays public either way.
    }

    #[tokio::test]
    async fn health_is_public_from_anywhere() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);
        let (status, body) = send(router, "GET", "/health", [203, 0, 113, 9], None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("\"ok\":true"));
    }

    #[tokio::test]
    async fn model_listing_includes_the_agent_capability() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);
        let (status, body) = send(router, "GET", "/v1/models", [127, 0, 0, 1], None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        let ids: Vec<&str> =
            value["data"].as_array().unwrap().iter().map(|m| m["id"].as_str().unwrap()).collect();
        assert!(ids.contains(&"local:tiny"));
        assert!(ids.contains(&"agent:mcp"));
    }

    #[tokio::test]
    async fn bare_model_names_resolve_to_local_models() {
        let server = MockServer::start().await;
        mount_completion(&server).await;

        let state = gateway(snapshot_with_local(format!("{}/v1", server.uri())));
        let router = build_router(state);

        let (status, body) = send(
            router,
            "POST",
            "/v1/chat/completions",
            [127, 0, 0, 1],
            Some(chat_body("tiny", false)),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["model"], json!("local:tiny"));
    }

    #[tokio::test]
    async fn reload_is_idempotent_for_unchanged_input() {
        // Env-backed store: consecutive reloads of identical input keep the
        // same version and report success either way.
        let core = Core::new(ConfigStore::load(None).unwrap());
        let providers = ProviderRegistry::new(core.clone());
        let runner = RunnerClient::new("http://127.0.0.1:1", None, Duration::from_millis(200));
        let state = GatewayState::new(core.clone(), providers, runner, metrics_handle());
        let router = build_router(state);

        let version_before = core.config.snapshot().version.clone();
        let (status, body) = send(router.clone(), "POST", "/admin/reload", [127, 0, 0, 1], None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["reloaded"], json!(true));
        // The dead runner only affects the forwarded flag.
        assert_eq!(value["runner_reloaded"], json!(false));

        let (status, _) = send(router, "POST", "/admin/reload", [127, 0, 0, 1], None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(core.config.snapshot().version, version_before);
    }

    #[tokio::test]
    async fn system_status_tolerates_a_dead_runner() {
        let state = gateway(snapshot_with_local("http://127.0.0.1:1/v1".into()));
        let router = build_router(state);
        let (status, body) =
            send(router, "GET", "/admin/system-status", [127, 0, 0, 1], None).await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert!(value["tempo"]["uptime_secs"].is_number());
        assert_eq!(value["runner"], Value::Null);
    }
}
