//! Gateway-side client for the runner's internal surface.
//!
//! Agent traffic is forwarded to the runner's SSE endpoint and the frames
//! (which are internal [`StreamEvent`] JSON) pass straight through into
//! the request's token stream. The configured bearer token is forwarded
//! explicitly on every call; admin lookups are idempotent and retried
//! once.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use switchboard_core::{QualityTier, StreamEvent, TokenSink};
use switchboard_protocol::ServiceError;
use switchboard_providers::sse::{SseDecoder, SseFrame};
use switchboard_providers::ChatCompletionRequest;

/// HTTP client for one runner base URL.
#[derive(Debug)]
pub struct RunnerClient {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
    admin_timeout: Duration,
}

impl RunnerClient {
    /// Client for the runner at `base_url`.
    pub fn new(
        base_url: impl Into<String>,
        auth_token: Option<String>,
        admin_timeout: Duration,
    ) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        let base_url: String = base_url.into();
        Arc::new(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            auth_token,
            client,
            admin_timeout,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Forward one agent request, pumping frames into `sink` until the
    /// runner finishes. The sink sees exactly what the agent loop emitted,
    /// including the terminal `Done` or `Error` frame.
    pub async fn stream_agent(
        &self,
        request: &ChatCompletionRequest,
        request_id: &str,
        quality_tier: QualityTier,
        allow_fallback: bool,
        sink: TokenSink,
    ) -> Result<(), ServiceError> {
        let mut request = request.clone();
        request.stream = true;

        let tier = match quality_tier {
            QualityTier::Speed => "speed",
            QualityTier::Balanced => "balanced",
            QualityTier::High => "high",
        };
        let url = format!("{}/v1/chat/completions", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .header("x-request-id", request_id)
            .header("x-quality-tier", tier)
            .header("x-allow-fallback", if allow_fallback { "true" } else { "false" })
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                ServiceError::unavailable(format!("runner unreachable: {e}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(%status, "runner rejected agent request");
            return Err(ServiceError::unavailable(format!(
                "runner answered {status}: {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let mut decoder = SseDecoder::new();
        let mut bytes = response.bytes_stream();
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk
                .map_err(|e| ServiceError::unavailable(format!("runner stream failed: {e}")))?;
            for frame in decoder.push(&chunk) {
                match frame {
                    SseFrame::Done => return Ok(()),
                    SseFrame::Data(payload) => {
                        match serde_json::from_str::<StreamEvent>(&payload) {
                            Ok(event) => {
                                let terminal =
                                    matches!(event, StreamEvent::Done | StreamEvent::Error { .. });
                                if sink.send(event).await.is_err() {
                                    // Client gone; dropping the response
                                    // body cancels the runner side.
                                    debug!("client disconnected during agent stream");
                                    return Ok(());
                                }
                                if terminal {
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!(error = %e, "unparseable runner frame skipped"),
                        }
                    }
                }
            }
        }
        // The runner ended the stream without a terminal frame.
        Err(ServiceError::unavailable("runner stream ended unexpectedly"))
    }

    /// Fetch the runner's detailed status. Idempotent; retried once.
    pub async fn fetch_status(&self) -> Option<Value> {
        for attempt in 0..2 {
            let url = format!("{}/status", self.base_url);
            let result = self
                .authorized(self.client.get(&url))
                .timeout(self.admin_timeout)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    if let Ok(value) = response.json::<Value>().await {
                        return Some(value);
                    }
                }
                Ok(response) => {
                    debug!(status = %response.status(), attempt, "runner status lookup failed");
                }
                Err(e) => debug!(error = %e, attempt, "runner status lookup failed"),
            }
        }
        None
    }

    /// Ask the runner to reload its configuration. Idempotent; retried
    /// once.
    pub async fn reload(&self) -> bool {
        for _ in 0..2 {
            let url = format!("{}/admin/reload", self.base_url);
            let result = self
                .authorized(self.client.post(&url))
                .timeout(self.admin_timeout)
                .send()
                .await;
            if matches!(&result, Ok(response) if response.status().is_success()) {
                return true;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::TokenStream;
    use switchboard_providers::wire::WireMessage;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn chat_request() -> ChatCompletionRequest {
        ChatCompletionRequest::new(
            "agent:mcp",
            vec![WireMessage {
                role: "user".to_owned(),
                content: Some("hi".to_owned()),
                tool_calls: None,
                tool_call_id: None,
            }],
        )
    }

    #[tokio::test]
    async fn agent_frames_pass_through_verbatim() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"tool_start\",\"call_id\":\"c1\",\"server\":\"time\",\"tool\":\"now\"}\n\n",
            "data: {\"type\":\"tool_end\",\"call_id\":\"c1\",\"server\":\"time\",\"tool\":\"now\",\"ok\":true,\"elapsed_ms\":12}\n\n",
            "data: {\"type\":\"delta\",\"content\":\"14:02\"}\n\n",
            "data: {\"type\":\"done\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer internal"))
            .and(header("x-request-id", "01J000000000000000000000BB"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = RunnerClient::new(
            server.uri(),
            Some("internal".to_owned()),
            Duration::from_secs(5),
        );
        let (sink, stream) = TokenStream::channel(16);
        client
            .stream_agent(
                &chat_request(),
                "01J000000000000000000000BB",
                QualityTier::Balanced,
                true,
                sink,
            )
            .await
            .unwrap();

        let events = stream.collect_all().await;
        assert_eq!(events.len(), 4);
        assert!(matches!(events[0], StreamEvent::ToolStart { .. }));
        assert!(matches!(events[2], StreamEvent::Delta { .. }));
        assert!(matches!(events[3], StreamEvent::Done));
    }

    #[tokio::test]
    async fn runner_error_status_is_surfaced() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = RunnerClient::new(server.uri(), None, Duration::from_secs(5));
        let (sink, _stream) = TokenStream::channel(16);
        let result = client
            .stream_agent(&chat_request(), "rid", QualityTier::Balanced, true, sink)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn status_lookup_retries_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"uptime_secs": 1})),
            )
            .mount(&server)
            .await;

        let client = RunnerClient::new(server.uri(), None, Duration::from_secs(5));
        let status = client.fetch_status().await.unwrap();
        assert_eq!(status["uptime_secs"], serde_json::json!(1));
    }
}
