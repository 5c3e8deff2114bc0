//! One OpenAI-compatible backend.

use std::time::Duration;

use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::error::ProviderError;
use crate::sse::{SseDecoder, SseFrame};
use crate::wire::{ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelList};

/// Client for one provider base URL.
///
/// `base_url` points at the API root (typically ending in `/v1`);
/// `/chat/completions` and `/models` are appended here.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    id: String,
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    idle_timeout: Duration,
}

impl ProviderEndpoint {
    /// Endpoint for `base_url`, authenticated when `api_key` is set.
    pub fn new(
        id: impl Into<String>,
        base_url: impl Into<String>,
        api_key: Option<String>,
        idle_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        let base_url: String = base_url.into();
        Self {
            id: id.into(),
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            client,
            idle_timeout,
        }
    }

    /// Provider id this endpoint serves.
    pub fn id(&self) -> &str {
        &self.id
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Probe the model catalog.
    pub async fn list_models(&self, timeout: Duration) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .authorized(self.client.get(&url))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        let list: ModelList = response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("malformed model list: {e}")))?;
        Ok(list.data.into_iter().map(|entry| entry.id).collect())
    }

    /// Buffered (non-streaming) completion.
    pub async fn chat(
        &self,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .authorized(self.client.post(&url))
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }
        response
            .json()
            .await
            .map_err(|e| ProviderError::Protocol(format!("malformed completion: {e}")))
    }

    /// Streaming completion. The returned [`ChunkStream`] owns the HTTP
    /// body; dropping it closes the upstream connection, which is how
    /// consumer cancellation propagates.
    pub async fn chat_stream(
        &self,
        request: &ChatCompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut request = request.clone();
        request.stream = true;

        let response = self
            .authorized(self.client.post(&url))
            .json(&request)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::from_status(status, &body));
        }

        debug!(provider = %self.id, "stream opened");
        Ok(ChunkStream {
            bytes: response.bytes_stream().boxed(),
            decoder: SseDecoder::new(),
            queued: std::collections::VecDeque::new(),
            idle_timeout: self.idle_timeout,
            done: false,
        })
    }
}

/// A live completion stream yielding parsed chunks.
pub struct ChunkStream {
    bytes: BoxStream<'static, reqwest::Result<bytes::Bytes>>,
    decoder: SseDecoder,
    queued: std::collections::VecDeque<SseFrame>,
    idle_timeout: Duration,
    done: bool,
}

impl ChunkStream {
    /// Next parsed chunk; `Ok(None)` at end of stream.
    ///
    /// An idle gap longer than the configured timeout fails the stream with
    /// [`ProviderError::Timeout`]. Unparseable frames are skipped.
    pub async fn next_chunk(&mut self) -> Result<Option<ChatCompletionChunk>, ProviderError> {
        loop {
            while let Some(frame) = self.queued.pop_front() {
                match frame {
                    SseFrame::Done => {
                        self.done = true;
                        return Ok(None);
                    }
                    SseFrame::Data(payload) => {
                        match serde_json::from_str::<ChatCompletionChunk>(&payload) {
                            Ok(chunk) => return Ok(Some(chunk)),
                            Err(e) => {
                                warn!(error = %e, "skipping unparseable stream chunk");
                            }
                        }
                    }
                }
            }
            if self.done {
                return Ok(None);
            }

            match tokio::time::timeout(self.idle_timeout, self.bytes.next()).await {
                Err(_) => return Err(ProviderError::Timeout),
                Ok(None) => {
                    // Body ended without [DONE]; treat as a clean close.
                    self.done = true;
                    return Ok(None);
                }
                Ok(Some(Err(e))) => return Err(ProviderError::from_reqwest(&e)),
                Ok(Some(Ok(bytes))) => {
                    self.queued.extend(self.decoder.push(&bytes));
                }
            }
        }
    }
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("queued", &self.queued.len())
            .field("done", &self.done)
            .finish()
    }
}
