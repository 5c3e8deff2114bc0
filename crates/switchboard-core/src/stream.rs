//! The portable token stream.
//!
//! Both the provider path and the agent path emit into this one shape; the
//! gateway only ever consumes [`StreamEvent`]s. The channel is bounded, so a
//! slow client suspends the producer, which suspends the upstream socket
//! read (§ backpressure: no silent drops on the streaming path).

use serde::{Deserialize, Serialize};
use switchboard_protocol::ErrorKind;
use tokio::sync::mpsc;

/// Token accounting for one completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt_tokens: u64,
    /// Tokens generated.
    pub completion_tokens: u64,
    /// Sum of the above.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Accumulate another turn's usage.
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.total_tokens += other.total_tokens;
    }
}

/// One frame of a response stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Content delta, forwarded to the client in production order.
    Delta {
        /// Text fragment.
        content: String,
    },
    /// Side-channel marker: a tool call started.
    ToolStart {
        /// Call id from the assistant message.
        call_id: String,
        /// Server the call is routed to (`fs` for built-ins).
        server: String,
        /// Tool name local to that server.
        tool: String,
    },
    /// Side-channel marker: a tool call finished.
    ToolEnd {
        /// Call id from the assistant message.
        call_id: String,
        /// Server the call was routed to.
        server: String,
        /// Tool name local to that server.
        tool: String,
        /// Whether the call produced a usable observation.
        ok: bool,
        /// Wall-clock duration of the call.
        elapsed_ms: u64,
    },
    /// Final usage record, at most one per stream.
    Usage(TokenUsage),
    /// Error sentinel; the stream closes right after.
    Error {
        /// Failure class.
        kind: ErrorKind,
        /// Human-readable message.
        message: String,
    },
    /// End-of-stream marker.
    Done,
}

/// Producer half of a token stream.
#[derive(Debug, Clone)]
pub struct TokenSink {
    tx: mpsc::Sender<StreamEvent>,
}

/// Error returned when the consumer dropped the stream.
///
/// Producers treat this as the cancellation signal: the client is gone, stop
/// generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamClosed;

impl TokenSink {
    /// Send one frame, suspending while the consumer's buffer is full.
    pub async fn send(&self, event: StreamEvent) -> Result<(), StreamClosed> {
        self.tx.send(event).await.map_err(|_| StreamClosed)
    }

    /// Send a content delta.
    pub async fn delta(&self, content: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(StreamEvent::Delta { content: content.into() }).await
    }

    /// Terminate the stream with an error sentinel.
    pub async fn fail(&self, kind: ErrorKind, message: impl Into<String>) -> Result<(), StreamClosed> {
        self.send(StreamEvent::Error { kind, message: message.into() }).await
    }

    /// Whether the consumer is still attached.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Resolve when the consumer drops the stream. Used to cancel work in
    /// flight the moment the client goes away.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Consumer half of a token stream.
#[derive(Debug)]
pub struct TokenStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl TokenStream {
    /// Bounded channel pair; `capacity` frames of slack before producers
    /// suspend.
    pub fn channel(capacity: usize) -> (TokenSink, TokenStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (TokenSink { tx }, TokenStream { rx })
    }

    /// Next frame, or `None` once the producer is done and the buffer is
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Surrender the underlying receiver, for adapters that need a
    /// `Stream` (the SSE response bodies).
    pub fn into_inner(self) -> mpsc::Receiver<StreamEvent> {
        self.rx
    }

    /// Drain the remaining frames into a vector. Test helper and
    /// non-streaming collection path.
    pub async fn collect_all(mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.recv().await {
            let done = matches!(event, StreamEvent::Done | StreamEvent::Error { .. });
            events.push(event);
            if done {
                break;
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let (sink, stream) = TokenStream::channel(8);
        sink.delta("hel").await.unwrap();
        sink.delta("lo").await.unwrap();
        sink.send(StreamEvent::Usage(TokenUsage::default())).await.unwrap();
        sink.send(StreamEvent::Done).await.unwrap();
        drop(sink);

        let events = stream.collect_all().await;
        assert_eq!(events.len(), 4);
        assert_eq!(events[0], StreamEvent::Delta { content: "hel".into() });
        assert_eq!(events[3], StreamEvent::Done);
    }

    #[tokio::test]
    async fn dropped_consumer_signals_cancellation() {
        let (sink, stream) = TokenStream::channel(1);
        drop(stream);
        assert_eq!(sink.delta("x").await, Err(StreamClosed));
        assert!(!sink.is_open());
    }

    #[tokio::test]
    async fn full_buffer_suspends_producer() {
        let (sink, mut stream) = TokenStream::channel(1);
        sink.delta("a").await.unwrap();
        // The second send cannot complete until the consumer reads.
        let pending = tokio::time::timeout(std::time::Duration::from_millis(20), sink.delta("b"));
        assert!(pending.await.is_err());
        assert_eq!(stream.recv().await, Some(StreamEvent::Delta { content: "a".into() }));
        sink.delta("b").await.unwrap();
    }

    #[test]
    fn usage_accumulates() {
        let mut total = TokenUsage::default();
        total.add(TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
        total.add(TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 });
        assert_eq!(total.total_tokens, 18);
    }

    #[test]
    fn stream_event_serde_shape() {
        let event = StreamEvent::ToolStart {
            call_id: "call_1".into(),
            server: "time".into(),
            tool: "now".into(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], serde_json::json!("tool_start"));
        let back: StreamEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }
}
