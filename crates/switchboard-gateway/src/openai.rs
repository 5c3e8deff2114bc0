//! Client-facing OpenAI dialect glue.
//!
//! Translates the internal [`StreamEvent`] stream into what clients see:
//! `chat.completion.chunk` SSE frames (tool lifecycle markers ride along
//! under a `switchboard` key with empty `choices`), or one buffered
//! `chat.completion` envelope. The terminal SSE frame is always
//! `data: [DONE]`.

use serde_json::{json, Value};

use switchboard_core::{StreamEvent, TokenUsage};
use switchboard_protocol::ServiceError;

/// Stateful translator from internal events to SSE `data:` payloads.
#[derive(Debug)]
pub struct SseFrames {
    id: String,
    model: String,
    role_sent: bool,
}

impl SseFrames {
    /// Translator for one response identified by `id`, reporting `model`.
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self { id: id.into(), model: model.into(), role_sent: false }
    }

    fn chunk(&self, choices: Value) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": chrono::Utc::now().timestamp(),
            "model": self.model,
            "choices": choices,
        })
    }

    /// Render one event as zero or more `data:` payload strings.
    pub fn render(&mut self, event: &StreamEvent) -> Vec<String> {
        match event {
            StreamEvent::Delta { content } => {
                let mut delta = json!({"content": content});
                if !self.role_sent {
                    self.role_sent = true;
                    delta["role"] = json!("assistant");
                }
                vec![self
                    .chunk(json!([{"index": 0, "delta": delta, "finish_reason": null}]))
                    .to_string()]
            }
            StreamEvent::ToolStart { .. } | StreamEvent::ToolEnd { .. } => {
                let mut frame = self.chunk(json!([]));
                frame["switchboard"] = serde_json::to_value(event).unwrap_or(Value::Null);
                vec![frame.to_string()]
            }
            StreamEvent::Usage(usage) => {
                let mut frame = self.chunk(json!([
                    {"index": 0, "delta": {}, "finish_reason": "stop"}
                ]));
                frame["usage"] = json!({
                    "prompt_tokens": usage.prompt_tokens,
                    "completion_tokens": usage.completion_tokens,
                    "total_tokens": usage.total_tokens,
                });
                vec![frame.to_string()]
            }
            StreamEvent::Error { kind, message } => {
                let body = ServiceError::new(*kind, message.clone()).to_body();
                vec![
                    serde_json::to_value(&body).unwrap_or(Value::Null).to_string(),
                    "[DONE]".to_owned(),
                ]
            }
            StreamEvent::Done => vec!["[DONE]".to_owned()],
        }
    }
}

/// Result of collecting a whole stream for a non-streaming client.
#[derive(Debug)]
pub struct Collected {
    /// Assistant content, concatenated.
    pub content: String,
    /// Final usage, when the producer reported one.
    pub usage: Option<TokenUsage>,
    /// Terminal error, if the stream failed.
    pub error: Option<ServiceError>,
}

/// Fold a finished event list into a buffered response.
pub fn collect_events(events: Vec<StreamEvent>) -> Collected {
    let mut content = String::new();
    let mut usage = None;
    let mut error = None;
    for event in events {
        match event {
            StreamEvent::Delta { content: delta } => content.push_str(&delta),
            StreamEvent::Usage(u) => usage = Some(u),
            StreamEvent::Error { kind, message } => {
                error = Some(ServiceError::new(kind, message));
            }
            StreamEvent::ToolStart { .. } | StreamEvent::ToolEnd { .. } | StreamEvent::Done => {}
        }
    }
    Collected { content, usage, error }
}

/// The buffered `chat.completion` envelope.
pub fn completion_envelope(id: &str, model: &str, collected: &Collected) -> Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": collected.content},
            "finish_reason": "stop",
        }],
        "usage": collected.usage.map(|usage| json!({
            "prompt_tokens": usage.prompt_tokens,
            "completion_tokens": usage.completion_tokens,
            "total_tokens": usage.total_tokens,
        })).unwrap_or(Value::Null),
    })
}

/// Validation applied to every incoming chat request.
pub fn validate_chat_request(
    request: &switchboard_providers::ChatCompletionRequest,
) -> Result<(), ServiceError> {
    if request.model.trim().is_empty() {
        return Err(ServiceError::validation("model must not be empty"));
    }
    if request.messages.is_empty() {
        return Err(ServiceError::validation("messages must not be empty"));
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(ServiceError::validation("temperature must be within [0, 2]"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_protocol::ErrorKind;
    use switchboard_providers::wire::WireMessage;
    use switchboard_providers::ChatCompletionRequest;

    fn message(role: &str, content: &str) -> WireMessage {
        WireMessage {
            role: role.to_owned(),
            content: Some(content.to_owned()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn first_delta_carries_the_role() {
        let mut frames = SseFrames::new("chatcmpl-1", "local:tiny");
        let first = frames.render(&StreamEvent::Delta { content: "he".into() });
        let value: Value = serde_json::from_str(&first[0]).unwrap();
        assert_eq!(value["choices"][0]["delta"]["role"], json!("assistant"));

        let second = frames.render(&StreamEvent::Delta { content: "llo".into() });
        let value: Value = serde_json::from_str(&second[0]).unwrap();
        assert!(value["choices"][0]["delta"].get("role").is_none());
    }

    #[test]
    fn tool_lifecycle_rides_the_side_channel() {
        let mut frames = SseFrames::new("chatcmpl-1", "agent:mcp");
        let rendered = frames.render(&StreamEvent::ToolStart {
            call_id: "call_1".into(),
            server: "time".into(),
            tool: "now".into(),
        });
        let value: Value = serde_json::from_str(&rendered[0]).unwrap();
        assert_eq!(value["choices"], json!([]));
        assert_eq!(value["switchboard"]["type"], json!("tool_start"));
        assert_eq!(value["switchboard"]["server"], json!("time"));
    }

    #[test]
    fn done_renders_the_terminal_marker() {
        let mut frames = SseFrames::new("chatcmpl-1", "local:tiny");
        assert_eq!(frames.render(&StreamEvent::Done), vec!["[DONE]".to_owned()]);
    }

    #[test]
    fn errors_render_a_body_then_done() {
        let mut frames = SseFrames::new("chatcmpl-1", "local:tiny");
        let rendered = frames.render(&StreamEvent::Error {
            kind: ErrorKind::Unavailable,
            message: "no provider".into(),
        });
        assert_eq!(rendered.len(), 2);
        let value: Value = serde_json::from_str(&rendered[0]).unwrap();
        assert_eq!(value["error"]["code"], json!("unavailable"));
        assert_eq!(rendered[1], "[DONE]");
    }

    #[test]
    fn collect_folds_deltas_and_usage() {
        let collected = collect_events(vec![
            StreamEvent::Delta { content: "po".into() },
            StreamEvent::Delta { content: "ng".into() },
            StreamEvent::Usage(TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 }),
            StreamEvent::Done,
        ]);
        assert_eq!(collected.content, "pong");
        assert_eq!(collected.usage.unwrap().total_tokens, 3);
        assert!(collected.error.is_none());

        let envelope = completion_envelope("chatcmpl-9", "local:tiny", &collected);
        assert_eq!(envelope["choices"][0]["message"]["content"], json!("pong"));
        assert_eq!(envelope["usage"]["total_tokens"], json!(3));
    }

    #[test]
    fn validation_rejects_bad_shapes() {
        let empty_messages = ChatCompletionRequest::new("local:tiny", vec![]);
        assert!(validate_chat_request(&empty_messages).is_err());

        let no_model = ChatCompletionRequest::new("", vec![message("user", "hi")]);
        assert!(validate_chat_request(&no_model).is_err());

        let mut bad_temperature =
            ChatCompletionRequest::new("local:tiny", vec![message("user", "hi")]);
        bad_temperature.temperature = Some(9.0);
        assert!(validate_chat_request(&bad_temperature).is_err());

        let fine = ChatCompletionRequest::new("local:tiny", vec![message("user", "hi")]);
        assert!(validate_chat_request(&fine).is_ok());
    }
}
