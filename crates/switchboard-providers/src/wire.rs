//! OpenAI-compatible wire types.
//!
//! These shapes cover the three dialects switchboard speaks: requests to
//! providers, responses from them (buffered and streamed), and the frames
//! the gateway serves back to its own clients. Tool-call arguments travel
//! as JSON-encoded strings on the wire and as parsed values internally;
//! [`ToolCallAssembler`] bridges streamed argument fragments back into
//! [`ToolInvocation`]s.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use switchboard_core::{ChatMessage, Role, TokenUsage, ToolInvocation};

/// Chat completion request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model name as the backend knows it.
    pub model: String,
    /// Conversation.
    pub messages: Vec<WireMessage>,
    /// Request a streamed response.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stream: bool,
    /// Sampling temperature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// Tool definitions exposed to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<WireTool>>,
    /// Ask for log-probabilities of output tokens.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub logprobs: bool,
}

impl ChatCompletionRequest {
    /// Request for `model` over `messages`, everything else off.
    pub fn new(model: impl Into<String>, messages: Vec<WireMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            stream: false,
            temperature: None,
            tools: None,
            logprobs: false,
        }
    }
}

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// `system` | `user` | `assistant` | `tool`.
    pub role: String,
    /// Text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls on assistant messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<WireToolCall>>,
    /// Answered call id on tool messages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

/// One tool call on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireToolCall {
    /// Call id.
    pub id: String,
    /// Always `function`.
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    /// The invoked function.
    pub function: WireFunctionCall,
}

fn function_type() -> String {
    "function".to_owned()
}

/// Function name plus JSON-encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireFunctionCall {
    /// Canonical tool name.
    pub name: String,
    /// Arguments as a JSON-encoded string.
    pub arguments: String,
}

/// One tool definition on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireTool {
    /// Always `function`.
    #[serde(rename = "type", default = "function_type")]
    pub kind: String,
    /// The function surface.
    pub function: WireFunctionDef,
}

/// Function definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFunctionDef {
    /// Canonical tool name.
    pub name: String,
    /// Description shown to the model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Buffered chat completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    /// Response id.
    #[serde(default)]
    pub id: String,
    /// Always `chat.completion`.
    #[serde(default)]
    pub object: String,
    /// Unix timestamp.
    #[serde(default)]
    pub created: i64,
    /// Model that answered.
    #[serde(default)]
    pub model: String,
    /// Choices; switchboard only ever uses index 0.
    pub choices: Vec<Choice>,
    /// Token accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
}

impl ChatCompletionResponse {
    /// Log-probability of the first generated token, when the backend
    /// surfaced logprobs.
    pub fn first_token_logprob(&self) -> Option<f64> {
        self.choices
            .first()?
            .logprobs
            .as_ref()?
            .get("content")?
            .get(0)?
            .get("logprob")?
            .as_f64()
    }

    /// Content of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }
}

/// One response choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    /// Choice index.
    #[serde(default)]
    pub index: u32,
    /// The assistant message.
    pub message: WireMessage,
    /// Why generation stopped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// Token log-probabilities, when requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<Value>,
}

/// Usage block on the wire.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct WireUsage {
    /// Prompt tokens.
    #[serde(default)]
    pub prompt_tokens: u64,
    /// Completion tokens.
    #[serde(default)]
    pub completion_tokens: u64,
    /// Total tokens.
    #[serde(default)]
    pub total_tokens: u64,
}

impl From<WireUsage> for TokenUsage {
    fn from(usage: WireUsage) -> Self {
        Self {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }
}

/// One streamed chunk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    /// Response id.
    #[serde(default)]
    pub id: String,
    /// Chunk choices.
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
    /// Usage, typically only on the final chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<WireUsage>,
}

impl ChatCompletionChunk {
    /// Content delta of the first choice, if any.
    pub fn content_delta(&self) -> Option<&str> {
        self.choices.first()?.delta.content.as_deref()
    }

    /// Tool-call fragments of the first choice.
    pub fn tool_call_fragments(&self) -> &[ChunkToolCall] {
        self.choices
            .first()
            .and_then(|choice| choice.delta.tool_calls.as_deref())
            .unwrap_or(&[])
    }

    /// Finish reason of the first choice.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first()?.finish_reason.as_deref()
    }
}

/// One streamed choice.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// Choice index.
    #[serde(default)]
    pub index: u32,
    /// Incremental delta.
    #[serde(default)]
    pub delta: ChunkDelta,
    /// Why generation stopped, on the last chunk of the choice.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

/// Incremental message delta.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Role, on the first chunk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Content fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool-call fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ChunkToolCall>>,
}

/// One tool-call fragment in a stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkToolCall {
    /// Slot the fragment belongs to.
    #[serde(default)]
    pub index: usize,
    /// Call id, on the first fragment of the slot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Function fragments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ChunkFunction>,
}

/// Function-call fragment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkFunction {
    /// Name, on the first fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument string fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Model listing wire shape (`GET /v1/models`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    /// Always `list`.
    #[serde(default = "list_object")]
    pub object: String,
    /// Models.
    pub data: Vec<ModelEntry>,
}

fn list_object() -> String {
    "list".to_owned()
}

/// One model entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Model id.
    pub id: String,
    /// Always `model`.
    #[serde(default = "model_object")]
    pub object: String,
}

fn model_object() -> String {
    "model".to_owned()
}

impl ModelEntry {
    /// Entry for `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), object: "model".to_owned() }
    }
}

/// Reassembles streamed tool-call fragments into complete invocations.
///
/// Fragments arrive keyed by slot index: the first fragment of a slot
/// carries the id and name, later ones append to the argument string. The
/// assembler keeps slots in index order so results can be applied in the
/// order the assistant declared the calls.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    slots: Vec<PartialCall>,
}

#[derive(Debug, Default)]
struct PartialCall {
    id: String,
    name: String,
    arguments: String,
}

impl ToolCallAssembler {
    /// Fresh assembler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether any fragments have arrived.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Absorb the fragments of one chunk.
    pub fn absorb(&mut self, fragments: &[ChunkToolCall]) {
        for fragment in fragments {
            while self.slots.len() <= fragment.index {
                self.slots.push(PartialCall::default());
            }
            let slot = &mut self.slots[fragment.index];
            if let Some(id) = &fragment.id {
                slot.id = id.clone();
            }
            if let Some(function) = &fragment.function {
                if let Some(name) = &function.name {
                    slot.name = name.clone();
                }
                if let Some(arguments) = &function.arguments {
                    slot.arguments.push_str(arguments);
                }
            }
        }
    }

    /// Finish assembly, yielding invocations in slot order.
    ///
    /// Unparseable argument strings are preserved under `_raw` so the
    /// dispatch failure observation can show the model what it produced.
    pub fn finish(self) -> Vec<ToolInvocation> {
        self.slots
            .into_iter()
            .enumerate()
            .filter(|(_, slot)| !slot.name.is_empty())
            .map(|(index, slot)| {
                let arguments = if slot.arguments.trim().is_empty() {
                    Value::Object(serde_json::Map::new())
                } else {
                    serde_json::from_str(&slot.arguments)
                        .unwrap_or_else(|_| serde_json::json!({"_raw": slot.arguments}))
                };
                let id = if slot.id.is_empty() { format!("call_{index}") } else { slot.id };
                ToolInvocation { id, name: slot.name, arguments }
            })
            .collect()
    }
}

/// Convert internal messages to the wire shape.
pub fn to_wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    messages.iter().map(to_wire_message).collect()
}

fn to_wire_message(message: &ChatMessage) -> WireMessage {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    };
    let tool_calls = if message.tool_calls.is_empty() {
        None
    } else {
        Some(
            message
                .tool_calls
                .iter()
                .map(|call| WireToolCall {
                    id: call.id.clone(),
                    kind: "function".to_owned(),
                    function: WireFunctionCall {
                        name: call.name.clone(),
                        arguments: serde_json::to_string(&call.arguments)
                            .unwrap_or_else(|_| "{}".to_owned()),
                    },
                })
                .collect(),
        )
    };
    WireMessage {
        role: role.to_owned(),
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

/// Convert a wire message back to the internal shape.
pub fn from_wire_message(message: &WireMessage) -> ChatMessage {
    let role = match message.role.as_str() {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        "tool" => Role::Tool,
        _ => Role::User,
    };
    let tool_calls = message
        .tool_calls
        .as_deref()
        .unwrap_or(&[])
        .iter()
        .map(|call| ToolInvocation {
            id: call.id.clone(),
            name: call.function.name.clone(),
            arguments: serde_json::from_str(&call.function.arguments)
                .unwrap_or_else(|_| serde_json::json!({"_raw": call.function.arguments})),
        })
        .collect();
    ChatMessage {
        role,
        content: message.content.clone(),
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn request_omits_disabled_fields() {
        let request = ChatCompletionRequest::new("tiny", vec![]);
        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("stream").is_none());
        assert!(value.get("tools").is_none());
        assert!(value.get("logprobs").is_none());
    }

    #[test]
    fn wire_round_trip_preserves_tool_calls() {
        let message = ChatMessage::assistant_with_calls(
            None,
            vec![ToolInvocation {
                id: "call_9".into(),
                name: "mcp__time__now".into(),
                arguments: json!({"tz": "UTC"}),
            }],
        );
        let wire = to_wire_message(&message);
        assert_eq!(wire.tool_calls.as_ref().unwrap()[0].function.arguments, r#"{"tz":"UTC"}"#);
        let back = from_wire_message(&wire);
        assert_eq!(back, message);
    }

    #[test]
    fn assembler_reassembles_split_arguments() {
        let mut assembler = ToolCallAssembler::new();
        assembler.absorb(&[ChunkToolCall {
            index: 0,
            id: Some("call_1".into()),
            function: Some(ChunkFunction { name: Some("mcp__time__now".into()), arguments: Some("{\"tz\":".into()) }),
        }]);
        assembler.absorb(&[ChunkToolCall {
            index: 0,
            id: None,
            function: Some(ChunkFunction { name: None, arguments: Some("\"Europe/Paris\"}".into()) }),
        }]);

        let calls = assembler.finish();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].arguments, json!({"tz": "Europe/Paris"}));
    }

    #[test]
    fn assembler_keeps_declaration_order_across_slots() {
        let mut assembler = ToolCallAssembler::new();
        // Second slot starts first on the wire.
        assembler.absorb(&[ChunkToolCall {
            index: 1,
            id: Some("call_b".into()),
            function: Some(ChunkFunction { name: Some("fs__list_dir".into()), arguments: None }),
        }]);
        assembler.absorb(&[ChunkToolCall {
            index: 0,
            id: Some("call_a".into()),
            function: Some(ChunkFunction { name: Some("fs__read_text".into()), arguments: None }),
        }]);

        let calls = assembler.finish();
        assert_eq!(calls[0].id, "call_a");
        assert_eq!(calls[1].id, "call_b");
    }

    #[test]
    fn assembler_preserves_garbage_arguments() {
        let mut assembler = ToolCallAssembler::new();
        assembler.absorb(&[ChunkToolCall {
            index: 0,
            id: Some("call_1".into()),
            function: Some(ChunkFunction { name: Some("t".into()), arguments: Some("{not json".into()) }),
        }]);
        let calls = assembler.finish();
        assert_eq!(calls[0].arguments, json!({"_raw": "{not json"}));
    }

    #[test]
    fn first_token_logprob_digs_the_standard_path() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "{\"servers\":[\"time\"]}"},
                "logprobs": {"content": [{"token": "{", "logprob": -0.105}]}
            }]
        }))
        .unwrap();
        let logprob = response.first_token_logprob().unwrap();
        assert!((logprob - (-0.105)).abs() < 1e-9);
    }

    #[test]
    fn chunk_accessors_tolerate_empty_choices() {
        let chunk = ChatCompletionChunk::default();
        assert_eq!(chunk.content_delta(), None);
        assert!(chunk.tool_call_fragments().is_empty());
        assert_eq!(chunk.finish_reason(), None);
    }
}
