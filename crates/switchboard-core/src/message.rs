//! Chat data model and model-prefix routing.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Conversation role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System directive.
    System,
    /// End-user turn.
    User,
    /// Model turn; may carry tool calls.
    Assistant,
    /// Tool observation fed back to the model.
    Tool,
}

/// One tool call requested by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    /// Call id assigned by the model; results are correlated through it.
    pub id: String,
    /// Canonical tool name (`mcp__{server}__{tool}` or `fs__{op}`).
    pub name: String,
    /// JSON argument object.
    pub arguments: Value,
}

/// One turn of a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Turn role.
    pub role: Role,
    /// Text content; absent on assistant turns that only call tools.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool calls carried by an assistant turn.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolInvocation>,
    /// On `Tool` turns, the call id this observation answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    /// System directive.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// User turn.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant turn with plain content.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// Assistant turn carrying tool calls.
    pub fn assistant_with_calls(content: Option<String>, tool_calls: Vec<ToolInvocation>) -> Self {
        Self {
            role: Role::Assistant,
            content,
            tool_calls,
            tool_call_id: None,
        }
    }

    /// Tool observation answering `call_id`.
    pub fn tool_result(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(content.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(call_id.into()),
        }
    }
}

/// Response quality hint parsed from `X-Quality-Tier`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Prefer latency.
    Speed,
    /// Default trade-off.
    #[default]
    Balanced,
    /// Prefer answer quality.
    High,
}

impl std::str::FromStr for QualityTier {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "speed" => Ok(Self::Speed),
            "balanced" => Ok(Self::Balanced),
            "high" => Ok(Self::High),
            _ => Err(()),
        }
    }
}

/// Routing decision encoded in the request's `model` string.
///
/// The prefix decides the path explicitly; there is no implicit bypass of
/// the governed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSpec {
    /// `agent:{profile}` - route through the runner's agent loop.
    Agent(String),
    /// `local:{model}` - local cooperative endpoint, governed path bypassed.
    Local(String),
    /// `{provider}:{model}` - a configured remote, governed.
    Remote {
        /// Configured provider id.
        provider: String,
        /// Model name as the provider knows it.
        model: String,
    },
    /// Bare name; resolved against locally served models, then the
    /// configured default.
    Named(String),
}

impl ModelSpec {
    /// Parse the `model` field of an incoming request.
    pub fn parse(raw: &str) -> Self {
        match raw.split_once(':') {
            Some(("agent", rest)) => Self::Agent(rest.to_owned()),
            Some(("local", rest)) => Self::Local(rest.to_owned()),
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => Self::Remote {
                provider: provider.to_owned(),
                model: model.to_owned(),
            },
            _ => Self::Named(raw.to_owned()),
        }
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(profile) => write!(f, "agent:{profile}"),
            Self::Local(model) => write!(f, "local:{model}"),
            Self::Remote { provider, model } => write!(f, "{provider}:{model}"),
            Self::Named(name) => write!(f, "{name}"),
        }
    }
}

/// An admitted chat request.
///
/// Created on ingress, owned by the gateway for its lifetime, borrowed by
/// the agent loop during tool cycles. The configuration snapshot is captured
/// once at admission so a request never spans a reload.
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    /// ULID assigned at ingress or echoed from `X-Request-ID`.
    pub request_id: Ulid,
    /// Parsed routing decision.
    pub model_spec: ModelSpec,
    /// Conversation so far.
    pub messages: Vec<ChatMessage>,
    /// Whether the client asked for a streaming response.
    pub stream: bool,
    /// Quality hint.
    pub quality_tier: QualityTier,
    /// Sampling temperature passthrough.
    pub temperature: Option<f64>,
    /// Absolute deadline for the whole request.
    pub deadline: Instant,
    /// Whether the fallback policy may engage for this request.
    pub allow_fallback: bool,
}

impl RequestEnvelope {
    /// Time remaining until the deadline, zero if already past.
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn model_spec_prefix_routing() {
        assert_eq!(ModelSpec::parse("agent:mcp"), ModelSpec::Agent("mcp".into()));
        assert_eq!(ModelSpec::parse("local:tiny"), ModelSpec::Local("tiny".into()));
        assert_eq!(
            ModelSpec::parse("openrouter:gpt-4o"),
            ModelSpec::Remote { provider: "openrouter".into(), model: "gpt-4o".into() }
        );
        assert_eq!(ModelSpec::parse("tiny"), ModelSpec::Named("tiny".into()));
        // Degenerate colon placements fall back to a bare name.
        assert_eq!(ModelSpec::parse(":x"), ModelSpec::Named(":x".into()));
        assert_eq!(ModelSpec::parse("x:"), ModelSpec::Named("x:".into()));
    }

    #[test]
    fn model_spec_display_round_trips() {
        for raw in ["agent:mcp", "local:tiny", "openrouter:gpt-4o", "tiny"] {
            assert_eq!(ModelSpec::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn assistant_tool_calls_serialize_compactly() {
        let message = ChatMessage::assistant("hi");
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value, json!({"role": "assistant", "content": "hi"}));

        let with_calls = ChatMessage::assistant_with_calls(
            None,
            vec![ToolInvocation {
                id: "call_1".into(),
                name: "mcp__time__now".into(),
                arguments: json!({"tz": "Europe/Paris"}),
            }],
        );
        let value = serde_json::to_value(&with_calls).unwrap();
        assert!(value.get("content").is_none());
        assert_eq!(value["tool_calls"][0]["name"], json!("mcp__time__now"));
    }

    #[test]
    fn tool_result_links_back_to_call() {
        let message = ChatMessage::tool_result("call_1", "14:02");
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn quality_tier_parsing() {
        assert_eq!("speed".parse::<QualityTier>(), Ok(QualityTier::Speed));
        assert_eq!("HIGH".parse::<QualityTier>(), Ok(QualityTier::High));
        assert!("turbo".parse::<QualityTier>().is_err());
        assert_eq!(QualityTier::default(), QualityTier::Balanced);
    }
}
