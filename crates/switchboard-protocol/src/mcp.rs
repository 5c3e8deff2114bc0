//! MCP method payloads.
//!
//! The dispatcher speaks exactly three methods against every tool server:
//! `initialize`, `tools/list`, and `tools/call`. Tool input schemas pass
//! through as opaque JSON; switchboard never validates arguments against
//! them, the serving process does.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision sent during the handshake.
pub const MCP_PROTOCOL_VERSION: &str = "2025-06-18";

/// Handshake method.
pub const METHOD_INITIALIZE: &str = "initialize";
/// Capability query method.
pub const METHOD_LIST_TOOLS: &str = "tools/list";
/// Tool invocation method.
pub const METHOD_CALL_TOOL: &str = "tools/call";

/// `initialize` request parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeParams {
    /// Protocol revision the client speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Client identification.
    #[serde(rename = "clientInfo")]
    pub client_info: ServerInfo,
    /// Declared client capabilities (opaque).
    #[serde(default)]
    pub capabilities: Value,
}

impl InitializeParams {
    /// Params advertising this crate as the client.
    pub fn for_client(name: impl Into<String>) -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_owned(),
            client_info: ServerInfo {
                name: name.into(),
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
            capabilities: Value::Object(serde_json::Map::new()),
        }
    }
}

/// Name/version pair identifying either side of the handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Implementation name.
    pub name: String,
    /// Implementation version.
    pub version: String,
}

/// `initialize` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    /// Protocol revision the server speaks.
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    /// Server identification.
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
    /// Declared server capabilities (opaque).
    #[serde(default)]
    pub capabilities: Value,
}

/// One tool as advertised by `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name local to the serving process.
    pub name: String,
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the arguments, passed through opaquely.
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// `tools/list` result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsListResult {
    /// Advertised tools.
    pub tools: Vec<ToolSpec>,
}

/// `tools/call` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    /// Tool name local to the serving process.
    pub name: String,
    /// Arguments object.
    #[serde(default)]
    pub arguments: Value,
}

/// One content block of a tool result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolContent {
    /// Plain text block.
    Text {
        /// The text payload.
        text: String,
    },
}

impl ToolContent {
    /// Shorthand for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// `tools/call` result.
///
/// `is_error` marks tool-level failures the model is expected to recover
/// from; transport-level failures never reach this type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    /// Result content blocks.
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Tool-level error flag.
    #[serde(rename = "isError", default)]
    pub is_error: bool,
}

impl CallToolResult {
    /// Concatenate the text blocks into one observation string.
    pub fn joined_text(&self) -> String {
        self.content
            .iter()
            .map(|block| match block {
                ToolContent::Text { text } => text.as_str(),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn tool_spec_accepts_missing_description_and_schema() {
        let spec: ToolSpec = serde_json::from_value(json!({"name": "now"})).unwrap();
        assert_eq!(spec.name, "now");
        assert_eq!(spec.description, None);
        assert_eq!(spec.input_schema, Value::Null);
    }

    #[test]
    fn call_result_wire_shape() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "14:02 CET"}],
            "isError": false
        }))
        .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.joined_text(), "14:02 CET");
    }

    #[test]
    fn call_result_defaults_are_lenient() {
        let result: CallToolResult = serde_json::from_value(json!({})).unwrap();
        assert!(result.content.is_empty());
        assert!(!result.is_error);
    }

    #[test]
    fn initialize_params_carry_protocol_version() {
        let params = InitializeParams::for_client("switchboard-runner");
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value["protocolVersion"], json!(MCP_PROTOCOL_VERSION));
        assert_eq!(value["clientInfo"]["name"], json!("switchboard-runner"));
    }
}
