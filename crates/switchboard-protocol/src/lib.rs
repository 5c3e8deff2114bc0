//! Wire types shared by every switchboard service.
//!
//! Three concerns live here, all of them serialization-only:
//!
//! - [`jsonrpc`] - JSON-RPC 2.0 envelopes used on every MCP transport.
//! - [`mcp`] - the three MCP methods the dispatcher speaks
//!   (`initialize`, `tools/list`, `tools/call`) and their payloads.
//! - [`error`] - the unified error taxonomy and its HTTP mapping.
//!
//! Nothing in this crate performs I/O; transports and services depend on it
//! without pulling in a runtime.

pub mod error;
pub mod jsonrpc;
pub mod mcp;

pub use error::{ErrorBody, ErrorKind, ServiceError};
pub use jsonrpc::{
    JsonRpcError, JsonRpcErrorCode, JsonRpcMessage, JsonRpcNotification, JsonRpcRequest,
    JsonRpcResponse, JsonRpcResponsePayload, JsonRpcVersion, RequestId, ResponseId,
    JSONRPC_VERSION,
};
pub use mcp::{
    CallToolParams, CallToolResult, InitializeParams, InitializeResult, ServerInfo, ToolContent,
    ToolSpec, ToolsListResult, MCP_PROTOCOL_VERSION, METHOD_CALL_TOOL, METHOD_INITIALIZE,
    METHOD_LIST_TOOLS,
};
