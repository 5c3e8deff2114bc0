//! Provider registry and chat backends.
//!
//! A provider is anything that answers OpenAI-compatible chat completions:
//! the local cooperative endpoint (ungoverned) or a remote governed API.
//! The registry aggregates their model catalogs with TTL probing, routes a
//! [`switchboard_core::ModelSpec`] to a backend, gates governed calls
//! through the budget ledger and circuit breakers, and applies the
//! at-most-once local fallback policy.

pub mod endpoint;
pub mod error;
pub mod registry;
pub mod sse;
pub mod wire;

pub use endpoint::{ChunkStream, ProviderEndpoint};
pub use error::ProviderError;
pub use registry::{ProviderRegistry, ProviderState, ProviderSummary, ResolvedTarget};
pub use sse::SseDecoder;
pub use wire::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ModelList,
    ToolCallAssembler, WireMessage, WireTool,
};
