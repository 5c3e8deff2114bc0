//! The public gateway.
//!
//! Clients speak the OpenAI chat-completions dialect to one ingress. The
//! gateway authenticates, admits under a global concurrency cap, parses the
//! model prefix, and fans out: `agent:*` to the runner over the internal
//! SSE surface ([`agent_client`]), everything else to the provider
//! registry. Responses come back as a single envelope or as
//! `data: <json>` SSE frames ending in `data: [DONE]` ([`openai`]).

pub mod agent_client;
pub mod openai;
pub mod routes;
pub mod state;

pub use agent_client::RunnerClient;
pub use routes::build_router;
pub use state::GatewayState;
