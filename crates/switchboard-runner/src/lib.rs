//! The agentic runner.
//!
//! The runner owns everything between "the gateway handed us a chat
//! request" and "tokens flow back": the MCP fleet ([`roster`]), the
//! published tool catalog ([`catalog`]) with its sandboxed file built-ins
//! ([`fs_tools`]), breaker-wrapped dispatch ([`dispatch`]), the Maître d'
//! tool selector ([`selector`]), and the bounded agent loop itself
//! ([`agent`]). [`service`] exposes the internal HTTP surface the gateway
//! and operators talk to.

pub mod agent;
pub mod catalog;
pub mod dispatch;
pub mod fs_tools;
pub mod roster;
pub mod selector;
pub mod service;

pub use agent::AgentLoop;
pub use catalog::{CatalogSnapshot, ToolCatalog, ToolDescriptor};
pub use dispatch::{ToolDispatcher, ToolInvoker, ToolOutcome};
pub use fs_tools::FsTools;
pub use roster::McpRoster;
pub use selector::{MaitreD, Selection};
