//! Shared substrate for the switchboard services.
//!
//! The gateway and the runner are built on the same four leaf components:
//!
//! - [`config`] - read-mostly configuration snapshots, swapped atomically;
//! - [`observability`] - the in-process tracking sink every component
//!   writes to;
//! - [`budget`] - the spend ledger gating governed provider calls;
//! - [`breaker`] - per-target circuit breakers with cooldown.
//!
//! [`core::Core`] bundles handles to all four and is threaded explicitly
//! through every component at construction; nothing in this workspace looks
//! anything up through process globals, and tests build fresh [`core::Core`]
//! values at will.
//!
//! [`message`] and [`stream`] define the chat data model and the portable
//! token stream both the provider path and the agent path emit into.

pub mod auth;
pub mod breaker;
pub mod budget;
pub mod config;
pub mod core;
pub mod message;
pub mod observability;
pub mod stream;

pub use crate::core::Core;
pub use auth::{AuthVerdict, TokenGate};
pub use breaker::{BreakerAdmission, BreakerConfig, BreakerRegistry, BreakerState, BreakerSummary};
pub use budget::{Admission, BudgetLedger};
pub use config::{ConfigError, ConfigStore, Snapshot};
pub use message::{ChatMessage, ModelSpec, QualityTier, RequestEnvelope, Role, ToolInvocation};
pub use observability::{
    ComponentHealth, Event, HealthStatus, LifecycleRecord, ObservabilityBus, Severity, Stage,
    StageOutcome,
};
pub use stream::{StreamEvent, TokenSink, TokenStream, TokenUsage};
