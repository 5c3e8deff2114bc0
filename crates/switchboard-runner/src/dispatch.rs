//! Breaker-wrapped tool dispatch.
//!
//! One entry point turns a canonical tool name plus arguments into an
//! observation the agent loop can append: file built-ins run locally, MCP
//! tools go through the per-target circuit breaker and out over the
//! roster. Every dispatch produces a [`ToolOutcome`] the loop
//! pattern-matches on; nothing here throws past the seam.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use switchboard_core::{BreakerAdmission, Core, Severity};
use switchboard_protocol::CallToolResult;
use switchboard_transport::InvokeError;

use crate::catalog::{split_canonical, ToolRoute};
use crate::fs_tools::FsTools;

/// The seam between dispatch and the fleet. The roster is the production
/// implementation; tests script their own.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    /// Invoke `tool` on `server` with a per-call deadline.
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        deadline: Duration,
    ) -> Result<CallToolResult, InvokeError>;
}

/// Outcome of one dispatch, as the agent loop consumes it.
#[derive(Debug, Clone)]
pub enum ToolOutcome {
    /// The tool ran; `is_error` inside still distinguishes tool-level
    /// failures the model should react to.
    Ok(CallToolResult),
    /// The server returned a structured tool error.
    ToolError(String),
    /// The call never produced a tool answer (unreachable, timeout,
    /// breaker open, disabled, cancelled).
    TransportError {
        /// Short machine-readable kind.
        kind: &'static str,
        /// Human-readable detail.
        message: String,
    },
}

impl ToolOutcome {
    /// Whether the call produced a usable (non-error) observation.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok(result) if !result.is_error)
    }

    /// The observation text fed back to the model.
    pub fn observation_text(&self) -> String {
        match self {
            Self::Ok(result) => {
                let text = result.joined_text();
                if result.is_error {
                    format!("tool error: {text}")
                } else if text.is_empty() {
                    "(empty result)".to_owned()
                } else {
                    text
                }
            }
            Self::ToolError(message) => format!("tool error: {message}"),
            Self::TransportError { kind, message } => {
                format!("tool unavailable ({kind}): {message}")
            }
        }
    }
}

/// One completed dispatch.
#[derive(Debug)]
pub struct Dispatched {
    /// Outcome of the call.
    pub outcome: ToolOutcome,
    /// Owning server (`fs` for built-ins).
    pub server: String,
    /// Tool name local to that server.
    pub tool: String,
    /// Wall-clock duration.
    pub elapsed_ms: u64,
}

/// The dispatcher.
pub struct ToolDispatcher {
    core: Core,
    invoker: Arc<dyn ToolInvoker>,
    fs: FsTools,
}

impl ToolDispatcher {
    /// Dispatcher over `invoker` with the configured sandbox.
    pub fn new(core: Core, invoker: Arc<dyn ToolInvoker>) -> Self {
        let snapshot = core.config.snapshot();
        let fs = FsTools::new(snapshot.fs.root.clone(), snapshot.fs.max_read_bytes);
        Self { core, invoker, fs }
    }

    /// Dispatch one call.
    ///
    /// `deadline` is the request's remaining budget; the effective timeout
    /// is clamped to the per-tool default. Only breaker-feeding failures
    /// count against the target's circuit; breaker-open short-circuits
    /// produce an observation without any outbound call.
    pub async fn dispatch(&self, canonical_name: &str, args: Value, deadline: Duration) -> Dispatched {
        let started = Instant::now();
        let snapshot = self.core.config.snapshot();
        let tool_timeout = Duration::from_secs(snapshot.timeouts.tool_call_secs.max(1));
        let effective_deadline = deadline.min(tool_timeout);

        let (outcome, server, tool) = match split_canonical(canonical_name) {
            None => (
                ToolOutcome::TransportError {
                    kind: "not_found",
                    message: format!("'{canonical_name}' is not a canonical tool name"),
                },
                "unknown".to_owned(),
                canonical_name.to_owned(),
            ),
            Some(ToolRoute::Fs { op }) => {
                let result = self.fs.execute(&op, &args).await;
                (ToolOutcome::Ok(result), "fs".to_owned(), op)
            }
            Some(ToolRoute::Mcp { server, tool }) => {
                let outcome = self
                    .dispatch_mcp(&server, &tool, args, effective_deadline)
                    .await;
                (outcome, server, tool)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        metrics::histogram!(
            "switchboard_tool_dispatch_seconds",
            "server" => server.clone(),
        )
        .record(started.elapsed().as_secs_f64());

        self.core.observability.record_event(
            "tool_dispatch",
            if outcome.is_success() { Severity::Debug } else { Severity::Warn },
            json!({
                "tool": canonical_name,
                "server": server,
                "ok": outcome.is_success(),
                "elapsed_ms": elapsed_ms,
            }),
        );

        Dispatched { outcome, server, tool, elapsed_ms }
    }

    async fn dispatch_mcp(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        deadline: Duration,
    ) -> ToolOutcome {
        let target = format!("mcp:{server}");

        if let BreakerAdmission::ShortCircuit { retry_in } = self.core.breakers.check(&target) {
            debug!(server, tool, "short-circuited by open breaker");
            return ToolOutcome::TransportError {
                kind: "breaker_open",
                message: format!(
                    "server '{server}' is temporarily isolated ({}s until retry)",
                    retry_in.as_secs()
                ),
            };
        }

        match self.invoker.invoke(server, tool, args, deadline).await {
            Ok(result) => {
                self.core.breakers.record_success(&target);
                ToolOutcome::Ok(result)
            }
            Err(InvokeError::ToolError(message)) => {
                // The server answered; the transport is healthy.
                self.core.breakers.record_success(&target);
                ToolOutcome::ToolError(message)
            }
            Err(error) => {
                if error.feeds_breaker() {
                    self.core.breakers.record_failure(&target, &error.to_string());
                }
                let kind = match &error {
                    InvokeError::Unreachable(_) => "unreachable",
                    InvokeError::Protocol(_) => "protocol",
                    InvokeError::Timeout => "timeout",
                    InvokeError::Cancelled => "cancelled",
                    InvokeError::Disabled => "disabled",
                    InvokeError::ToolError(_) => unreachable!("handled above"),
                };
                ToolOutcome::TransportError { kind, message: error.to_string() }
            }
        }
    }
}

impl std::fmt::Debug for ToolDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolDispatcher").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use switchboard_core::config::Snapshot;
    use switchboard_core::{BreakerState, ConfigStore};
    use switchboard_protocol::ToolContent;

    /// Scripted invoker: pops the next result per call and counts calls.
    struct ScriptedInvoker {
        script: Mutex<Vec<Result<CallToolResult, InvokeError>>>,
        calls: std::sync::atomic::AtomicUsize,
    }

    impl ScriptedInvoker {
        fn new(script: Vec<Result<CallToolResult, InvokeError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script),
                calls: std::sync::atomic::AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    #[async_trait]
    impl ToolInvoker for ScriptedInvoker {
        async fn invoke(
            &self,
            _server: &str,
            _tool: &str,
            _args: Value,
            _deadline: Duration,
        ) -> Result<CallToolResult, InvokeError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            let mut script = self.script.lock();
            if script.is_empty() {
                Ok(CallToolResult { content: vec![ToolContent::text("ok")], is_error: false })
            } else {
                script.remove(0)
            }
        }
    }

    fn core_with_breaker(threshold: u32) -> Core {
        let mut snapshot = Snapshot::default();
        snapshot.breaker.failure_threshold = threshold;
        snapshot.fs.root = std::env::temp_dir().join("switchboard-dispatch-tests");
        Core::new(ConfigStore::from_snapshot(snapshot))
    }

    fn ok_result(text: &str) -> CallToolResult {
        CallToolResult { content: vec![ToolContent::text(text)], is_error: false }
    }

    #[tokio::test]
    async fn successful_mcp_dispatch_produces_the_observation() {
        let invoker = ScriptedInvoker::new(vec![Ok(ok_result("14:02"))]);
        let dispatcher = ToolDispatcher::new(core_with_breaker(3), invoker.clone());

        let dispatched = dispatcher
            .dispatch("mcp__time__now", json!({}), Duration::from_secs(5))
            .await;
        assert!(dispatched.outcome.is_success());
        assert_eq!(dispatched.outcome.observation_text(), "14:02");
        assert_eq!(dispatched.server, "time");
        assert_eq!(invoker.calls(), 1);
    }

    #[tokio::test]
    async fn breaker_opens_after_threshold_and_short_circuits() {
        let failures: Vec<Result<CallToolResult, InvokeError>> = (0..2)
            .map(|_| Err(InvokeError::Unreachable("refused".into())))
            .collect();
        let invoker = ScriptedInvoker::new(failures);
        let core = core_with_breaker(2);
        let dispatcher = ToolDispatcher::new(core.clone(), invoker.clone());

        for _ in 0..2 {
            let dispatched = dispatcher
                .dispatch("mcp__flaky__probe", json!({}), Duration::from_secs(5))
                .await;
            assert!(matches!(
                dispatched.outcome,
                ToolOutcome::TransportError { kind: "unreachable", .. }
            ));
        }
        assert_eq!(invoker.calls(), 2);

        // Threshold reached: no outbound call happens anymore.
        let dispatched = dispatcher
            .dispatch("mcp__flaky__probe", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(
            dispatched.outcome,
            ToolOutcome::TransportError { kind: "breaker_open", .. }
        ));
        assert_eq!(invoker.calls(), 2);

        let summary = &core.breakers.snapshot()[0];
        assert_eq!(summary.target, "mcp:flaky");
        assert_eq!(summary.state, BreakerState::Open);
    }

    #[tokio::test]
    async fn tool_errors_do_not_feed_the_breaker() {
        let script: Vec<Result<CallToolResult, InvokeError>> =
            (0..5).map(|_| Err(InvokeError::ToolError("bad args".into()))).collect();
        let invoker = ScriptedInvoker::new(script);
        let core = core_with_breaker(2);
        let dispatcher = ToolDispatcher::new(core.clone(), invoker.clone());

        for _ in 0..5 {
            let dispatched = dispatcher
                .dispatch("mcp__time__now", json!({}), Duration::from_secs(5))
                .await;
            assert!(matches!(dispatched.outcome, ToolOutcome::ToolError(_)));
        }
        // Every call went out; the breaker stayed closed.
        assert_eq!(invoker.calls(), 5);
        assert_eq!(core.breakers.snapshot()[0].state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn cancelled_calls_leave_breaker_counters_unchanged() {
        let invoker = ScriptedInvoker::new(vec![Err(InvokeError::Cancelled)]);
        let core = core_with_breaker(1);
        let dispatcher = ToolDispatcher::new(core.clone(), invoker);

        let dispatched = dispatcher
            .dispatch("mcp__time__now", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(
            dispatched.outcome,
            ToolOutcome::TransportError { kind: "cancelled", .. }
        ));
        assert_eq!(core.breakers.snapshot()[0].consecutive_failures, 0);
        assert_eq!(core.breakers.snapshot()[0].state, BreakerState::Closed);
    }

    #[tokio::test]
    async fn fs_route_runs_locally_without_an_invoker_call() {
        let invoker = ScriptedInvoker::new(vec![]);
        let dispatcher = ToolDispatcher::new(core_with_breaker(3), invoker.clone());

        let dispatched = dispatcher
            .dispatch(
                "fs__write_text",
                json!({"path": "probe.txt", "content": "x"}),
                Duration::from_secs(5),
            )
            .await;
        assert!(dispatched.outcome.is_success());
        assert_eq!(dispatched.server, "fs");
        assert_eq!(invoker.calls(), 0);
    }

    #[tokio::test]
    async fn non_canonical_names_are_rejected_without_dispatch() {
        let invoker = ScriptedInvoker::new(vec![]);
        let dispatcher = ToolDispatcher::new(core_with_breaker(3), invoker.clone());

        let dispatched = dispatcher
            .dispatch("plain_name", json!({}), Duration::from_secs(5))
            .await;
        assert!(matches!(
            dispatched.outcome,
            ToolOutcome::TransportError { kind: "not_found", .. }
        ));
        assert_eq!(invoker.calls(), 0);
    }
}
