//! The bounded agent loop.
//!
//! One request runs a bounded number of model turns. Content deltas stream
//! straight through to the client; tool-call deltas are buffered until the
//! assistant turn completes, then dispatched in parallel and folded back
//! into the scratch conversation in the order the assistant declared them,
//! so a replay of the transcript is deterministic regardless of completion
//! order. A single cancellation signal (client gone or deadline reached)
//! stops the provider stream and every in-flight tool call.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::{debug, warn};

use switchboard_core::{
    ChatMessage, Core, ModelSpec, RequestEnvelope, Severity, StageOutcome, StreamEvent, TokenSink,
    TokenUsage, ToolInvocation,
};
use switchboard_providers::wire::{
    to_wire_messages, ChatCompletionRequest, ToolCallAssembler, WireFunctionDef, WireTool,
};
use switchboard_providers::{ProviderError, ProviderRegistry};

use crate::catalog::{ToolCatalog, ToolDescriptor};
use crate::dispatch::{ToolDispatcher, ToolOutcome};
use crate::selector::MaitreD;

/// Directive appended when the iteration or time budget runs out.
const TERMINAL_DIRECTIVE: &str = "Your tool budget is exhausted. Do not request any further \
     tool calls; produce the final answer now from what you have learned.";

/// Slack required to bother starting another turn.
const MIN_TURN_BUDGET: Duration = Duration::from_millis(250);

/// The loop.
pub struct AgentLoop {
    core: Core,
    providers: Arc<ProviderRegistry>,
    dispatcher: Arc<ToolDispatcher>,
    selector: Arc<MaitreD>,
    catalog: Arc<ToolCatalog>,
}

impl AgentLoop {
    /// Assemble the loop from its collaborators.
    pub fn new(
        core: Core,
        providers: Arc<ProviderRegistry>,
        dispatcher: Arc<ToolDispatcher>,
        selector: Arc<MaitreD>,
        catalog: Arc<ToolCatalog>,
    ) -> Self {
        Self { core, providers, dispatcher, selector, catalog }
    }

    /// Run one request to completion, emitting into `sink`.
    pub async fn run(&self, envelope: RequestEnvelope, sink: TokenSink) {
        let request_id = envelope.request_id.to_string();
        self.core.observability.start_stage(&request_id, "agent");
        let outcome = self.run_inner(&envelope, &sink).await;
        self.core.observability.end_stage(&request_id, "agent", outcome);
        self.core.observability.finish_request(&request_id, outcome);
        metrics::counter!(
            "switchboard_agent_requests_total",
            "outcome" => match outcome {
                StageOutcome::Ok => "ok",
                StageOutcome::Failed => "failed",
                StageOutcome::Cancelled => "cancelled",
            },
        )
        .increment(1);
    }

    async fn run_inner(&self, envelope: &RequestEnvelope, sink: &TokenSink) -> StageOutcome {
        let request_id = envelope.request_id.to_string();
        let snapshot = self.core.config.snapshot();
        let catalog = self.catalog.snapshot();

        // Tool selection happens once, at admission; the effective set is
        // fixed for the request's lifetime.
        self.core.observability.start_stage(&request_id, "selection");
        let selection = self.selector.select(&envelope.messages, &catalog, &[]).await;
        let effective = self.selector.effective_tools(&catalog, &selection);
        self.core.observability.end_stage(&request_id, "selection", StageOutcome::Ok);
        let effective_names: BTreeSet<String> =
            effective.iter().map(|tool| tool.canonical_name.clone()).collect();
        debug!(
            request = %request_id,
            tools = effective.len(),
            confidence = selection.confidence,
            "effective tool set fixed"
        );

        let fallback_spec = ModelSpec::parse(&snapshot.fallback.model);
        let mut current_spec = agent_model_spec(&snapshot.runner.agent_model, &envelope.model_spec);

        let mut scratch = Vec::with_capacity(envelope.messages.len() + 2);
        scratch.push(ChatMessage::system(system_directive(&effective)));
        scratch.extend(envelope.messages.iter().cloned());

        let max_iterations = snapshot.runner.max_tool_steps;
        let mut wire_tools: Vec<WireTool> = effective.iter().map(to_wire_tool).collect();

        let mut total_usage = TokenUsage::default();
        let mut observations: Vec<String> = Vec::new();
        let mut iteration: u32 = 0;
        let mut fell_back = false;
        let mut tokens_emitted = false;
        // max_tool_steps of zero degenerates to a pure completion.
        let mut terminal = max_iterations == 0;

        loop {
            if envelope.remaining() < MIN_TURN_BUDGET {
                let _ = sink.fail(
                    switchboard_protocol::ErrorKind::Timeout,
                    "request deadline exceeded",
                )
                .await;
                return StageOutcome::Failed;
            }

            let mut request =
                ChatCompletionRequest::new(String::new(), to_wire_messages(&scratch));
            request.temperature = envelope.temperature;
            if !terminal && !wire_tools.is_empty() {
                request.tools = Some(wire_tools.clone());
            }

            let stage = format!("turn:{iteration}");
            self.core.observability.start_stage(&request_id, &stage);

            let opened = self.providers.open_stream(&current_spec, &request).await;
            let (mut stream, target) = match opened {
                Ok(opened) => opened,
                Err(error) => {
                    if self.may_fall_back(&error, tokens_emitted, fell_back, envelope)
                        && fallback_spec != current_spec
                    {
                        self.note_fallback(&request_id, &current_spec, &fallback_spec, &error);
                        fell_back = true;
                        current_spec = fallback_spec.clone();
                        wire_tools.clear();
                        self.core.observability.end_stage(
                            &request_id,
                            &stage,
                            StageOutcome::Failed,
                        );
                        continue;
                    }
                    let service = error.to_service_error();
                    let _ = sink.fail(service.kind, service.message).await;
                    self.core.observability.end_stage(&request_id, &stage, StageOutcome::Failed);
                    return StageOutcome::Failed;
                }
            };

            // Drive one model turn: forward content, buffer tool calls.
            let mut assembler = ToolCallAssembler::new();
            let mut turn_content = String::new();
            let turn_result: Result<(), ProviderError> = loop {
                tokio::select! {
                    () = sink.closed() => break Err(ProviderError::Cancelled),
                    chunk = stream.next_chunk() => match chunk {
                        Ok(Some(chunk)) => {
                            if let Some(delta) = chunk.content_delta() {
                                if !delta.is_empty() {
                                    turn_content.push_str(delta);
                                    tokens_emitted = true;
                                    if sink.delta(delta).await.is_err() {
                                        break Err(ProviderError::Cancelled);
                                    }
                                }
                            }
                            assembler.absorb(chunk.tool_call_fragments());
                            if let Some(usage) = chunk.usage {
                                let usage: TokenUsage = usage.into();
                                total_usage.add(usage);
                                self.providers.record_usage(&target, usage);
                            }
                        }
                        Ok(None) => break Ok(()),
                        Err(error) => break Err(error),
                    }
                }
            };

            match turn_result {
                Ok(()) => {}
                Err(ProviderError::Cancelled) => {
                    // Dropping the stream closes the upstream connection.
                    drop(stream);
                    self.core.observability.end_stage(&request_id, &stage, StageOutcome::Cancelled);
                    return StageOutcome::Cancelled;
                }
                Err(error) => {
                    self.providers.report_stream_failure(&target, &error);
                    if self.may_fall_back(&error, tokens_emitted, fell_back, envelope)
                        && fallback_spec != current_spec
                    {
                        self.note_fallback(&request_id, &current_spec, &fallback_spec, &error);
                        fell_back = true;
                        current_spec = fallback_spec.clone();
                        wire_tools.clear();
                        self.core.observability.end_stage(&request_id, &stage, StageOutcome::Failed);
                        continue;
                    }
                    let service = error.to_service_error();
                    let _ = sink.fail(service.kind, service.message).await;
                    self.core.observability.end_stage(&request_id, &stage, StageOutcome::Failed);
                    return StageOutcome::Failed;
                }
            }
            self.core.observability.end_stage(&request_id, &stage, StageOutcome::Ok);

            let calls = assembler.finish();
            if calls.is_empty() || terminal {
                // A terminal turn that produced neither content nor a usable
                // answer gets the collected observations as its reply.
                if terminal && turn_content.trim().is_empty() {
                    let summary = summarize_observations(&observations);
                    if sink.delta(summary).await.is_err() {
                        return StageOutcome::Cancelled;
                    }
                }
                let _ = sink.send(StreamEvent::Usage(total_usage)).await;
                let _ = sink.send(StreamEvent::Done).await;
                return StageOutcome::Ok;
            }

            scratch.push(ChatMessage::assistant_with_calls(
                if turn_content.is_empty() { None } else { Some(turn_content.clone()) },
                calls.clone(),
            ));

            // Dispatch every call of the turn in parallel; application
            // order below stays the declaration order.
            let deadline = envelope.remaining();
            let dispatch_futures = calls.iter().map(|call| {
                self.dispatch_one(call, &effective_names, deadline, sink)
            });
            let outcomes = tokio::select! {
                outcomes = futures::future::join_all(dispatch_futures) => outcomes,
                // Dropping the joined future cancels in-flight calls and
                // discards partial results.
                () = sink.closed() => {
                    return StageOutcome::Cancelled;
                }
            };

            for (call, outcome) in calls.iter().zip(outcomes) {
                let text = outcome.observation_text();
                observations.push(format!("{}: {}", call.name, text));
                scratch.push(ChatMessage::tool_result(call.id.clone(), text));
            }

            iteration += 1;
            if !terminal && (iteration >= max_iterations || envelope.remaining() < Duration::from_secs(2)) {
                debug!(request = %request_id, iteration, "budget exhausted; forcing final turn");
                terminal = true;
                scratch.push(ChatMessage::system(TERMINAL_DIRECTIVE));
            }
        }
    }

    async fn dispatch_one(
        &self,
        call: &ToolInvocation,
        effective_names: &BTreeSet<String>,
        deadline: Duration,
        sink: &TokenSink,
    ) -> ToolOutcome {
        let (server, tool) = match crate::catalog::split_canonical(&call.name) {
            Some(crate::catalog::ToolRoute::Mcp { server, tool }) => (server, tool),
            Some(crate::catalog::ToolRoute::Fs { op }) => ("fs".to_owned(), op),
            None => (String::from("unknown"), call.name.clone()),
        };

        let _ = sink
            .send(StreamEvent::ToolStart {
                call_id: call.id.clone(),
                server: server.clone(),
                tool: tool.clone(),
            })
            .await;

        // Only tools from the effective set computed at admission may run;
        // anything else becomes an observation without an outbound call.
        let (outcome, elapsed_ms) = if effective_names.contains(&call.name) {
            let dispatched =
                self.dispatcher.dispatch(&call.name, call.arguments.clone(), deadline).await;
            (dispatched.outcome, dispatched.elapsed_ms)
        } else {
            warn!(tool = %call.name, "model requested a tool outside the effective set");
            (
                ToolOutcome::TransportError {
                    kind: "not_available",
                    message: format!("tool '{}' is not available for this request", call.name),
                },
                0,
            )
        };

        let _ = sink
            .send(StreamEvent::ToolEnd {
                call_id: call.id.clone(),
                server,
                tool,
                ok: outcome.is_success(),
                elapsed_ms,
            })
            .await;

        outcome
    }

    fn may_fall_back(
        &self,
        error: &ProviderError,
        tokens_emitted: bool,
        fell_back: bool,
        envelope: &RequestEnvelope,
    ) -> bool {
        let snapshot = self.core.config.snapshot();
        error.is_transient()
            && !tokens_emitted
            && !fell_back
            && envelope.allow_fallback
            && snapshot.fallback.enabled
    }

    fn note_fallback(
        &self,
        request_id: &str,
        from: &ModelSpec,
        to: &ModelSpec,
        error: &ProviderError,
    ) {
        warn!(request = %request_id, from = %from, to = %to, %error, "agent turn falling back");
        self.core.observability.record_event(
            "provider_fallback",
            Severity::Warn,
            json!({
                "request_id": request_id,
                "from": from.to_string(),
                "to": to.to_string(),
                "error": error.to_string(),
            }),
        );
    }
}

impl std::fmt::Debug for AgentLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentLoop").finish()
    }
}

/// Resolve the model that drives agent turns. An `agent:{profile}` spec
/// with an embedded model (`agent:local:tiny`) pins the model; the plain
/// profile uses the configured default.
fn agent_model_spec(configured: &str, requested: &ModelSpec) -> ModelSpec {
    if let ModelSpec::Agent(profile) = requested {
        if profile.contains(':') {
            return ModelSpec::parse(profile);
        }
    }
    ModelSpec::parse(configured)
}

fn system_directive(effective: &[ToolDescriptor]) -> String {
    if effective.is_empty() {
        return "You are a helpful assistant. No tools are available for this request; \
                answer from your own knowledge."
            .to_owned();
    }
    let mut lines = String::new();
    for tool in effective.iter().take(48) {
        lines.push_str(&format!(
            "- {}: {}\n",
            tool.canonical_name,
            tool.description.as_deref().unwrap_or("(no description)")
        ));
    }
    format!(
        "You are a helpful assistant with access to tools. Call a tool when it \
         helps answer the request; otherwise answer directly. Available tools:\n{lines}"
    )
}

fn summarize_observations(observations: &[String]) -> String {
    if observations.is_empty() {
        return "I could not complete the request within the allowed budget.".to_owned();
    }
    let mut summary =
        String::from("I ran out of tool budget before finishing. What I found so far:\n");
    for observation in observations.iter().take(12) {
        summary.push_str(&format!("- {observation}\n"));
    }
    summary
}

fn to_wire_tool(descriptor: &ToolDescriptor) -> WireTool {
    WireTool {
        kind: "function".to_owned(),
        function: WireFunctionDef {
            name: descriptor.canonical_name.clone(),
            description: descriptor.description.clone(),
            parameters: if descriptor.arg_schema.is_null() {
                json!({"type": "object", "properties": {}})
            } else {
                descriptor.arg_schema.clone()
            },
        },
    }
}
