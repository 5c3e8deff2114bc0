//! The provider registry.
//!
//! Routes a [`ModelSpec`] to a backend, keeps per-provider health through
//! periodic model probes, gates governed calls through the budget ledger
//! and circuit breakers, and applies the fallback policy: on a transient
//! failure before any token reaches the client, retry exactly once against
//! the configured local fallback model with tools dropped.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use switchboard_core::{
    Admission, BreakerAdmission, Core, HealthStatus, ModelSpec, Severity, StreamEvent, TokenSink,
    TokenUsage,
};
use switchboard_core::config::{ProviderKind, ProviderSettings};

use crate::endpoint::{ChunkStream, ProviderEndpoint};
use crate::error::ProviderError;
use crate::wire::{ChatCompletionRequest, ChatCompletionResponse, ModelEntry};

/// Provider lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderState {
    /// Never probed.
    Unknown,
    /// First probe in flight.
    Discovering,
    /// Serving.
    Ready,
    /// Last probe failed; still listed.
    Degraded,
    /// Repeated probe failures; hidden from model listings.
    Unavailable,
}

/// Probe failures in a row before a degraded provider goes unavailable.
const UNAVAILABLE_AFTER_FAILURES: u32 = 3;

struct ProviderHandle {
    settings: ProviderSettings,
    endpoint: ProviderEndpoint,
    state: Mutex<ProviderState>,
    models: Mutex<Vec<String>>,
    probed_at: Mutex<Option<Instant>>,
    probe_failures: AtomicU32,
    last_latency_ms: AtomicU64,
}

impl ProviderHandle {
    fn new(settings: ProviderSettings, idle_timeout: Duration) -> Self {
        let endpoint = ProviderEndpoint::new(
            settings.id.clone(),
            settings.base_url.clone(),
            settings.api_key.clone(),
            idle_timeout,
        );
        Self {
            models: Mutex::new(settings.models.clone()),
            endpoint,
            state: Mutex::new(ProviderState::Unknown),
            probed_at: Mutex::new(None),
            probe_failures: AtomicU32::new(0),
            last_latency_ms: AtomicU64::new(0),
            settings,
        }
    }

    fn state(&self) -> ProviderState {
        *self.state.lock()
    }

    fn serves(&self, model: &str) -> bool {
        self.models.lock().iter().any(|m| m == model)
    }
}

/// Exported view of one provider.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderSummary {
    /// Provider id.
    pub id: String,
    /// Backend kind.
    pub kind: ProviderKind,
    /// Lifecycle state.
    pub state: ProviderState,
    /// Known models.
    pub models: Vec<String>,
    /// Latency of the last successful call or probe.
    pub last_latency_ms: u64,
}

/// Where a request actually went, with its governance bookkeeping.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Provider that served the call.
    pub provider_id: String,
    /// Model name at that provider.
    pub model: String,
    /// Whether the governed path (budget + breaker) applied.
    pub governed: bool,
    breaker_target: Option<String>,
    reserved_units: u64,
}

/// Registry over the configured providers.
pub struct ProviderRegistry {
    core: Core,
    providers: DashMap<String, Arc<ProviderHandle>>,
    synced_version: Mutex<String>,
}

impl ProviderRegistry {
    /// Registry bound to `core`'s configuration and telemetry.
    pub fn new(core: Core) -> Arc<Self> {
        let registry = Arc::new(Self {
            core,
            providers: DashMap::new(),
            synced_version: Mutex::new(String::new()),
        });
        registry.sync();
        registry
    }

    /// Reconcile the provider set with the current config snapshot.
    /// Handles whose settings are unchanged keep their probe state.
    pub fn sync(&self) {
        let snapshot = self.core.config.snapshot();
        {
            let synced = self.synced_version.lock();
            if *synced == snapshot.version {
                return;
            }
        }

        let idle = Duration::from_secs(snapshot.timeouts.provider_idle_secs.max(1));
        for settings in &snapshot.providers {
            let stale = self
                .providers
                .get(&settings.id)
                .map(|handle| handle.settings != *settings)
                .unwrap_or(true);
            if stale {
                self.providers.insert(
                    settings.id.clone(),
                    Arc::new(ProviderHandle::new(settings.clone(), idle)),
                );
            }
        }
        self.providers
            .retain(|id, _| snapshot.providers.iter().any(|p| &p.id == id));
        *self.synced_version.lock() = snapshot.version.clone();
        debug!(version = %snapshot.version, providers = self.providers.len(), "provider set synced");
    }

    /// Aggregate model listing; unavailable providers are hidden.
    pub fn list_models(&self) -> Vec<ModelEntry> {
        self.sync();
        let mut entries = Vec::new();
        let mut handles: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        handles.sort_by(|a, b| a.settings.id.cmp(&b.settings.id));
        for handle in handles {
            if handle.state() == ProviderState::Unavailable {
                continue;
            }
            let prefix = match handle.settings.kind {
                ProviderKind::Local => "local".to_owned(),
                ProviderKind::Remote => handle.settings.id.clone(),
            };
            for model in handle.models.lock().iter() {
                entries.push(ModelEntry::new(format!("{prefix}:{model}")));
            }
        }
        entries
    }

    /// Exported provider states for the status surfaces.
    pub fn summaries(&self) -> Vec<ProviderSummary> {
        let mut summaries: Vec<_> = self
            .providers
            .iter()
            .map(|entry| {
                let handle = entry.value();
                ProviderSummary {
                    id: handle.settings.id.clone(),
                    kind: handle.settings.kind,
                    state: handle.state(),
                    models: handle.models.lock().clone(),
                    last_latency_ms: handle.last_latency_ms.load(Ordering::Relaxed),
                }
            })
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }

    fn resolve(&self, spec: &ModelSpec) -> Result<(Arc<ProviderHandle>, String), ProviderError> {
        self.sync();
        match spec {
            ModelSpec::Local(model) => {
                let locals: Vec<_> = self
                    .providers
                    .iter()
                    .filter(|e| e.value().settings.kind == ProviderKind::Local)
                    .map(|e| e.value().clone())
                    .collect();
                if let Some(handle) = locals.iter().find(|h| h.serves(model)) {
                    return Ok((handle.clone(), model.clone()));
                }
                // A single local backend serves unlisted models too; its
                // catalog may simply be stale.
                match locals.len() {
                    1 => Ok((locals[0].clone(), model.clone())),
                    0 => Err(ProviderError::NotFound("no local provider configured".into())),
                    _ => Err(ProviderError::NotFound(format!(
                        "no local provider serves '{model}'"
                    ))),
                }
            }
            ModelSpec::Remote { provider, model } => {
                let handle = self
                    .providers
                    .get(provider)
                    .map(|e| e.value().clone())
                    .ok_or_else(|| {
                        ProviderError::NotFound(format!("unknown provider '{provider}'"))
                    })?;
                if handle.state() == ProviderState::Unavailable {
                    return Err(ProviderError::Unavailable(format!(
                        "provider '{provider}' is unavailable"
                    )));
                }
                Ok((handle, model.clone()))
            }
            ModelSpec::Named(name) => {
                let snapshot = self.core.config.snapshot();
                if snapshot.is_local_model(name) {
                    self.resolve(&ModelSpec::Local(name.clone()))
                } else {
                    Err(ProviderError::NotFound(format!("unknown model '{name}'")))
                }
            }
            ModelSpec::Agent(_) => {
                Err(ProviderError::NotFound("agent specs are served by the runner".into()))
            }
        }
    }

    fn admit_governed(
        &self,
        handle: &ProviderHandle,
        estimate: u64,
    ) -> Result<(Option<String>, u64), ProviderError> {
        if handle.settings.kind == ProviderKind::Local {
            return Ok((None, 0));
        }
        let breaker_target = format!("provider:{}", handle.settings.id);
        if let BreakerAdmission::ShortCircuit { retry_in } =
            self.core.breakers.check(&breaker_target)
        {
            return Err(ProviderError::Unavailable(format!(
                "circuit open for provider '{}' ({}s remaining)",
                handle.settings.id,
                retry_in.as_secs()
            )));
        }
        match self.core.budget.try_admit(estimate) {
            Admission::Admitted => Ok((Some(breaker_target), estimate)),
            Admission::AdmittedFailOpen => Ok((Some(breaker_target), 0)),
            Admission::Denied { retry_after_secs } => {
                Err(ProviderError::BudgetExceeded { retry_after_secs })
            }
        }
    }

    /// Open a raw completion stream with full governance applied. The agent
    /// loop drives this directly; the plain-chat path goes through
    /// [`Self::stream_completion`].
    pub async fn open_stream(
        &self,
        spec: &ModelSpec,
        request: &ChatCompletionRequest,
    ) -> Result<(ChunkStream, ResolvedTarget), ProviderError> {
        let (handle, model) = self.resolve(spec)?;
        let (breaker_target, reserved_units) =
            self.admit_governed(&handle, estimate_units(request))?;

        let mut request = request.clone();
        request.model = model.clone();

        let started = Instant::now();
        match handle.endpoint.chat_stream(&request).await {
            Ok(stream) => {
                handle
                    .last_latency_ms
                    .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if let Some(target) = &breaker_target {
                    self.core.breakers.record_success(target);
                }
                Ok((
                    stream,
                    ResolvedTarget {
                        provider_id: handle.settings.id.clone(),
                        model,
                        governed: breaker_target.is_some(),
                        breaker_target,
                        reserved_units,
                    },
                ))
            }
            Err(error) => {
                self.note_call_failure(breaker_target.as_deref(), &error);
                Err(error)
            }
        }
    }

    /// Buffered completion with governance but no fallback. The tool
    /// selector's judge and the admin surfaces use this.
    pub async fn complete(
        &self,
        spec: &ModelSpec,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<ChatCompletionResponse, ProviderError> {
        let (handle, model) = self.resolve(spec)?;
        let (breaker_target, reserved_units) =
            self.admit_governed(&handle, estimate_units(request))?;

        let mut request = request.clone();
        request.model = model;

        let started = Instant::now();
        match handle.endpoint.chat(&request, timeout).await {
            Ok(response) => {
                handle
                    .last_latency_ms
                    .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if let Some(target) = &breaker_target {
                    self.core.breakers.record_success(target);
                }
                if let Some(usage) = response.usage {
                    self.settle_spend(reserved_units, usage.total_tokens);
                }
                Ok(response)
            }
            Err(error) => {
                self.note_call_failure(breaker_target.as_deref(), &error);
                Err(error)
            }
        }
    }

    /// Report a failure that happened after the stream opened.
    pub fn report_stream_failure(&self, target: &ResolvedTarget, error: &ProviderError) {
        self.note_call_failure(target.breaker_target.as_deref(), error);
    }

    /// Settle actual token usage against what admission reserved.
    pub fn record_usage(&self, target: &ResolvedTarget, usage: TokenUsage) {
        if target.governed {
            self.settle_spend(target.reserved_units, usage.total_tokens);
        }
    }

    fn settle_spend(&self, reserved: u64, actual: u64) {
        if reserved > 0 && actual > reserved {
            self.core.budget.record_spend(actual - reserved);
        }
    }

    fn note_call_failure(&self, breaker_target: Option<&str>, error: &ProviderError) {
        if let Some(target) = breaker_target {
            if error.is_transient() {
                self.core.breakers.record_failure(target, &error.to_string());
            }
        }
    }

    /// Plain chat-completion path: stream into `sink` applying the
    /// at-most-once fallback policy.
    ///
    /// Returns the spec that actually served the request, so the caller
    /// can surface the effective model name.
    pub async fn stream_completion(
        &self,
        spec: &ModelSpec,
        request: ChatCompletionRequest,
        allow_fallback: bool,
        sink: TokenSink,
    ) -> Result<ModelSpec, ProviderError> {
        let snapshot = self.core.config.snapshot();
        let fallback_spec = ModelSpec::parse(&snapshot.fallback.model);
        let fallback_allowed = allow_fallback && snapshot.fallback.enabled;

        let mut current_spec = spec.clone();
        let mut request = request;
        let mut fell_back = false;
        let mut tokens_emitted = false;

        loop {
            let may_fall_back =
                fallback_allowed && !fell_back && current_spec != fallback_spec;

            let opened = self.open_stream(&current_spec, &request).await;
            let (stream, target) = match opened {
                Ok(opened) => opened,
                Err(error) if error.is_transient() && may_fall_back => {
                    self.note_fallback(&current_spec, &fallback_spec, &error);
                    fell_back = true;
                    current_spec = fallback_spec.clone();
                    request.tools = None;
                    continue;
                }
                Err(error) => {
                    let service = error.to_service_error();
                    let _ = sink.fail(service.kind, service.message).await;
                    return Err(error);
                }
            };

            match pump(stream, &sink, &mut tokens_emitted).await {
                Ok(usage) => {
                    self.record_usage(&target, usage);
                    let _ = sink.send(StreamEvent::Usage(usage)).await;
                    let _ = sink.send(StreamEvent::Done).await;
                    return Ok(current_spec);
                }
                Err(ProviderError::Cancelled) => {
                    self.report_stream_failure(&target, &ProviderError::Cancelled);
                    return Err(ProviderError::Cancelled);
                }
                Err(error) => {
                    self.report_stream_failure(&target, &error);
                    if !tokens_emitted && error.is_transient() && may_fall_back {
                        self.note_fallback(&current_spec, &fallback_spec, &error);
                        fell_back = true;
                        current_spec = fallback_spec.clone();
                        request.tools = None;
                        continue;
                    }
                    let service = error.to_service_error();
                    let _ = sink.fail(service.kind, service.message).await;
                    return Err(error);
                }
            }
        }
    }

    fn note_fallback(&self, from: &ModelSpec, to: &ModelSpec, error: &ProviderError) {
        info!(from = %from, to = %to, error = %error, "falling back to local model");
        metrics::counter!("switchboard_provider_fallbacks_total").increment(1);
        self.core.observability.record_event(
            "provider_fallback",
            Severity::Warn,
            json!({"from": from.to_string(), "to": to.to_string(), "error": error.to_string()}),
        );
    }

    /// Probe every provider that is due and update its lifecycle state.
    pub async fn probe_all(&self) {
        self.sync();
        let snapshot = self.core.config.snapshot();
        let probe_timeout = Duration::from_secs(snapshot.timeouts.admin_secs.max(1));

        let handles: Vec<_> = self.providers.iter().map(|e| e.value().clone()).collect();
        for handle in handles {
            let due = {
                let probed_at = handle.probed_at.lock();
                probed_at
                    .map(|at| at.elapsed() >= Duration::from_secs(handle.settings.probe_interval_secs))
                    .unwrap_or(true)
            };
            if due {
                self.probe(&handle, probe_timeout).await;
            }
        }
    }

    async fn probe(&self, handle: &Arc<ProviderHandle>, timeout: Duration) {
        {
            let mut state = handle.state.lock();
            if *state == ProviderState::Unknown {
                *state = ProviderState::Discovering;
            }
        }

        let component = format!("provider:{}", handle.settings.id);
        let started = Instant::now();
        match handle.endpoint.list_models(timeout).await {
            Ok(models) => {
                handle
                    .last_latency_ms
                    .store(started.elapsed().as_millis() as u64, Ordering::Relaxed);
                if !models.is_empty() {
                    *handle.models.lock() = models;
                }
                handle.probe_failures.store(0, Ordering::Relaxed);
                *handle.state.lock() = ProviderState::Ready;
                *handle.probed_at.lock() = Some(Instant::now());
                self.core.observability.update_component_health(
                    &component,
                    HealthStatus::Healthy,
                    None,
                    None,
                );
            }
            Err(error) => {
                let failures = handle.probe_failures.fetch_add(1, Ordering::Relaxed) + 1;
                let mut state = handle.state.lock();
                *state = if failures >= UNAVAILABLE_AFTER_FAILURES {
                    ProviderState::Unavailable
                } else {
                    ProviderState::Degraded
                };
                let status = match *state {
                    ProviderState::Unavailable => HealthStatus::Unhealthy,
                    _ => HealthStatus::Degraded,
                };
                drop(state);
                *handle.probed_at.lock() = Some(Instant::now());
                warn!(provider = %handle.settings.id, %error, failures, "model probe failed");
                self.core.observability.update_component_health(
                    &component,
                    status,
                    Some(error.to_string()),
                    None,
                );
            }
        }
    }

    /// Background probe loop; ticks every few seconds and probes whatever
    /// is due.
    pub fn spawn_probe_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                registry.probe_all().await;
            }
        })
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("providers", &self.providers.len())
            .finish()
    }
}

/// Rough cost estimate used for the budget gate, in ledger units.
fn estimate_units(request: &ChatCompletionRequest) -> u64 {
    let chars: usize = request
        .messages
        .iter()
        .map(|m| m.content.as_deref().map(str::len).unwrap_or(0))
        .sum();
    (chars as u64 / 4).saturating_add(64)
}

async fn pump(
    mut stream: ChunkStream,
    sink: &TokenSink,
    tokens_emitted: &mut bool,
) -> Result<TokenUsage, ProviderError> {
    let mut usage = TokenUsage::default();
    loop {
        match stream.next_chunk().await? {
            Some(chunk) => {
                if let Some(delta) = chunk.content_delta() {
                    if !delta.is_empty() {
                        *tokens_emitted = true;
                        if sink.delta(delta).await.is_err() {
                            // Consumer gone; dropping the stream closes the
                            // upstream connection.
                            return Err(ProviderError::Cancelled);
                        }
                    }
                }
                if let Some(wire_usage) = chunk.usage {
                    usage = wire_usage.into();
                }
            }
            None => return Ok(usage),
        }
    }
}
