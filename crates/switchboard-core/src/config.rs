//! Configuration store.
//!
//! Configuration is read from one declarative TOML file layered with
//! `SWITCHBOARD__*` environment overrides (plus the handful of short env
//! names the deployment scripts export, see [`apply_env_overrides`]). The
//! parsed result is published as an immutable [`Snapshot`] behind an
//! [`arc_swap::ArcSwap`]: readers grab an `Arc<Snapshot>` once at request
//! admission and never observe a partial update; reload swaps the whole
//! snapshot or nothing.

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

/// Errors raised while loading or reloading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read or parsed.
    #[error("failed to read configuration: {0}")]
    Read(String),
    /// The parsed configuration violates an invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Gateway service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// Listen address, `host:port`.
    pub bind: String,
    /// Externally advertised base URL.
    pub base_url: String,
    /// Bearer token; when unset only loopback peers are admitted.
    pub auth_token: Option<String>,
    /// Global in-flight request cap.
    pub max_concurrency: usize,
    /// Default per-request deadline.
    pub request_deadline_secs: u64,
    /// Answer budget denials with 402 instead of 429.
    pub budget_as_payment: bool,
    /// Model used when the request names none.
    pub default_model: String,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_owned(),
            base_url: "http://127.0.0.1:8080".to_owned(),
            auth_token: None,
            max_concurrency: 64,
            request_deadline_secs: 300,
            budget_as_payment: false,
            default_model: "local:tiny".to_owned(),
        }
    }
}

/// Runner service settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerSettings {
    /// Listen address, `host:port`.
    pub bind: String,
    /// Base URL the gateway uses to forward agent traffic.
    pub base_url: String,
    /// Model driving agent turns (any non-`agent:` spec).
    pub agent_model: String,
    /// Iteration budget for the agent loop.
    pub max_tool_steps: u32,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8091".to_owned(),
            base_url: "http://127.0.0.1:8091".to_owned(),
            agent_model: "local:tiny".to_owned(),
            max_tool_steps: 6,
        }
    }
}

/// Kind of chat backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Local cooperative endpoint; no auth, no budget, no breaker.
    Local,
    /// Governed remote endpoint; budgeted and breaker-protected.
    Remote,
}

/// One chat backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Provider id; the `provider:` prefix of model specs.
    pub id: String,
    /// Backend kind.
    pub kind: ProviderKind,
    /// Base URL of the OpenAI-compatible API.
    pub base_url: String,
    /// Literal API key. Prefer `api_key_env`.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Models served, used until the first successful probe.
    #[serde(default)]
    pub models: Vec<String>,
    /// Model-list probe interval.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,
}

fn default_probe_interval() -> u64 {
    60
}

/// Fallback policy settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackSettings {
    /// Whether requests may fall back at all.
    pub enabled: bool,
    /// Local model used as the fallback completer.
    pub model: String,
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self { enabled: true, model: "local:tiny".to_owned() }
    }
}

/// Transport address of one MCP server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum McpEndpoint {
    /// Child process speaking newline-delimited JSON-RPC on stdio.
    Stdio {
        /// Executable to spawn.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
    },
    /// Persistent WebSocket, JSON-RPC text frames.
    Websocket {
        /// `ws://` or `wss://` URL.
        url: String,
    },
    /// Unix domain socket, length-prefixed JSON-RPC.
    Unix {
        /// Socket path.
        path: String,
    },
    /// Stateless HTTP, one JSON-RPC envelope per POST.
    Http {
        /// Endpoint URL.
        url: String,
    },
}

/// One MCP server entry in the catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServerSettings {
    /// Server id; the `{server}` part of canonical tool names.
    pub id: String,
    /// Transport address.
    #[serde(flatten)]
    pub endpoint: McpEndpoint,
    /// Bearer token forwarded on HTTP/WebSocket transports.
    #[serde(default)]
    pub auth_token: Option<String>,
    /// Disabled servers are hidden from the catalog entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Category tag driving tool selection heuristics.
    #[serde(default)]
    pub category: Option<String>,
    /// Core servers bypass tool selection and are always exposed.
    #[serde(default)]
    pub core: bool,
    /// Max concurrent calls multiplexed onto this server.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
}

fn default_true() -> bool {
    true
}

fn default_max_inflight() -> usize {
    8
}

/// Tool-selection (Maître d') mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectorMode {
    /// Trust the judge when confident, otherwise fall back to core.
    Aggressive,
    /// Union judge output with category matches, capped.
    Moderate,
    /// Pass the full catalog through.
    Disabled,
}

/// Tool-selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Selection mode.
    pub mode: SelectorMode,
    /// Model spec of the fast judge.
    pub judge_model: String,
    /// Confidence gate for `aggressive` mode.
    pub confidence_threshold: f64,
    /// Tool cap for `moderate` mode.
    pub max_tools: usize,
    /// Decision cache TTL.
    pub cache_ttl_secs: u64,
    /// Judge call timeout.
    pub timeout_ms: u64,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            mode: SelectorMode::Moderate,
            judge_model: "local:tiny".to_owned(),
            confidence_threshold: 0.6,
            max_tools: 24,
            cache_ttl_secs: 300,
            timeout_ms: 3_000,
        }
    }
}

/// Budget ledger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetSettings {
    /// Daily spend cap in abstract units.
    pub daily_limit_units: u64,
    /// Admit when the ledger backend itself is failing.
    pub fail_open_on_budget_error: bool,
}

impl Default for BudgetSettings {
    fn default() -> Self {
        Self { daily_limit_units: 1_000_000, fail_open_on_budget_error: true }
    }
}

/// Circuit-breaker tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes.
    pub half_open_success_threshold: u32,
    /// Base cooldown.
    pub cooldown_secs: u64,
    /// Cap for the doubling cooldown.
    pub max_cooldown_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            cooldown_secs: 30,
            max_cooldown_secs: 300,
        }
    }
}

/// Per-component default timeouts. The request deadline overrides any
/// larger value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    /// Provider stream idle timeout.
    pub provider_idle_secs: u64,
    /// Single tool call timeout.
    pub tool_call_secs: u64,
    /// MCP handshake timeout.
    pub handshake_secs: u64,
    /// Admin lookup timeout.
    pub admin_secs: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { provider_idle_secs: 120, tool_call_secs: 30, handshake_secs: 10, admin_secs: 5 }
    }
}

/// File-tool sandbox settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsSettings {
    /// Sandbox root; file tools cannot escape it.
    pub root: PathBuf,
    /// Byte cap for `fs__read_text`.
    pub max_read_bytes: u64,
}

impl Default for FsSettings {
    fn default() -> Self {
        Self { root: PathBuf::from("./agent-fs"), max_read_bytes: 262_144 }
    }
}

/// Observability buffer sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Event ring capacity.
    pub event_buffer: usize,
    /// Completed-lifecycle ring capacity.
    pub lifecycle_buffer: usize,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self { event_buffer: 512, lifecycle_buffer: 256 }
    }
}

/// One immutable configuration snapshot.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    /// Gateway settings.
    pub gateway: GatewaySettings,
    /// Runner settings.
    pub runner: RunnerSettings,
    /// Chat backends. Remote entries without a resolvable key are dropped
    /// at load time.
    pub providers: Vec<ProviderSettings>,
    /// Fallback policy.
    pub fallback: FallbackSettings,
    /// MCP fleet.
    pub mcp_servers: Vec<McpServerSettings>,
    /// Tool selection.
    pub selector: SelectorSettings,
    /// Budget ledger.
    pub budget: BudgetSettings,
    /// Circuit breakers.
    pub breaker: BreakerSettings,
    /// Component timeouts.
    pub timeouts: TimeoutSettings,
    /// File-tool sandbox.
    pub fs: FsSettings,
    /// Observability buffers.
    pub observability: ObservabilitySettings,
    /// Content hash of everything above; catalog and cache keys derive
    /// from it.
    #[serde(skip)]
    pub version: String,
}

impl Snapshot {
    /// Providers of the given kind.
    pub fn providers_of(&self, kind: ProviderKind) -> impl Iterator<Item = &ProviderSettings> {
        self.providers.iter().filter(move |p| p.kind == kind)
    }

    /// Look up a provider by id.
    pub fn provider(&self, id: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Whether `model` is served by a local provider.
    pub fn is_local_model(&self, model: &str) -> bool {
        self.providers_of(ProviderKind::Local)
            .any(|p| p.models.iter().any(|m| m == model))
    }

    /// Enabled MCP servers.
    pub fn enabled_mcp_servers(&self) -> impl Iterator<Item = &McpServerSettings> {
        self.mcp_servers.iter().filter(|s| s.enabled)
    }

    fn stamp_version(&mut self) {
        self.version.clear();
        let serialized =
            serde_json::to_string(self).unwrap_or_else(|_| format!("{:?}", self));
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        serialized.hash(&mut hasher);
        self.version = format!("{:016x}", hasher.finish());
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (name, bind) in [("gateway.bind", &self.gateway.bind), ("runner.bind", &self.runner.bind)] {
            bind.parse::<std::net::SocketAddr>().map_err(|e| {
                ConfigError::Invalid(format!("{name} '{bind}' is not a socket address: {e}"))
            })?;
        }
        if self.gateway.max_concurrency == 0 {
            return Err(ConfigError::Invalid("gateway.max_concurrency must be at least 1".into()));
        }
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if !seen.insert(&provider.id) {
                return Err(ConfigError::Invalid(format!("duplicate provider id '{}'", provider.id)));
            }
        }
        let mut seen = HashSet::new();
        for server in &self.mcp_servers {
            if !seen.insert(&server.id) {
                return Err(ConfigError::Invalid(format!("duplicate MCP server id '{}'", server.id)));
            }
            if server.id.contains("__") {
                return Err(ConfigError::Invalid(format!(
                    "MCP server id '{}' must not contain '__' (reserved for canonical names)",
                    server.id
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.selector.confidence_threshold) {
            return Err(ConfigError::Invalid("selector.confidence_threshold must be in [0, 1]".into()));
        }
        Ok(())
    }
}

/// Short environment names exported by the launch scripts. Applied after
/// file and `SWITCHBOARD__*` layering, so they win.
fn apply_env_overrides(snapshot: &mut Snapshot) {
    if let Ok(token) = std::env::var("ROUTER_AUTH_TOKEN") {
        if !token.is_empty() {
            snapshot.gateway.auth_token = Some(token);
        }
    }
    if let Ok(value) = std::env::var("ROUTER_MAX_CONCURRENCY") {
        if let Ok(parsed) = value.parse() {
            snapshot.gateway.max_concurrency = parsed;
        }
    }
    if let Ok(base) = std::env::var("GATEWAY_BASE") {
        if !base.is_empty() {
            snapshot.gateway.base_url = base;
        }
    }
    if let Ok(root) = std::env::var("AGENT_FS_ROOT") {
        if !root.is_empty() {
            snapshot.fs.root = PathBuf::from(root);
        }
    }
    if let Ok(value) = std::env::var("AGENT_MAX_READ_BYTES") {
        if let Ok(parsed) = value.parse() {
            snapshot.fs.max_read_bytes = parsed;
        }
    }
    if let Ok(value) = std::env::var("AGENT_MAX_TOOL_STEPS") {
        if let Ok(parsed) = value.parse() {
            snapshot.runner.max_tool_steps = parsed;
        }
    }
}

/// Resolve remote API keys and drop providers without one.
///
/// A missing credential disables that provider only; the rest of the
/// snapshot is unaffected.
fn resolve_provider_keys(snapshot: &mut Snapshot) {
    snapshot.providers.retain_mut(|provider| {
        if provider.kind == ProviderKind::Local {
            return true;
        }
        if provider.api_key.is_none() {
            if let Some(env_name) = &provider.api_key_env {
                match std::env::var(env_name) {
                    Ok(key) if !key.is_empty() => provider.api_key = Some(key),
                    _ => {}
                }
            }
        }
        if provider.api_key.is_none() {
            warn!(provider = %provider.id, "no API key resolved; provider disabled");
            return false;
        }
        true
    });
}

fn build_snapshot(path: Option<&Path>) -> Result<Snapshot, ConfigError> {
    let mut builder = config::Config::builder();
    if let Some(path) = path {
        builder = builder.add_source(config::File::from(path).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix("SWITCHBOARD").separator("__"),
    );
    let mut snapshot: Snapshot = builder
        .build()
        .map_err(|e| ConfigError::Read(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Read(e.to_string()))?;

    apply_env_overrides(&mut snapshot);
    resolve_provider_keys(&mut snapshot);
    snapshot.validate()?;
    snapshot.stamp_version();
    Ok(snapshot)
}

/// Handle to the current configuration snapshot.
///
/// Cloning is cheap; all clones share the same swap cell.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<Inner>,
}

struct Inner {
    current: ArcSwap<Snapshot>,
    path: Option<PathBuf>,
}

/// Result of a reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Input was identical; nothing changed.
    Unchanged,
    /// The snapshot was swapped.
    Swapped {
        /// Version of the new snapshot.
        version: String,
    },
}

impl ConfigStore {
    /// Load from `path` (and the environment) and publish the first
    /// snapshot.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let snapshot = build_snapshot(path.as_deref())?;
        info!(version = %snapshot.version, "configuration loaded");
        Ok(Self {
            inner: Arc::new(Inner { current: ArcSwap::from_pointee(snapshot), path }),
        })
    }

    /// Wrap an already-built snapshot. Test constructor.
    pub fn from_snapshot(mut snapshot: Snapshot) -> Self {
        if snapshot.version.is_empty() {
            snapshot.stamp_version();
        }
        Self {
            inner: Arc::new(Inner { current: ArcSwap::from_pointee(snapshot), path: None }),
        }
    }

    /// Current snapshot handle. Capture once per request.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.current.load_full()
    }

    /// Re-read the source and atomically swap if anything changed.
    ///
    /// Idempotent: identical input produces an identical version and leaves
    /// the published pointer untouched.
    pub fn reload(&self) -> Result<ReloadOutcome, ConfigError> {
        let fresh = build_snapshot(self.inner.path.as_deref())?;
        if fresh.version == self.inner.current.load().version {
            return Ok(ReloadOutcome::Unchanged);
        }
        let version = fresh.version.clone();
        self.inner.current.store(Arc::new(fresh));
        info!(version = %version, "configuration reloaded");
        Ok(ReloadOutcome::Swapped { version })
    }
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("version", &self.inner.current.load().version)
            .finish()
    }
}
