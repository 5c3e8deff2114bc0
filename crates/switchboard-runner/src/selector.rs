//! The Maître d': per-request tool selection.
//!
//! Given the conversation and the current catalog, pick which servers'
//! tools the model gets to see. A fast judge model classifies the query
//! against a compact menu of servers; core servers (and the file
//! built-ins) always pass through regardless. The selector never fails the
//! enclosing request: any judge trouble degrades to the core-only set with
//! a `selector_failure` event.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use switchboard_core::config::SelectorMode;
use switchboard_core::{ChatMessage, Core, ModelSpec, Role, Severity};
use switchboard_providers::wire::{to_wire_messages, ChatCompletionRequest};
use switchboard_providers::{ProviderError, ProviderRegistry};

use crate::catalog::{CatalogSnapshot, ToolDescriptor};

/// A prior successful server/query pairing fed in as context.
#[derive(Debug, Clone)]
pub struct RecallHint {
    /// Server that answered well.
    pub server: String,
    /// The query it answered.
    pub query: String,
}

/// The selector's decision.
#[derive(Debug, Clone)]
pub struct Selection {
    /// Servers whose tools are exposed (always includes the core set).
    pub target_servers: BTreeSet<String>,
    /// Role suggestion for downstream prompt shaping.
    pub recommended_role: Option<String>,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
}

/// Reply from the judge backend.
#[derive(Debug, Clone)]
pub struct JudgeReply {
    /// Raw completion text, expected to be strict JSON.
    pub text: String,
    /// Log-probability of the first emitted token, when surfaced.
    pub first_token_logprob: Option<f64>,
}

/// The judge seam; the provider registry implements it in production.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Classify one prompt.
    async fn classify(&self, prompt: &str, timeout: Duration) -> Result<JudgeReply, ProviderError>;
}

/// Judge backed by a provider model at temperature zero.
pub struct ProviderJudge {
    registry: Arc<ProviderRegistry>,
    model: ModelSpec,
}

impl ProviderJudge {
    /// Judge calling `model` through `registry`.
    pub fn new(registry: Arc<ProviderRegistry>, model: ModelSpec) -> Self {
        Self { registry, model }
    }
}

#[async_trait]
impl Judge for ProviderJudge {
    async fn classify(&self, prompt: &str, timeout: Duration) -> Result<JudgeReply, ProviderError> {
        let mut request = ChatCompletionRequest::new(
            String::new(),
            to_wire_messages(&[ChatMessage::user(prompt)]),
        );
        request.temperature = Some(0.0);
        request.logprobs = true;

        let response = self.registry.complete(&self.model, &request, timeout).await?;
        Ok(JudgeReply {
            first_token_logprob: response.first_token_logprob(),
            text: response.content().unwrap_or_default().to_owned(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct JudgeVerdict {
    #[serde(default)]
    servers: Vec<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// The selector.
pub struct MaitreD {
    core: Core,
    judge: Arc<dyn Judge>,
    cache: moka::future::Cache<u64, Selection>,
}

impl MaitreD {
    /// Selector over `judge`, caching decisions for the configured TTL.
    pub fn new(core: Core, judge: Arc<dyn Judge>) -> Self {
        let ttl = core.config.snapshot().selector.cache_ttl_secs.max(1);
        let cache = moka::future::Cache::builder()
            .max_capacity(4_096)
            .time_to_live(Duration::from_secs(ttl))
            .build();
        Self { core, judge, cache }
    }

    /// Decide the target servers for one request. Never fails.
    pub async fn select(
        &self,
        messages: &[ChatMessage],
        catalog: &CatalogSnapshot,
        hints: &[RecallHint],
    ) -> Selection {
        let settings = self.core.config.snapshot().selector.clone();
        let known = catalog.servers();
        let core_set = core_servers(catalog);

        if settings.mode == SelectorMode::Disabled {
            return Selection {
                target_servers: known,
                recommended_role: None,
                confidence: 1.0,
            };
        }

        let query = normalized_query(messages);
        if query.is_empty() {
            return Selection { target_servers: core_set, recommended_role: None, confidence: 0.0 };
        }

        let key = cache_key(&query, catalog.version);
        if let Some(cached) = self.cache.get(&key).await {
            debug!(query = %query, "selection served from cache");
            return cached;
        }

        let prompt = build_prompt(&query, catalog, hints);
        let timeout = Duration::from_millis(settings.timeout_ms.max(100));
        let selection = match self.judge.classify(&prompt, timeout).await {
            Ok(reply) => match parse_verdict(&reply.text) {
                Some(verdict) => {
                    let confidence = reply
                        .first_token_logprob
                        .map(|logprob| logprob.exp().clamp(0.0, 1.0))
                        .or(verdict.confidence)
                        .unwrap_or(0.0)
                        .clamp(0.0, 1.0);

                    let judged: BTreeSet<String> = verdict
                        .servers
                        .into_iter()
                        .filter(|server| known.contains(server))
                        .collect();

                    let mut target_servers = match settings.mode {
                        SelectorMode::Aggressive => {
                            if confidence >= settings.confidence_threshold {
                                judged
                            } else {
                                BTreeSet::new()
                            }
                        }
                        SelectorMode::Moderate => {
                            let mut union = judged;
                            union.extend(category_matches(&query, catalog));
                            union
                        }
                        SelectorMode::Disabled => unreachable!("handled above"),
                    };
                    target_servers.extend(core_set.iter().cloned());

                    Selection {
                        target_servers,
                        recommended_role: verdict.role,
                        confidence,
                    }
                }
                None => self.selector_failure(&core_set, "malformed judge output"),
            },
            Err(error) => self.selector_failure(&core_set, &error.to_string()),
        };

        self.cache.insert(key, selection.clone()).await;
        selection
    }

    fn selector_failure(&self, core_set: &BTreeSet<String>, reason: &str) -> Selection {
        warn!(reason, "tool selection failed; using core servers only");
        metrics::counter!("switchboard_selector_failures_total").increment(1);
        self.core.observability.record_event(
            "selector_failure",
            Severity::Warn,
            json!({"reason": reason}),
        );
        Selection {
            target_servers: core_set.clone(),
            recommended_role: None,
            confidence: 0.0,
        }
    }

    /// Filter the catalog to the effective tool set for `selection`.
    ///
    /// Core tools always pass; non-core tools of selected servers are
    /// capped at the configured maximum.
    pub fn effective_tools(
        &self,
        catalog: &CatalogSnapshot,
        selection: &Selection,
    ) -> Vec<ToolDescriptor> {
        let max_tools = self.core.config.snapshot().selector.max_tools.max(1);
        let mut tools = Vec::new();
        let mut extra = 0usize;
        for descriptor in catalog.tools() {
            if descriptor.core {
                tools.push(descriptor.clone());
            } else if selection.target_servers.contains(&descriptor.server) && extra < max_tools {
                tools.push(descriptor.clone());
                extra += 1;
            }
        }
        tools
    }
}

impl std::fmt::Debug for MaitreD {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MaitreD").finish()
    }
}

fn core_servers(catalog: &CatalogSnapshot) -> BTreeSet<String> {
    catalog
        .tools()
        .iter()
        .filter(|tool| tool.core)
        .map(|tool| tool.server.clone())
        .collect()
}

fn normalized_query(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .and_then(|message| message.content.as_deref())
        .map(|content| {
            content
                .to_lowercase()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

fn cache_key(query: &str, catalog_version: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    query.hash(&mut hasher);
    catalog_version.hash(&mut hasher);
    hasher.finish()
}

fn build_prompt(query: &str, catalog: &CatalogSnapshot, hints: &[RecallHint]) -> String {
    let mut menu = String::new();
    for server in catalog.servers() {
        let descriptors: Vec<_> = catalog.tools_for(&server).collect();
        let category = descriptors
            .iter()
            .find_map(|d| d.category.as_deref())
            .unwrap_or("general");
        let tool_names: Vec<_> =
            descriptors.iter().take(8).map(|d| d.local_name.as_str()).collect();
        menu.push_str(&format!("- {server} [{category}]: {}\n", tool_names.join(", ")));
    }

    let mut hint_block = String::new();
    if !hints.is_empty() {
        hint_block.push_str("Previously helpful pairings:\n");
        for hint in hints {
            hint_block.push_str(&format!("- \"{}\" -> {}\n", hint.query, hint.server));
        }
    }

    format!(
        "You route user requests to tool servers.\n\
         Available servers:\n{menu}{hint_block}\
         User request: {query}\n\
         Answer with strict JSON only, no prose:\n\
         {{\"servers\": [\"<server>\", ...], \"role\": \"<one word>\", \"confidence\": <0..1>}}"
    )
}

fn parse_verdict(text: &str) -> Option<JudgeVerdict> {
    let trimmed = text.trim().trim_start_matches("```json").trim_matches('`').trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn category_matches(query: &str, catalog: &CatalogSnapshot) -> BTreeSet<String> {
    catalog
        .tools()
        .iter()
        .filter(|tool| {
            tool.category
                .as_deref()
                .is_some_and(|category| query.contains(&category.to_lowercase()))
        })
        .map(|tool| tool.server.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ToolCatalog;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use switchboard_core::config::Snapshot;
    use switchboard_core::ConfigStore;

    struct ScriptedJudge {
        reply: Mutex<Result<JudgeReply, ProviderError>>,
        calls: AtomicUsize,
    }

    impl ScriptedJudge {
        fn json(text: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Ok(JudgeReply {
                    text: text.to_owned(),
                    first_token_logprob: None,
                })),
                calls: AtomicUsize::new(0),
            })
        }

        fn with_logprob(text: &str, logprob: f64) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Ok(JudgeReply {
                    text: text.to_owned(),
                    first_token_logprob: Some(logprob),
                })),
                calls: AtomicUsize::new(0),
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(Err(ProviderError::Timeout)),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Judge for ScriptedJudge {
        async fn classify(
            &self,
            _prompt: &str,
            _timeout: Duration,
        ) -> Result<JudgeReply, ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.reply.lock().clone()
        }
    }

    fn descriptor(server: &str, tool: &str, category: Option<&str>, core: bool) -> ToolDescriptor {
        ToolDescriptor {
            canonical_name: format!("mcp__{server}__{tool}"),
            server: server.to_owned(),
            local_name: tool.to_owned(),
            description: None,
            arg_schema: serde_json::Value::Null,
            category: category.map(str::to_owned),
            core,
        }
    }

    fn catalog() -> ToolCatalog {
        let catalog = ToolCatalog::new();
        catalog.publish(vec![
            descriptor("time", "now", Some("time"), true),
            descriptor("weather", "forecast", Some("weather"), false),
            descriptor("db", "query", Some("database"), false),
        ]);
        catalog
    }

    fn maitre(mode: SelectorMode, judge: Arc<dyn Judge>) -> MaitreD {
        let mut snapshot = Snapshot::default();
        snapshot.selector.mode = mode;
        snapshot.selector.confidence_threshold = 0.6;
        MaitreD::new(Core::new(ConfigStore::from_snapshot(snapshot)), judge)
    }

    fn user(messages: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(messages)]
    }

    #[tokio::test]
    async fn disabled_mode_passes_everything_through() {
        let selector = maitre(SelectorMode::Disabled, ScriptedJudge::failing());
        let catalog = catalog();
        let selection = selector.select(&user("anything"), &catalog.snapshot(), &[]).await;
        assert_eq!(selection.target_servers.len(), 3);
        assert_eq!(selection.confidence, 1.0);
    }

    #[tokio::test]
    async fn moderate_mode_unions_judge_and_category_matches() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather"], "role": "assistant", "confidence": 0.8}"#);
        let selector = maitre(SelectorMode::Moderate, judge);
        let catalog = catalog();

        let selection = selector
            .select(&user("what does the database say"), &catalog.snapshot(), &[])
            .await;
        // Judge picked weather, the query mentions "database", time is core.
        assert!(selection.target_servers.contains("weather"));
        assert!(selection.target_servers.contains("db"));
        assert!(selection.target_servers.contains("time"));
        assert_eq!(selection.recommended_role.as_deref(), Some("assistant"));
    }

    #[tokio::test]
    async fn aggressive_mode_below_threshold_keeps_core_only() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather"], "confidence": 0.3}"#);
        let selector = maitre(SelectorMode::Aggressive, judge);
        let catalog = catalog();

        let selection = selector.select(&user("hmm"), &catalog.snapshot(), &[]).await;
        assert_eq!(
            selection.target_servers.iter().collect::<Vec<_>>(),
            vec![&"time".to_owned()]
        );
    }

    #[tokio::test]
    async fn aggressive_mode_above_threshold_uses_the_recommendation() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather"], "confidence": 0.9}"#);
        let selector = maitre(SelectorMode::Aggressive, judge);
        let catalog = catalog();

        let selection = selector.select(&user("forecast please"), &catalog.snapshot(), &[]).await;
        assert!(selection.target_servers.contains("weather"));
        assert!(selection.target_servers.contains("time"));
        assert!(!selection.target_servers.contains("db"));
    }

    #[tokio::test]
    async fn logprob_overrides_claimed_confidence() {
        // exp(-0.105) ~= 0.9: trust the token probability, not the JSON.
        let judge = ScriptedJudge::with_logprob(
            r#"{"servers": ["weather"], "confidence": 0.1}"#,
            -0.105,
        );
        let selector = maitre(SelectorMode::Aggressive, judge);
        let catalog = catalog();

        let selection = selector.select(&user("forecast"), &catalog.snapshot(), &[]).await;
        assert!((selection.confidence - 0.9).abs() < 0.01);
        assert!(selection.target_servers.contains("weather"));
    }

    #[tokio::test]
    async fn unknown_servers_are_clamped_away() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather", "made-up"], "confidence": 0.9}"#);
        let selector = maitre(SelectorMode::Moderate, judge);
        let catalog = catalog();

        let selection = selector.select(&user("forecast"), &catalog.snapshot(), &[]).await;
        assert!(!selection.target_servers.contains("made-up"));
    }

    #[tokio::test]
    async fn judge_failure_degrades_to_core_with_an_event() {
        let selector = maitre(SelectorMode::Moderate, ScriptedJudge::failing());
        let catalog = catalog();

        let selection = selector.select(&user("forecast"), &catalog.snapshot(), &[]).await;
        assert_eq!(
            selection.target_servers.iter().collect::<Vec<_>>(),
            vec![&"time".to_owned()]
        );
        assert_eq!(selection.confidence, 0.0);

        let events = selector.core.observability.export_snapshot().events;
        assert!(events.iter().any(|e| e.category == "selector_failure"));
    }

    #[tokio::test]
    async fn malformed_judge_output_degrades_to_core() {
        let judge = ScriptedJudge::json("sure! I'd pick the weather server for this");
        let selector = maitre(SelectorMode::Moderate, judge);
        let catalog = catalog();

        let selection = selector.select(&user("forecast"), &catalog.snapshot(), &[]).await;
        assert_eq!(
            selection.target_servers.iter().collect::<Vec<_>>(),
            vec![&"time".to_owned()]
        );
    }

    #[tokio::test]
    async fn identical_queries_hit_the_cache() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather"], "confidence": 0.9}"#);
        let selector = maitre(SelectorMode::Moderate, judge.clone());
        let catalog = catalog();
        let snapshot = catalog.snapshot();

        selector.select(&user("Forecast   please"), &snapshot, &[]).await;
        selector.select(&user("forecast please"), &snapshot, &[]).await;
        assert_eq!(judge.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn effective_tools_cap_applies_to_non_core_only() {
        let judge = ScriptedJudge::json(r#"{"servers": ["weather", "db"], "confidence": 0.9}"#);
        let mut snapshot = Snapshot::default();
        snapshot.selector.mode = SelectorMode::Moderate;
        snapshot.selector.max_tools = 1;
        let selector =
            MaitreD::new(Core::new(ConfigStore::from_snapshot(snapshot)), judge);
        let catalog = catalog();
        let catalog_snapshot = catalog.snapshot();

        let selection = selector.select(&user("weather and db"), &catalog_snapshot, &[]).await;
        let tools = selector.effective_tools(&catalog_snapshot, &selection);
        let core_count = tools.iter().filter(|t| t.core).count();
        let extra_count = tools.len() - core_count;
        assert_eq!(core_count, 1);
        assert_eq!(extra_count, 1);
    }

    #[test]
    fn fenced_json_is_parsed() {
        let verdict = parse_verdict("```json\n{\"servers\": [\"a\"]}\n```").unwrap();
        assert_eq!(verdict.servers, vec!["a"]);
    }
}
