//! Per-target circuit breakers.
//!
//! Targets are MCP servers and governed providers. Transitions are driven
//! only by call outcomes reported through the registry API; every
//! transition emits a `breaker` event on the bus. State lives in memory
//! only and is re-derived as Closed on restart.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use crate::config::BreakerSettings;
use crate::observability::{ObservabilityBus, Severity};

/// Breaker tuning.
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Consecutive half-open successes before it closes.
    pub half_open_success_threshold: u32,
    /// Base cooldown after a trip from closed.
    pub cooldown: Duration,
    /// Cap for the doubling cooldown.
    pub max_cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            half_open_success_threshold: 2,
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

impl From<&BreakerSettings> for BreakerConfig {
    fn from(settings: &BreakerSettings) -> Self {
        Self {
            failure_threshold: settings.failure_threshold.max(1),
            half_open_success_threshold: settings.half_open_success_threshold.max(1),
            cooldown: Duration::from_secs(settings.cooldown_secs.max(1)),
            max_cooldown: Duration::from_secs(
                settings.max_cooldown_secs.max(settings.cooldown_secs.max(1)),
            ),
        }
    }
}

/// Public state names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Normal operation.
    Closed,
    /// Short-circuiting until the cooldown deadline.
    Open,
    /// Admitting probe calls.
    HalfOpen,
}

/// Admission decision for one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAdmission {
    /// Circuit closed; call through.
    Allow,
    /// Circuit half-open; call through as a probe.
    Probe,
    /// Circuit open; do not call.
    ShortCircuit {
        /// Time until the cooldown deadline.
        retry_in: Duration,
    },
}

#[derive(Debug)]
enum State {
    Closed { consecutive_failures: u32 },
    Open { until: Instant },
    HalfOpen { consecutive_successes: u32 },
}

#[derive(Debug)]
struct Breaker {
    config: BreakerConfig,
    state: State,
    current_cooldown: Duration,
    last_error: Option<String>,
}

type Transition = Option<(BreakerState, BreakerState)>;

impl Breaker {
    fn new(config: BreakerConfig) -> Self {
        Self {
            state: State::Closed { consecutive_failures: 0 },
            current_cooldown: config.cooldown,
            config,
            last_error: None,
        }
    }

    fn public_state(&self) -> BreakerState {
        match self.state {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    fn check_at(&mut self, now: Instant) -> (BreakerAdmission, Transition) {
        match self.state {
            State::Closed { .. } => (BreakerAdmission::Allow, None),
            State::HalfOpen { .. } => (BreakerAdmission::Probe, None),
            State::Open { until } => {
                if now >= until {
                    self.state = State::HalfOpen { consecutive_successes: 0 };
                    (
                        BreakerAdmission::Probe,
                        Some((BreakerState::Open, BreakerState::HalfOpen)),
                    )
                } else {
                    (BreakerAdmission::ShortCircuit { retry_in: until - now }, None)
                }
            }
        }
    }

    fn record_success_at(&mut self, _now: Instant) -> Transition {
        match &mut self.state {
            State::Closed { consecutive_failures } => {
                *consecutive_failures = 0;
                None
            }
            State::HalfOpen { consecutive_successes } => {
                *consecutive_successes += 1;
                if *consecutive_successes >= self.config.half_open_success_threshold {
                    self.state = State::Closed { consecutive_failures: 0 };
                    self.current_cooldown = self.config.cooldown;
                    self.last_error = None;
                    Some((BreakerState::HalfOpen, BreakerState::Closed))
                } else {
                    None
                }
            }
            // A success that raced the trip; the cooldown stands.
            State::Open { .. } => None,
        }
    }

    fn record_failure_at(&mut self, now: Instant, error: Option<&str>) -> Transition {
        if let Some(error) = error {
            self.last_error = Some(error.to_owned());
        }
        match &mut self.state {
            State::Closed { consecutive_failures } => {
                *consecutive_failures += 1;
                if *consecutive_failures >= self.config.failure_threshold {
                    self.state = State::Open { until: now + self.current_cooldown };
                    Some((BreakerState::Closed, BreakerState::Open))
                } else {
                    None
                }
            }
            State::HalfOpen { .. } => {
                self.current_cooldown =
                    (self.current_cooldown * 2).min(self.config.max_cooldown);
                self.state = State::Open { until: now + self.current_cooldown };
                Some((BreakerState::HalfOpen, BreakerState::Open))
            }
            State::Open { .. } => None,
        }
    }

    fn reset(&mut self) -> Transition {
        let from = self.public_state();
        self.state = State::Closed { consecutive_failures: 0 };
        self.current_cooldown = self.config.cooldown;
        self.last_error = None;
        if from == BreakerState::Closed {
            None
        } else {
            Some((from, BreakerState::Closed))
        }
    }

    fn summary_at(&self, target: &str, now: Instant) -> BreakerSummary {
        let (consecutive_failures, cooldown_remaining_ms) = match self.state {
            State::Closed { consecutive_failures } => (consecutive_failures, 0),
            State::HalfOpen { .. } => (0, 0),
            State::Open { until } => {
                (0, until.saturating_duration_since(now).as_millis() as u64)
            }
        };
        BreakerSummary {
            target: target.to_owned(),
            state: self.public_state(),
            consecutive_failures,
            cooldown_remaining_ms,
            last_error: self.last_error.clone(),
        }
    }
}

/// Exported view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSummary {
    /// Target the breaker guards.
    pub target: String,
    /// Current state.
    pub state: BreakerState,
    /// Consecutive failures while closed.
    pub consecutive_failures: u32,
    /// Remaining cooldown while open.
    pub cooldown_remaining_ms: u64,
    /// Last error observed, if any.
    pub last_error: Option<String>,
}

/// Registry of breakers keyed by target.
///
/// All state mutation goes through this API; per-target transitions are
/// serialized by the map entry lock.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: DashMap<String, Breaker>,
    bus: Arc<ObservabilityBus>,
}

impl BreakerRegistry {
    /// Registry applying `config` to every new target.
    pub fn new(config: BreakerConfig, bus: Arc<ObservabilityBus>) -> Self {
        Self { config, breakers: DashMap::new(), bus }
    }

    /// Admission check for `target`, creating a closed breaker on first
    /// sight.
    pub fn check(&self, target: &str) -> BreakerAdmission {
        let mut entry = self
            .breakers
            .entry(target.to_owned())
            .or_insert_with(|| Breaker::new(self.config));
        let (admission, transition) = entry.check_at(Instant::now());
        drop(entry);
        self.emit(target, transition);
        admission
    }

    /// Record a successful call.
    pub fn record_success(&self, target: &str) {
        if let Some(mut entry) = self.breakers.get_mut(target) {
            let transition = entry.record_success_at(Instant::now());
            drop(entry);
            self.emit(target, transition);
        }
    }

    /// Record a breaker-feeding failure.
    pub fn record_failure(&self, target: &str, error: &str) {
        let mut entry = self
            .breakers
            .entry(target.to_owned())
            .or_insert_with(|| Breaker::new(self.config));
        let transition = entry.record_failure_at(Instant::now(), Some(error));
        drop(entry);
        self.emit(target, transition);
    }

    /// Administrative reset to Closed with zeroed counters. Idempotent.
    pub fn reset(&self, target: &str) -> bool {
        match self.breakers.get_mut(target) {
            Some(mut entry) => {
                let transition = entry.reset();
                drop(entry);
                self.emit(target, transition);
                true
            }
            None => false,
        }
    }

    /// Summaries for every known target, sorted by target name.
    pub fn snapshot(&self) -> Vec<BreakerSummary> {
        let now = Instant::now();
        let mut summaries: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().summary_at(entry.key(), now))
            .collect();
        summaries.sort_by(|a, b| a.target.cmp(&b.target));
        summaries
    }

    fn emit(&self, target: &str, transition: Transition) {
        if let Some((from, to)) = transition {
            metrics::counter!(
                "switchboard_breaker_transitions_total",
                "target" => target.to_owned(),
            )
            .increment(1);
            self.bus.record_event(
                "breaker",
                if to == BreakerState::Closed { Severity::Info } else { Severity::Warn },
                json!({"target": target, "from": from, "to": to}),
            );
        }
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("targets", &self.breakers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            half_open_success_threshold: 2,
            cooldown: Duration::from_secs(10),
            max_cooldown: Duration::from_secs(40),
        }
    }

    #[test]
    fn trips_open_at_threshold() {
        let mut breaker = Breaker::new(config());
        let now = Instant::now();
        assert!(breaker.record_failure_at(now, Some("refused")).is_none());
        assert!(breaker.record_failure_at(now, Some("refused")).is_none());
        let transition = breaker.record_failure_at(now, Some("refused"));
        assert_eq!(transition, Some((BreakerState::Closed, BreakerState::Open)));

        match breaker.check_at(now).0 {
            BreakerAdmission::ShortCircuit { retry_in } => {
                assert_eq!(retry_in, Duration::from_secs(10));
            }
            other => panic!("expected short-circuit, got {other:?}"),
        }
    }

    #[test]
    fn success_resets_the_failure_streak() {
        let mut breaker = Breaker::new(config());
        let now = Instant::now();
        breaker.record_failure_at(now, None);
        breaker.record_failure_at(now, None);
        breaker.record_success_at(now);
        breaker.record_failure_at(now, None);
        breaker.record_failure_at(now, None);
        // Still closed: the streak restarted after the success.
        assert_eq!(breaker.public_state(), BreakerState::Closed);
    }

    #[test]
    fn cooldown_expiry_half_opens_then_closes_on_successes() {
        let mut breaker = Breaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            breaker.record_failure_at(t0, None);
        }
        let after_cooldown = t0 + Duration::from_secs(11);
        let (admission, transition) = breaker.check_at(after_cooldown);
        assert_eq!(admission, BreakerAdmission::Probe);
        assert_eq!(transition, Some((BreakerState::Open, BreakerState::HalfOpen)));

        assert!(breaker.record_success_at(after_cooldown).is_none());
        let transition = breaker.record_success_at(after_cooldown);
        assert_eq!(transition, Some((BreakerState::HalfOpen, BreakerState::Closed)));
    }

    #[test]
    fn half_open_failure_doubles_cooldown_up_to_cap() {
        let mut breaker = Breaker::new(config());
        let mut now = Instant::now();
        for round in 0..4 {
            // Trip (first round from closed, later rounds from half-open).
            if round == 0 {
                for _ in 0..3 {
                    breaker.record_failure_at(now, None);
                }
            }
            let State::Open { until } = &breaker.state else { panic!("expected open") };
            now = *until;
            breaker.check_at(now); // half-open
            breaker.record_failure_at(now, None);
        }
        // 10 -> 20 -> 40 -> capped at 40.
        assert_eq!(breaker.current_cooldown, Duration::from_secs(40));
    }

    #[test]
    fn reset_is_idempotent_and_zeroes_counters() {
        let bus = Arc::new(ObservabilityBus::new(16, 16));
        let registry = BreakerRegistry::new(config(), bus);
        for _ in 0..3 {
            registry.record_failure("flaky", "connect refused");
        }
        assert!(matches!(registry.check("flaky"), BreakerAdmission::ShortCircuit { .. }));

        assert!(registry.reset("flaky"));
        assert!(matches!(registry.check("flaky"), BreakerAdmission::Allow));
        assert!(registry.reset("flaky"));
        assert!(matches!(registry.check("flaky"), BreakerAdmission::Allow));
        assert!(!registry.reset("never-seen"));
    }

    #[test]
    fn transitions_emit_breaker_events() {
        let bus = Arc::new(ObservabilityBus::new(16, 16));
        let registry = BreakerRegistry::new(config(), bus.clone());
        for _ in 0..3 {
            registry.record_failure("flaky", "timeout");
        }
        let events = bus.export_snapshot().events;
        let breaker_events: Vec<_> =
            events.iter().filter(|e| e.category == "breaker").collect();
        assert_eq!(breaker_events.len(), 1);
        assert_eq!(breaker_events[0].payload["to"], serde_json::json!("open"));
    }

    #[test]
    fn snapshot_reports_last_error_and_remaining_cooldown() {
        let bus = Arc::new(ObservabilityBus::new(16, 16));
        let registry = BreakerRegistry::new(config(), bus);
        for _ in 0..3 {
            registry.record_failure("flaky", "connect refused");
        }
        let summary = &registry.snapshot()[0];
        assert_eq!(summary.target, "flaky");
        assert_eq!(summary.state, BreakerState::Open);
        assert!(summary.cooldown_remaining_ms > 0);
        assert_eq!(summary.last_error.as_deref(), Some("connect refused"));
    }
}
