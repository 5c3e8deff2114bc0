//! In-process observability bus.
//!
//! Every component writes here: request lifecycles, component health,
//! events, counters. Storage is a pair of bounded ring buffers; producers
//! never block and never hold a lock across I/O. When a buffer is full the
//! oldest entry is evicted and the `dropped` counter is bumped, so a slow
//! reader can never stall a request.
//!
//! The read API ([`ObservabilityBus::export_snapshot`]) is the contract the
//! out-of-scope collaborators (anomaly detector, remediation engine,
//! experiment framework) consume; those extension points stay inert here.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Fine-grained diagnostics.
    Trace,
    /// Debug detail.
    Debug,
    /// Normal operation.
    Info,
    /// Degraded but serving.
    Warn,
    /// Failure.
    Error,
}

/// One recorded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Wall-clock timestamp.
    pub timestamp: DateTime<Utc>,
    /// Free-form category (`breaker`, `selector_failure`, `budget_bypass`, …).
    pub category: String,
    /// Severity.
    pub severity: Severity,
    /// Structured payload.
    pub payload: Value,
}

/// Terminal outcome of a stage or request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageOutcome {
    /// Completed normally.
    Ok,
    /// Failed.
    Failed,
    /// Cancelled by the client or deadline.
    Cancelled,
}

/// One stage of a request lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name (`admission`, `selection`, `turn:1`, …).
    pub name: String,
    /// Start timestamp.
    pub started: DateTime<Utc>,
    /// End timestamp, absent while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended: Option<DateTime<Utc>>,
    /// Stage outcome, absent while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StageOutcome>,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub metadata: Value,
}

/// Per-request observability entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleRecord {
    /// Request correlation key.
    pub request_id: String,
    /// Stages in start order.
    pub stages: Vec<Stage>,
    /// Admission timestamp.
    pub started_at: DateTime<Utc>,
    /// Completion timestamp, absent while in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Terminal outcome, absent while in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<StageOutcome>,
}

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Serving with reduced capability.
    Degraded,
    /// Not serving.
    Unhealthy,
}

/// Health record for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Current status.
    pub status: HealthStatus,
    /// When the status last changed.
    pub last_change: DateTime<Utc>,
    /// Last error observed, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Free-form detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Exported read-only view of the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilitySnapshot {
    /// Recent events, oldest first.
    pub events: Vec<Event>,
    /// In-flight request lifecycles.
    pub active_requests: Vec<LifecycleRecord>,
    /// Recently completed lifecycles, oldest first.
    pub completed_requests: Vec<LifecycleRecord>,
    /// Health per component.
    pub component_health: BTreeMap<String, ComponentHealth>,
    /// Events evicted because the ring was full.
    pub dropped_events: u64,
}

struct Ring<T> {
    entries: VecDeque<T>,
    capacity: usize,
}

impl<T> Ring<T> {
    fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::with_capacity(capacity.min(1024)), capacity: capacity.max(1) }
    }

    /// Push, returning true when an old entry was evicted.
    fn push(&mut self, entry: T) -> bool {
        let evicted = self.entries.len() >= self.capacity;
        if evicted {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
        evicted
    }
}

/// The bus itself. One instance per service process, shared by `Arc`.
pub struct ObservabilityBus {
    events: Mutex<Ring<Event>>,
    active: Mutex<HashMap<String, LifecycleRecord>>,
    completed: Mutex<Ring<LifecycleRecord>>,
    health: Mutex<BTreeMap<String, ComponentHealth>>,
    dropped_events: AtomicU64,
}

impl ObservabilityBus {
    /// Bus with the given ring capacities.
    pub fn new(event_capacity: usize, lifecycle_capacity: usize) -> Self {
        Self {
            events: Mutex::new(Ring::new(event_capacity)),
            active: Mutex::new(HashMap::new()),
            completed: Mutex::new(Ring::new(lifecycle_capacity)),
            health: Mutex::new(BTreeMap::new()),
            dropped_events: AtomicU64::new(0),
        }
    }

    /// Record one event. Never blocks on a full buffer.
    pub fn record_event(&self, category: impl Into<String>, severity: Severity, payload: Value) {
        let category = category.into();
        metrics::counter!("switchboard_events_total", "category" => category.clone()).increment(1);
        let event = Event { timestamp: Utc::now(), category, severity, payload };
        let evicted = self.events.lock().push(event);
        if evicted {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Open a stage on a request lifecycle, creating the record on first
    /// use.
    pub fn start_stage(&self, request_id: &str, name: &str) {
        let now = Utc::now();
        let mut active = self.active.lock();
        let record = active.entry(request_id.to_owned()).or_insert_with(|| LifecycleRecord {
            request_id: request_id.to_owned(),
            stages: Vec::new(),
            started_at: now,
            completed_at: None,
            outcome: None,
        });
        record.stages.push(Stage {
            name: name.to_owned(),
            started: now,
            ended: None,
            outcome: None,
            metadata: Value::Null,
        });
    }

    /// Close the most recent open stage with `name`.
    pub fn end_stage(&self, request_id: &str, name: &str, outcome: StageOutcome) {
        let mut active = self.active.lock();
        if let Some(record) = active.get_mut(request_id) {
            if let Some(stage) = record
                .stages
                .iter_mut()
                .rev()
                .find(|stage| stage.name == name && stage.ended.is_none())
            {
                stage.ended = Some(Utc::now());
                stage.outcome = Some(outcome);
            }
        }
    }

    /// Mark a request terminal and move its record to the completed ring.
    pub fn finish_request(&self, request_id: &str, outcome: StageOutcome) {
        let record = self.active.lock().remove(request_id);
        if let Some(mut record) = record {
            record.completed_at = Some(Utc::now());
            record.outcome = Some(outcome);
            self.completed.lock().push(record);
        } else {
            debug!(request_id, "finish_request for unknown request");
        }
    }

    /// Update a component's health, emitting a `component_health` event on
    /// change.
    pub fn update_component_health(
        &self,
        component: &str,
        status: HealthStatus,
        error: Option<String>,
        details: Option<String>,
    ) {
        let changed = {
            let mut health = self.health.lock();
            match health.get_mut(component) {
                Some(existing) if existing.status == status => {
                    if error.is_some() {
                        existing.last_error = error.clone();
                    }
                    if details.is_some() {
                        existing.details = details.clone();
                    }
                    false
                }
                Some(existing) => {
                    existing.status = status;
                    existing.last_change = Utc::now();
                    existing.last_error = error.clone();
                    existing.details = details.clone();
                    true
                }
                None => {
                    health.insert(
                        component.to_owned(),
                        ComponentHealth {
                            status,
                            last_change: Utc::now(),
                            last_error: error.clone(),
                            details: details.clone(),
                        },
                    );
                    true
                }
            }
        };
        if changed {
            self.record_event(
                "component_health",
                match status {
                    HealthStatus::Healthy => Severity::Info,
                    HealthStatus::Degraded => Severity::Warn,
                    HealthStatus::Unhealthy => Severity::Error,
                },
                serde_json::json!({
                    "component": component,
                    "status": status,
                    "error": error,
                }),
            );
        }
    }

    /// Count of in-flight requests.
    pub fn active_request_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Snapshot everything under one brief lock per buffer.
    pub fn export_snapshot(&self) -> ObservabilitySnapshot {
        let events = self.events.lock().entries.iter().cloned().collect();
        let mut active_requests: Vec<LifecycleRecord> =
            self.active.lock().values().cloned().collect();
        active_requests.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        let completed_requests = self.completed.lock().entries.iter().cloned().collect();
        let component_health = self.health.lock().clone();
        ObservabilitySnapshot {
            events,
            active_requests,
            completed_requests,
            component_health,
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ObservabilityBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityBus")
            .field("active_requests", &self.active.lock().len())
            .field("dropped_events", &self.dropped_events.load(Ordering::Relaxed))
            .finish()
    }
}
