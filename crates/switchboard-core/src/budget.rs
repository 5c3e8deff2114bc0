//! Spend ledger gating governed provider calls.
//!
//! Spend is tracked per UTC day in abstract units. Admission reserves the
//! caller's estimate so the ledger stays monotone even if the call dies
//! before reporting actual usage; `record_spend` adds whatever the estimate
//! missed. The in-memory backend cannot fail on its own, but the health
//! flag models a failing persistent backend so the fail-open policy and its
//! mandatory `budget_bypass` event stay exercised.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::json;

use crate::observability::{ObservabilityBus, Severity};

/// Admission decision for one governed call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Within budget; the estimate has been reserved.
    Admitted,
    /// The ledger backend is failing and policy says fail open; nothing was
    /// reserved.
    AdmittedFailOpen,
    /// Over budget.
    Denied {
        /// Seconds until the next period opens.
        retry_after_secs: u64,
    },
}

#[derive(Debug)]
struct LedgerState {
    period_start: NaiveDate,
    spend_units: u64,
}

/// Exported ledger view.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    /// Day the current period covers.
    pub period_start: NaiveDate,
    /// Units spent so far this period.
    pub spend_units: u64,
    /// Period cap.
    pub limit_units: u64,
    /// Whether backend failure admits requests.
    pub fail_open: bool,
}

/// Daily spend ledger.
pub struct BudgetLedger {
    state: Mutex<LedgerState>,
    limit_units: u64,
    fail_open: bool,
    backend_healthy: AtomicBool,
    bus: Arc<ObservabilityBus>,
}

impl BudgetLedger {
    /// Ledger with the given daily cap.
    pub fn new(limit_units: u64, fail_open: bool, bus: Arc<ObservabilityBus>) -> Self {
        Self {
            state: Mutex::new(LedgerState { period_start: Utc::now().date_naive(), spend_units: 0 }),
            limit_units,
            fail_open,
            backend_healthy: AtomicBool::new(true),
            bus,
        }
    }

    /// Admit a call whose cost is estimated at `estimate` units.
    pub fn try_admit(&self, estimate: u64) -> Admission {
        if !self.backend_healthy.load(Ordering::Acquire) {
            if self.fail_open {
                self.bus.record_event(
                    "budget_bypass",
                    Severity::Warn,
                    json!({"estimate": estimate, "reason": "ledger backend failing"}),
                );
                metrics::counter!("switchboard_budget_bypass_total").increment(1);
                return Admission::AdmittedFailOpen;
            }
            return Admission::Denied { retry_after_secs: 60 };
        }

        let mut state = self.state.lock();
        self.roll_over(&mut state);
        if state.spend_units.saturating_add(estimate) <= self.limit_units {
            state.spend_units += estimate;
            Admission::Admitted
        } else {
            Admission::Denied { retry_after_secs: seconds_until_tomorrow() }
        }
    }

    /// Record spend beyond what admission reserved. Monotone; never
    /// decreases the ledger.
    pub fn record_spend(&self, extra_units: u64) {
        if extra_units == 0 {
            return;
        }
        let mut state = self.state.lock();
        self.roll_over(&mut state);
        state.spend_units = state.spend_units.saturating_add(extra_units);
    }

    /// Mark the backing store healthy or failing. Exercised by tests and by
    /// persistent backends.
    pub fn set_backend_healthy(&self, healthy: bool) {
        self.backend_healthy.store(healthy, Ordering::Release);
    }

    /// Current ledger view.
    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut state = self.state.lock();
        self.roll_over(&mut state);
        LedgerSnapshot {
            period_start: state.period_start,
            spend_units: state.spend_units,
            limit_units: self.limit_units,
            fail_open: self.fail_open,
        }
    }

    fn roll_over(&self, state: &mut LedgerState) {
        let today = Utc::now().date_naive();
        if state.period_start != today {
            state.period_start = today;
            state.spend_units = 0;
        }
    }
}

impl std::fmt::Debug for BudgetLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BudgetLedger")
            .field("spend_units", &state.spend_units)
            .field("limit_units", &self.limit_units)
            .field("fail_open", &self.fail_open)
            .finish()
    }
}

fn seconds_until_tomorrow() -> u64 {
    let now = Utc::now();
    let tomorrow = now
        .date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc());
    match tomorrow {
        Some(t) => (t - now).num_seconds().max(1) as u64,
        None => 3_600,
    }
}
