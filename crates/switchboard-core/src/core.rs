//! The `Core` handle.
//!
//! One value constructed at startup and threaded explicitly through every
//! component. It is the only way components reach shared configuration and
//! telemetry; there is no process-wide registry to look things up in, which
//! keeps tests free to build as many independent cores as they like.

use std::sync::Arc;

use crate::breaker::{BreakerConfig, BreakerRegistry};
use crate::budget::BudgetLedger;
use crate::config::ConfigStore;
use crate::observability::ObservabilityBus;

/// Aggregated handles to the shared substrate.
#[derive(Clone, Debug)]
pub struct Core {
    /// Configuration snapshots.
    pub config: ConfigStore,
    /// The tracking sink.
    pub observability: Arc<ObservabilityBus>,
    /// Circuit breakers for MCP servers and governed providers.
    pub breakers: Arc<BreakerRegistry>,
    /// Spend ledger for governed calls.
    pub budget: Arc<BudgetLedger>,
}

impl Core {
    /// Build the substrate from the store's current snapshot.
    pub fn new(config: ConfigStore) -> Self {
        let snapshot = config.snapshot();
        let observability = Arc::new(ObservabilityBus::new(
            snapshot.observability.event_buffer,
            snapshot.observability.lifecycle_buffer,
        ));
        let breakers = Arc::new(BreakerRegistry::new(
            BreakerConfig::from(&snapshot.breaker),
            observability.clone(),
        ));
        let budget = Arc::new(BudgetLedger::new(
            snapshot.budget.daily_limit_units,
            snapshot.budget.fail_open_on_budget_error,
            observability.clone(),
        ));
        Self { config, observability, breakers, budget }
    }
}
