//! Gateway shared state.

use std::sync::Arc;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::Semaphore;

use switchboard_core::{Core, TokenGate};
use switchboard_providers::ProviderRegistry;

use crate::agent_client::RunnerClient;

/// Everything a request handler needs, threaded through axum state.
#[derive(Clone)]
pub struct GatewayState {
    /// The substrate.
    pub core: Core,
    /// Chat backends.
    pub providers: Arc<ProviderRegistry>,
    /// Internal client to the runner service.
    pub runner: Arc<RunnerClient>,
    /// Credential gate.
    pub gate: TokenGate,
    /// Global admission cap.
    pub admission: Arc<Semaphore>,
    /// Prometheus render handle.
    pub metrics: PrometheusHandle,
    /// Process start, for uptime.
    pub started_at: Instant,
}

impl GatewayState {
    /// Assemble state from a core plus collaborators.
    pub fn new(
        core: Core,
        providers: Arc<ProviderRegistry>,
        runner: Arc<RunnerClient>,
        metrics: PrometheusHandle,
    ) -> Self {
        let snapshot = core.config.snapshot();
        Self {
            gate: TokenGate::new(snapshot.gateway.auth_token.clone()),
            admission: Arc::new(Semaphore::new(snapshot.gateway.max_concurrency.max(1))),
            core,
            providers,
            runner,
            metrics,
            started_at: Instant::now(),
        }
    }
}
