//! MCP fleet supervision.
//!
//! One supervisor task per enabled server drives the
//! discover → handshake → ready lifecycle, reconnects with backoff when the
//! connection dies, and republishes the tool catalog on transitions. A
//! server that loses its connection keeps its catalog entries while
//! degraded (dispatch short-circuits through the breaker instead), so the
//! model sees a structured error rather than a tool that silently
//! vanished.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use switchboard_core::config::{McpEndpoint, McpServerSettings};
use switchboard_core::{Core, HealthStatus};
use switchboard_protocol::{CallToolResult, ToolSpec};
use switchboard_transport::{
    Backoff, ConnectionConfig, HttpTransport, InvokeError, ServerConnection, StdioTransport,
    Transport, UnixTransport, WsTransport,
};

use crate::catalog::{descriptors_from_specs, ToolCatalog};
use crate::dispatch::ToolInvoker;
use crate::fs_tools::FsTools;

/// Lifecycle of one managed server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerLifecycle {
    /// Not yet contacted.
    Unknown,
    /// Connect/handshake in flight.
    Discovering,
    /// Serving tools.
    Ready,
    /// Connection lost; reconnecting with backoff.
    Degraded,
    /// Disabled in configuration; contributes no tools.
    Disabled,
}

struct ManagedServer {
    settings: McpServerSettings,
    connection: Arc<ServerConnection>,
    lifecycle: Mutex<ServerLifecycle>,
    tools: Mutex<Vec<ToolSpec>>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ManagedServer {
    fn lifecycle(&self) -> ServerLifecycle {
        *self.lifecycle.lock()
    }

    fn set_lifecycle(&self, lifecycle: ServerLifecycle) {
        *self.lifecycle.lock() = lifecycle;
    }

    fn in_catalog(&self) -> bool {
        matches!(self.lifecycle(), ServerLifecycle::Ready | ServerLifecycle::Degraded)
    }
}

/// Exported view of one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Server id.
    pub id: String,
    /// Transport name.
    pub transport: String,
    /// Endpoint description.
    pub endpoint: String,
    /// Lifecycle state.
    pub state: ServerLifecycle,
    /// Tools currently advertised.
    pub tool_count: usize,
}

/// Construct the transport for one configured endpoint.
pub fn build_transport(settings: &McpServerSettings) -> Arc<dyn Transport> {
    match &settings.endpoint {
        McpEndpoint::Stdio { command, args } => {
            Arc::new(StdioTransport::new(command.clone(), args.clone()))
        }
        McpEndpoint::Websocket { url } => {
            Arc::new(WsTransport::new(url.clone(), settings.auth_token.clone()))
        }
        McpEndpoint::Unix { path } => Arc::new(UnixTransport::new(path.clone())),
        McpEndpoint::Http { url } => {
            Arc::new(HttpTransport::new(url.clone(), settings.auth_token.clone()))
        }
    }
}

/// The fleet supervisor.
pub struct McpRoster {
    core: Core,
    catalog: Arc<ToolCatalog>,
    servers: DashMap<String, Arc<ManagedServer>>,
    shutdown: Arc<Notify>,
    shutting_down: Arc<AtomicBool>,
}

impl McpRoster {
    /// Roster over `core`'s configured MCP servers, publishing into
    /// `catalog`.
    pub fn new(core: Core, catalog: Arc<ToolCatalog>) -> Arc<Self> {
        let roster = Arc::new(Self {
            core,
            catalog,
            servers: DashMap::new(),
            shutdown: Arc::new(Notify::new()),
            shutting_down: Arc::new(AtomicBool::new(false)),
        });
        // The built-ins are available even with an empty fleet.
        roster.republish();
        roster
    }

    /// Spawn supervisors for every configured server.
    pub fn start(self: &Arc<Self>) {
        let snapshot = self.core.config.snapshot();
        for settings in &snapshot.mcp_servers {
            self.adopt(settings.clone());
        }
    }

    fn adopt(self: &Arc<Self>, settings: McpServerSettings) {
        let snapshot = self.core.config.snapshot();
        let mut config = ConnectionConfig::new(settings.id.clone());
        config.max_inflight = settings.max_inflight;
        config.handshake_timeout = Duration::from_secs(snapshot.timeouts.handshake_secs.max(1));
        config.client_name = "switchboard-runner".to_owned();

        let connection = Arc::new(ServerConnection::new(config, build_transport(&settings)));
        let managed = Arc::new(ManagedServer {
            connection,
            lifecycle: Mutex::new(if settings.enabled {
                ServerLifecycle::Unknown
            } else {
                ServerLifecycle::Disabled
            }),
            tools: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
            settings,
        });
        let id = managed.settings.id.clone();
        self.servers.insert(id.clone(), managed.clone());

        if managed.settings.enabled {
            let task = tokio::spawn(Self::supervise(self.clone(), managed.clone()));
            *managed.supervisor.lock() = Some(task);
        } else {
            debug!(server = %id, "server disabled; not supervised");
        }
    }

    async fn supervise(roster: Arc<Self>, server: Arc<ManagedServer>) {
        let id = server.settings.id.clone();
        let component = format!("mcp:{id}");
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

        loop {
            if roster.shutting_down.load(Ordering::Acquire) {
                break;
            }
            server.set_lifecycle(ServerLifecycle::Discovering);

            match server.connection.connect_and_handshake().await {
                Ok(tools) => {
                    info!(server = %id, tools = tools.len(), "server ready");
                    backoff.reset();
                    *server.tools.lock() = tools;
                    server.set_lifecycle(ServerLifecycle::Ready);
                    roster.core.observability.update_component_health(
                        &component,
                        HealthStatus::Healthy,
                        None,
                        None,
                    );
                    roster.republish();

                    // Hold here until the connection dies. Stateless HTTP
                    // never drops a socket, so it is probed instead.
                    let is_http = matches!(
                        server.settings.endpoint,
                        McpEndpoint::Http { .. }
                    );
                    let mut last_probe = tokio::time::Instant::now();
                    while server.connection.is_alive()
                        && !roster.shutting_down.load(Ordering::Acquire)
                    {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        if is_http && last_probe.elapsed() >= Duration::from_secs(30) {
                            last_probe = tokio::time::Instant::now();
                            if let Err(error) = server
                                .connection
                                .request("ping", None, Duration::from_secs(5))
                                .await
                            {
                                if error.feeds_breaker() {
                                    warn!(server = %id, %error, "health probe failed");
                                    break;
                                }
                            }
                        }
                    }
                    if roster.shutting_down.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(server = %id, "connection lost");
                    server.set_lifecycle(ServerLifecycle::Degraded);
                    roster.core.observability.update_component_health(
                        &component,
                        HealthStatus::Degraded,
                        Some("connection lost".to_owned()),
                        None,
                    );
                }
                Err(error) => {
                    warn!(server = %id, %error, attempt = backoff.attempt(), "handshake failed");
                    server.set_lifecycle(ServerLifecycle::Degraded);
                    roster.core.observability.update_component_health(
                        &component,
                        HealthStatus::Unhealthy,
                        Some(error.to_string()),
                        None,
                    );
                    roster.republish();
                }
            }

            let delay = backoff.next_delay().unwrap_or(Duration::from_secs(30));
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = roster.shutdown.notified() => break,
            }
        }
        debug!(server = %id, "supervisor stopped");
    }

    /// Rebuild and publish the catalog from the current fleet state.
    pub fn republish(&self) {
        let mut descriptors = FsTools::descriptors();

        let mut servers: Vec<_> = self.servers.iter().map(|e| e.value().clone()).collect();
        servers.sort_by(|a, b| a.settings.id.cmp(&b.settings.id));
        for server in servers {
            if !server.settings.enabled || !server.in_catalog() {
                continue;
            }
            let tools = server.tools.lock().clone();
            descriptors.extend(descriptors_from_specs(
                &server.settings.id,
                server.settings.category.as_deref(),
                server.settings.core,
                &tools,
            ));
        }
        let version = self.catalog.publish(descriptors);
        debug!(version, "catalog republished");
    }

    /// Exported fleet view for `/admin/mcp`.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        let mut statuses: Vec<_> = self
            .servers
            .iter()
            .map(|entry| {
                let server = entry.value();
                ServerStatus {
                    id: server.settings.id.clone(),
                    transport: transport_state_name(server.connection.transport_state()),
                    endpoint: server.connection.endpoint(),
                    state: server.lifecycle(),
                    tool_count: server.tools.lock().len(),
                }
            })
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    /// Reconcile the fleet with a reloaded configuration: new servers are
    /// adopted, removed ones shut down, changed ones restarted.
    pub async fn resync(self: &Arc<Self>) {
        let snapshot = self.core.config.snapshot();

        let removed: Vec<String> = self
            .servers
            .iter()
            .filter(|entry| !snapshot.mcp_servers.iter().any(|s| s.id == *entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        for id in removed {
            if let Some((_, server)) = self.servers.remove(&id) {
                info!(server = %id, "server removed from configuration");
                Self::stop_server(&server).await;
            }
        }

        for settings in snapshot.mcp_servers.clone() {
            let changed = self
                .servers
                .get(&settings.id)
                .map(|existing| existing.settings != settings)
                .unwrap_or(true);
            if changed {
                if let Some((_, old)) = self.servers.remove(&settings.id) {
                    Self::stop_server(&old).await;
                }
                self.adopt(settings);
            }
        }
        self.republish();
    }

    async fn stop_server(server: &Arc<ManagedServer>) {
        let task = server.supervisor.lock().take();
        if let Some(task) = task {
            task.abort();
        }
        server.connection.shutdown().await;
    }

    /// Cooperative shutdown in deterministic (sorted-id) order.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.shutdown.notify_waiters();

        let mut ids: Vec<String> = self.servers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        for id in ids {
            if let Some(server) = self.servers.get(&id).map(|e| e.value().clone()) {
                Self::stop_server(&server).await;
                debug!(server = %id, "server shut down");
            }
        }
    }
}

fn transport_state_name(state: switchboard_transport::TransportState) -> String {
    use switchboard_transport::TransportState;
    match state {
        TransportState::Disconnected => "disconnected".to_owned(),
        TransportState::Connecting => "connecting".to_owned(),
        TransportState::Connected => "connected".to_owned(),
        TransportState::Failed { reason } => format!("failed: {reason}"),
    }
}

#[async_trait]
impl ToolInvoker for McpRoster {
    async fn invoke(
        &self,
        server: &str,
        tool: &str,
        args: Value,
        deadline: Duration,
    ) -> Result<CallToolResult, InvokeError> {
        let managed = self
            .servers
            .get(server)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| InvokeError::Unreachable(format!("unknown server '{server}'")))?;
        if !managed.settings.enabled || managed.lifecycle() == ServerLifecycle::Disabled {
            return Err(InvokeError::Disabled);
        }
        managed.connection.call_tool(tool, args, deadline).await
    }
}

impl std::fmt::Debug for McpRoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("McpRoster").field("servers", &self.servers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchboard_core::config::Snapshot;
    use switchboard_core::ConfigStore;

    fn core_with_servers(servers: Vec<McpServerSettings>) -> Core {
        Core::new(ConfigStore::from_snapshot(Snapshot {
            mcp_servers: servers,
            ..Snapshot::default()
        }))
    }

    fn disabled_server(id: &str) -> McpServerSettings {
        McpServerSettings {
            id: id.to_owned(),
            endpoint: McpEndpoint::Http { url: "http://127.0.0.1:1/rpc".into() },
            auth_token: None,
            enabled: false,
            category: None,
            core: false,
            max_inflight: 2,
        }
    }

    #[tokio::test]
    async fn empty_fleet_still_publishes_the_file_builtins() {
        let catalog = Arc::new(ToolCatalog::new());
        let _roster = McpRoster::new(core_with_servers(vec![]), catalog.clone());
        let snapshot = catalog.snapshot();
        assert_eq!(snapshot.len(), 5);
        assert!(snapshot.get("fs__read_text").is_some());
    }

    #[tokio::test]
    async fn disabled_servers_contribute_nothing_and_refuse_calls() {
        let catalog = Arc::new(ToolCatalog::new());
        let roster = McpRoster::new(core_with_servers(vec![disabled_server("off")]), catalog.clone());
        roster.start();

        let statuses = roster.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, ServerLifecycle::Disabled);

        let result = roster
            .invoke("off", "anything", Value::Null, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(InvokeError::Disabled)));

        // Catalog holds only the built-ins.
        assert_eq!(catalog.snapshot().servers().len(), 1);
        roster.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_server_is_unreachable() {
        let roster = McpRoster::new(core_with_servers(vec![]), Arc::new(ToolCatalog::new()));
        let result = roster
            .invoke("ghost", "tool", Value::Null, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(InvokeError::Unreachable(_))));
    }

    #[test]
    fn transports_map_to_endpoints() {
        let stdio = build_transport(&McpServerSettings {
            id: "a".into(),
            endpoint: McpEndpoint::Stdio { command: "mcp-time".into(), args: vec![] },
            auth_token: None,
            enabled: true,
            category: None,
            core: false,
            max_inflight: 1,
        });
        assert_eq!(stdio.endpoint(), "stdio://mcp-time");

        let unix = build_transport(&McpServerSettings {
            id: "b".into(),
            endpoint: McpEndpoint::Unix { path: "/tmp/x.sock".into() },
            auth_token: None,
            enabled: true,
            category: None,
            core: false,
            max_inflight: 1,
        });
        assert_eq!(unix.endpoint(), "unix:///tmp/x.sock");
    }
}
