//! switchboard-gateway: the public ingress service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use switchboard_core::{ConfigStore, Core};
use switchboard_gateway::{build_router, GatewayState, RunnerClient};
use switchboard_providers::ProviderRegistry;

/// Exit code for configuration errors.
const EX_CONFIG: u8 = 64;
/// Exit code for a failed port bind.
const EX_BIND: u8 = 65;
/// Exit code for unrecoverable internal errors.
const EX_INTERNAL: u8 = 70;

#[derive(Debug, Parser)]
#[command(name = "switchboard-gateway", version, about = "Public ingress for switchboard")]
struct Args {
    /// Path to the configuration file.
    #[arg(long, env = "SWITCHBOARD_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(code) => ExitCode::from(code),
    }
}

async fn run(args: Args) -> Result<(), u8> {
    let store = ConfigStore::load(args.config).map_err(|e| {
        error!("configuration error: {e}");
        EX_CONFIG
    })?;
    let core = Core::new(store);
    let snapshot = core.config.snapshot();

    let metrics = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| {
            error!("failed to install metrics recorder: {e}");
            EX_INTERNAL
        })?;

    let providers = ProviderRegistry::new(core.clone());
    let probe_task = providers.spawn_probe_loop();

    let runner = RunnerClient::new(
        snapshot.runner.base_url.clone(),
        snapshot.gateway.auth_token.clone(),
        Duration::from_secs(snapshot.timeouts.admin_secs.max(1)),
    );

    let state = GatewayState::new(core, providers, runner, metrics);

    let bind: SocketAddr = snapshot.gateway.bind.parse().map_err(|e| {
        error!("invalid gateway.bind '{}': {e}", snapshot.gateway.bind);
        EX_CONFIG
    })?;
    let listener = tokio::net::TcpListener::bind(bind).await.map_err(|e| {
        error!("failed to bind {bind}: {e}");
        EX_BIND
    })?;
    info!(%bind, "gateway listening");

    let app = build_router(state).into_make_service_with_connect_info::<SocketAddr>();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    probe_task.abort();

    served.map_err(|e| {
        error!("server error: {e}");
        EX_INTERNAL
    })?;
    info!("gateway stopped cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
