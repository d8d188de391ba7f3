use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use gateway_config::GatewayConfig;
use rpc_gate::prober::{Prober, PROBE_INTERVAL};

/// How long in-flight requests may drain after a shutdown signal.
const DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// Exit codes: 0 clean shutdown, 1 startup failure (the `?` paths
/// below), 2 irrecoverable fault while serving or draining.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let config = GatewayConfig::from_env().context("configuration error")?;
    if config.chains.is_empty() {
        warn!("no chains configured; only the control plane is reachable");
    }

    let port = config.port;
    let state = rpc_gate::AppState::new(config).await;
    info!(chains = ?state.registry.chain_names(), "chain registry loaded");

    let prober = Prober::spawn(&state.pool, PROBE_INTERVAL);
    let app = rpc_gate::app_with_state(state);

    let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port)))
        .await
        .with_context(|| format!("bind failed on port {port}"))?;
    info!(
        "listening on {}",
        listener.local_addr().map(|a| a.to_string()).unwrap_or_default()
    );

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    prober.shutdown();
    if let Err(e) = result {
        error!(error = %e, "server fault during shutdown");
        std::process::exit(2);
    }
    info!("shutdown complete");
    Ok(())
}

/// Resolves on SIGINT/SIGTERM. Once signalled, a watchdog enforces the
/// drain budget: if connections are still open past it, the process is
/// declared stuck.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!(budget_secs = DRAIN_BUDGET.as_secs(), "shutdown signal received, draining");
    tokio::spawn(async {
        tokio::time::sleep(DRAIN_BUDGET).await;
        error!("drain budget exceeded, aborting");
        std::process::exit(2);
    });
}
