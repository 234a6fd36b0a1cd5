//! # ctrl-daemon
//!
//! Long-running ctrl process. Serves the operator and adapter HTTP API,
//! scans for requests stuck in flight, and reloads the policy and risk
//! documents on SIGHUP.
//!
//! ## Usage
//!
//! ```text
//! ctrl-daemon --config ctrl.toml
//! RUST_LOG=ctrl_gateway=debug ctrl-daemon --log-json
//! ```

mod api;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ctrl_gateway::{
    load_servers_config, ActionDispatcher, ApprovalCoordinator, CtrlConfig, EngineSet, Gateway,
    HttpDispatcher,
};

use crate::api::{router, AppState};

/// ctrl control plane daemon.
#[derive(Parser)]
#[command(name = "ctrl-daemon", about = "ctrl approvals and intercept API", version)]
struct Cli {
    /// Settings file (defaults to ./ctrl.toml; missing means defaults).
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Override the listen address from the settings file.
    #[arg(long)]
    bind: Option<String>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json)?;

    let config = CtrlConfig::load(cli.config.as_deref())?;
    let bind = cli.bind.clone().unwrap_or_else(|| config.http.bind.clone());

    let gateway = Arc::new(Gateway::from_config(&config).context("failed to start gateway")?);
    let servers = load_servers_config(&config.servers_path)?;
    let dispatcher: Arc<dyn ActionDispatcher> = Arc::new(HttpDispatcher::new(&servers));
    let coordinator = Arc::new(
        ApprovalCoordinator::new(gateway.ledger().clone(), Arc::clone(&dispatcher))
            .with_dispatch_timeout(config.dispatch_timeout())
            .with_stale_after(config.stale_after()),
    );

    tracing::info!(
        db = %config.db_path.display(),
        servers = servers.servers.len(),
        approvals = config.approvals.enabled,
        "starting ctrl daemon"
    );

    spawn_stale_scan(Arc::clone(&coordinator), config.scan_interval());
    spawn_reload_on_hangup(Arc::clone(&gateway), config.clone());

    let app = router(AppState {
        gateway,
        coordinator,
        dispatcher,
        dispatch_timeout: config.dispatch_timeout(),
    });
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "HTTP API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    tracing::info!("ctrl daemon shutting down");
    Ok(())
}

fn init_tracing(json: bool) -> Result<()> {
    // Logs go to stderr; RUST_LOG adds to or overrides these directives.
    let filter = EnvFilter::from_default_env()
        .add_directive("ctrl_gateway=info".parse()?)
        .add_directive("ctrl_daemon=info".parse()?);
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .init();
    }
    Ok(())
}

/// Report requests stuck in approved/executing. Never retries them.
fn spawn_stale_scan(coordinator: Arc<ApprovalCoordinator>, period: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            match coordinator.stale_alerts() {
                Ok(alerts) if !alerts.is_empty() => {
                    tracing::warn!(count = alerts.len(), "stale in-flight requests need attention");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "stale scan failed"),
            }
        }
    });
}

#[cfg(unix)]
fn spawn_reload_on_hangup(gateway: Arc<Gateway>, config: CtrlConfig) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangups = match signal(SignalKind::hangup()) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "SIGHUP reload unavailable");
                return;
            }
        };
        while hangups.recv().await.is_some() {
            // A bad document keeps the current generation running.
            match EngineSet::load(&config).and_then(|engines| gateway.reload(engines)) {
                Ok(generation) => tracing::info!(generation, "configuration reloaded"),
                Err(e) => tracing::error!(error = %e, "reload failed, keeping current engines"),
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_on_hangup(_gateway: Arc<Gateway>, _config: CtrlConfig) {}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
