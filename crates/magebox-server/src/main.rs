//! `MageBox` server entry point.
//!
//! Loads configuration from environment variables, opens the SQLite store,
//! settles the master key, admin token and CA, then starts the Axum HTTP
//! server with graceful shutdown. A maintenance worker runs alongside the
//! server and is cancelled on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use magebox_core::deploy::SshDeployer;
use magebox_server::bootstrap;
use magebox_server::build_router;
use magebox_server::config::ServerConfig;
use magebox_server::maintenance::maintenance_worker;
use magebox_server::notify::LogNotifier;
use magebox_server::state::AppState;
use magebox_storage::Store;

/// How long shutdown waits for background emails and key pushes.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    for entry in &config.rejected_entries {
        warn!(entry = %entry, "ignoring invalid network entry");
    }
    info!(config = ?config, "MageBox server starting");

    let state = build_app_state(config.clone()).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let maintenance_handle = {
        let state = Arc::clone(&state);
        let mut rx = shutdown_rx.clone();
        tokio::spawn(async move {
            maintenance_worker(state, &mut rx).await;
        })
    };

    let app = build_router(Arc::clone(&state));

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.bind_addr))?;

    info!(addr = %config.bind_addr, "MageBox server listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown_tx))
    .await
    .context("server error")?;

    info!("waiting for background work to finish");
    let _ = tokio::time::timeout(Duration::from_secs(10), maintenance_handle).await;
    if !state.tasks.drain(DRAIN_TIMEOUT).await {
        warn!(
            in_flight = state.tasks.in_flight(),
            "background tasks still running at shutdown"
        );
    }

    state.store.close().await;
    info!("MageBox server stopped");
    Ok(())
}

/// Open the store and settle the master key, admin token, and CA.
async fn build_app_state(config: ServerConfig) -> anyhow::Result<Arc<AppState>> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

    let key = bootstrap::load_master_key(&config)?;
    let store = Store::open(&config.db_path, key)
        .await
        .with_context(|| format!("failed to open database {}", config.db_path.display()))?;

    let admin = bootstrap::bootstrap_admin_token(
        &store,
        config.admin_token.as_deref().map(String::as_str),
        magebox_core::crypto::TokenHashParams::default(),
    )
    .await?;
    if let Some(token) = &admin.generated {
        announce_admin_token(token);
    }

    bootstrap::ensure_ca(&store, &config).await?;

    let deployer = Arc::new(SshDeployer::new(config.ssh_timeout));
    Ok(Arc::new(AppState::new(
        config,
        store,
        admin.hash,
        deployer,
        Arc::new(LogNotifier),
    )))
}

/// Print a freshly generated admin token to the terminal, once. It is
/// kept out of the structured log.
#[allow(clippy::print_stderr)]
fn announce_admin_token(token: &str) {
    eprintln!();
    eprintln!("  Generated admin token (shown once, store it now):");
    eprintln!();
    eprintln!("    {token}");
    eprintln!();
}

/// Wait for SIGINT or SIGTERM, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
