//! Process entry point: load config, install logging, hand off to the
//! async server loop — no CLI subcommands, nothing else happens in `main`
//! itself.

use std::sync::Arc;

use warden::config::WardenConfig;
use warden::http::{self, AppState};
use warden::planner::InstallRequestEntry;
use warden::{logging, Warden};

#[tokio::main]
async fn main() {
    let config = match WardenConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    logging::setup(config.debug);
    logging::splash();

    let warden = match Warden::bootstrap(config) {
        Ok(warden) => warden,
        Err(e) => {
            tracing::error!("fatal startup error: {e:#}");
            std::process::exit(1);
        }
    };

    if warden.config.debug.is_super() {
        spawn_full_stack_boot(&warden);
    }

    let state = Arc::new(AppState {
        catalog: Arc::clone(&warden.catalog),
        docker: Arc::clone(&warden.docker),
        history: Arc::clone(&warden.history),
        engine: Arc::clone(&warden.engine),
        wizard: Arc::clone(&warden.wizard),
        host_service_base: warden.config.host_service_url.clone(),
    });

    let host = warden.config.api_host;
    let port = warden.config.api_port;

    tracing::info!("listening on {host}:{port}");

    let result = http::serve(host, port, state, shutdown_signal()).await;

    tracing::info!("shutting down, stopping tracked containers");
    warden.engine.stop_all_tracked().await;

    match result {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            tracing::error!("server error: {e}");
            std::process::exit(1);
        }
    }
}

/// `DEBUG=super` installs every catalog service at startup, not just the
/// required ones. Runs in the background so the HTTP surface is reachable
/// immediately; failures are logged, not fatal.
fn spawn_full_stack_boot(warden: &Warden) {
    let engine = Arc::clone(&warden.engine);
    let entries: Vec<InstallRequestEntry> = warden
        .catalog
        .list()
        .into_iter()
        .map(|d| InstallRequestEntry::Bare(serde_json::Value::String(d.name.clone())))
        .collect();

    tokio::spawn(async move {
        tracing::info!("DEBUG=super: booting full stack at startup");
        if let Err(e) = engine.install(&entries).await {
            tracing::error!("full-stack boot failed: {e}");
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
