//! agentbridge server
//!
//! Runs one agent subprocess per working directory and lets remote clients
//! drive them over a multiplexed WebSocket, one controlling client at a time.

mod auth;
mod cmd_status;
mod config;
mod control_lock;
mod forwarder;
mod logging;
mod paths;
mod process_manager;
mod scheduler;
mod session_catalog;
mod state;
mod websocket;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};

use crate::config::{Cli, Command, ServerConfig};
use crate::paths::DataPaths;
use crate::process_manager::ProcessManager;
use crate::session_catalog::EmptySessionCatalog;
use crate::state::BridgeState;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Some(Command::Status { bind }) => cmd_status::run(&paths, bind).await,
        Some(Command::GenerateToken) => cmd_status::generate_token(&paths),
        Some(Command::Start(args)) => serve(args.into_config(&paths)?, &paths).await,
        None => serve(cli.start.into_config(&paths)?, &paths).await,
    }
}

async fn serve(config: ServerConfig, paths: &DataPaths) -> anyhow::Result<()> {
    paths
        .ensure_dirs()
        .with_context(|| format!("failed to create {}", paths.root().display()))?;
    let logging = logging::init_logging(paths, config.log_stderr)?;

    info!(
        component = "server",
        event = "server.starting",
        version = VERSION,
        run_id = %logging.run_id,
        bind = %config.bind,
        data_dir = %paths.root().display(),
        agent = %config.forwarder.command.program,
        auth = config.auth_token.is_some(),
        "Starting agentbridge server"
    );

    if config.auth_token.is_none() {
        warn!(
            component = "server",
            event = "server.auth.disabled",
            bind = %config.bind,
            "No auth token configured; accepting unauthenticated loopback connections"
        );
    }

    let (manager, events) = ProcessManager::new(config.manager.clone(), config.forwarder.clone());
    let _sweep = manager.start_idle_sweep();

    let state = Arc::new(BridgeState::new(
        manager.clone(),
        Arc::new(EmptySessionCatalog),
        config.bridge.clone(),
    ));
    let router_task = websocket::spawn_event_router(state.clone(), events);

    let app = websocket::router(state.clone(), config.auth_token.clone());
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;

    if let Err(e) = cmd_status::write_pid_file(paths) {
        warn!(
            component = "server",
            event = "server.pid_file.write_failed",
            error = %e,
            "Failed to write pid file"
        );
    }
    info!(
        component = "server",
        event = "server.listening",
        bind = %config.bind,
        "Listening"
    );

    let shutdown_state = state.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(
                component = "server",
                event = "server.shutdown.requested",
                "Shutdown requested, closing connections"
            );
            shutdown_state.kick_all();
        })
        .await?;

    manager.shutdown().await;
    router_task.abort();
    cmd_status::remove_pid_file(paths);
    info!(
        component = "server",
        event = "server.stopped",
        "Server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(
                component = "server",
                event = "server.signal.ctrl_c_failed",
                error = %e,
                "Failed to listen for Ctrl-C"
            );
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(
                    component = "server",
                    event = "server.signal.sigterm_failed",
                    error = %e,
                    "Failed to listen for SIGTERM"
                );
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
