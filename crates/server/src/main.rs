//! Cowork Server
//!
//! Runs AI coding-agent sessions and a bounded task queue, and streams
//! everything they do to connected UIs over WebSocket.

mod actor;
mod broadcaster;
mod clock;
mod logging;
mod migration_runner;
mod orchestrator;
mod paths;
mod permissions;
mod persistence;
mod runner;
mod session_naming;
mod settings;
mod task_queue;
mod transition;
mod websocket;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::{routing::get, Router};
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use cowork_connector_claude::{ClaudeCliConfig, ClaudeCliService};

use crate::actor::OrchestratorHandle;
use crate::broadcaster::Broadcaster;
use crate::clock::{SystemClock, UuidIds};
use crate::logging::init_logging;
use crate::orchestrator::{Orchestrator, OrchestratorDeps};
use crate::paths::{claude_dir, DataPaths};
use crate::persistence::SqliteSessionStore;
use crate::settings::SettingsManager;
use crate::websocket::{health_handler, ws_handler};

/// Cowork orchestrator server.
#[derive(Parser, Debug)]
#[command(name = "cowork", version, about = "Task queue and session orchestrator for AI coding agents")]
struct Cli {
    /// Address to listen on.
    #[arg(long, env = "COWORK_BIND", default_value = "127.0.0.1:4100")]
    bind: SocketAddr,

    /// Directory for the database, settings overrides and logs (default: ~/.cowork).
    #[arg(long, env = "COWORK_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Path to the Claude CLI binary.
    #[arg(long, env = "CLAUDE_BIN")]
    claude_bin: Option<String>,

    /// Permission mode passed to the Claude CLI.
    #[arg(long, default_value = "default")]
    permission_mode: String,

    /// Tool that waits for a UI answer instead of auto-approval. Repeatable.
    #[arg(long = "interactive-tool", default_value = "AskUserQuestion")]
    interactive_tools: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let paths = DataPaths::resolve(cli.data_dir.as_deref())?;
    paths
        .ensure_dirs()
        .with_context(|| format!("create data directory {}", paths.root().display()))?;
    let logging = init_logging(&paths)?;

    info!(
        component = "server",
        event = "server.starting",
        run_id = %logging.run_id,
        data_dir = %paths.root().display(),
        bind = %cli.bind,
        "Starting Cowork server"
    );

    let store = SqliteSessionStore::open(&paths.db_path())
        .with_context(|| format!("open session store {}", paths.db_path().display()))?;
    let settings = SettingsManager::new(
        paths.settings_path(),
        claude_dir(),
        std::env::current_dir().ok(),
    );
    let agent = Arc::new(ClaudeCliService::new(ClaudeCliConfig {
        binary: cli.claude_bin,
        permission_mode: cli.permission_mode,
        ..ClaudeCliConfig::default()
    }));

    let (orchestrator, events_rx) = Orchestrator::new(OrchestratorDeps {
        store: Box::new(store),
        agent,
        settings,
        broadcaster: Broadcaster::default(),
        clock: Arc::new(SystemClock),
        ids: Arc::new(UuidIds),
        interactive_tools: cli.interactive_tools,
    })?;
    let handle = OrchestratorHandle::spawn(orchestrator, events_rx);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(handle.clone());

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("bind {}", cli.bind))?;
    info!(
        component = "server",
        event = "server.listening",
        bind = %cli.bind,
        "Listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    handle.shutdown().await;
    info!(
        component = "server",
        event = "server.stopped",
        "Cowork server stopped"
    );
    drop(logging);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            component = "server",
            event = "server.signal_failed",
            error = %e,
            "Failed to listen for ctrl-c"
        );
        std::future::pending::<()>().await;
    }
    info!(
        component = "server",
        event = "server.shutdown_requested",
        "Shutdown requested"
    );
}
