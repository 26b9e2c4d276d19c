#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # abridge
//!
//! Multi-session supervisor and streaming bridge for AI assistant CLIs.
//!
//! abridge hosts long-lived assistant processes inside tmux sessions, feeds
//! them user input over named pipes, persists every frame to per-session
//! NDJSON journals, and fans out a normalized event stream to any number of
//! WebSocket observers. Assistant processes survive server restarts; a fresh
//! server reconciles against the surviving tmux sessions on startup.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    routing::{delete, get, post},
    Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use abridge::{
    config::Config,
    mux::TmuxMux,
    routes,
    sessions::{transform::NoiseFilter, EngineConfig, SessionEngine},
    state::AppState,
    ws,
};

/// Multi-session supervisor and streaming bridge for AI assistant CLIs.
#[derive(Parser)]
#[command(name = "abridge", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP/WS server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

#[allow(clippy::too_many_lines)]
async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("abridge v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    let sessions_root = config.server.sessions_root_path();
    let vault_root = config.assistant.vault_root_path();
    info!("Sessions root: {}", sessions_root.display());

    let mux = Arc::new(TmuxMux::new(&config.assistant.binary));
    let engine = SessionEngine::new(
        EngineConfig {
            sessions_root,
            vault_root,
            default_model: config.assistant.default_model.clone(),
            wake_timeout: Duration::from_secs(config.engine.wake_timeout_secs),
            reap_idle: Duration::from_secs(config.engine.reap_idle_secs),
            reap_interval: Duration::from_secs(config.engine.reap_interval_secs),
            noise: Arc::new(NoiseFilter::new(
                &config.engine.noise_patterns,
                config.engine.match_mode(),
            )),
        },
        mux,
    );

    // Reattach to supervisor harnesses that survived the last server run.
    engine.reconcile().await;

    // Hibernate sessions idle past the threshold.
    let reaper_task = engine.spawn_reaper();

    let state = AppState {
        config: Arc::new(config),
        start_time: Instant::now(),
        engine: engine.clone(),
    };

    let api_routes = Router::new()
        .route("/api/health", get(routes::health::health))
        .route(
            "/api/agents",
            get(routes::agents::list_agents).post(routes::agents::create_agent),
        )
        .route("/api/agents/{id}", delete(routes::agents::interrupt_agent))
        .route(
            "/api/test/destroy-session/{id}",
            post(routes::test::destroy_session),
        )
        .route("/api/test/restart-engine", post(routes::test::restart_engine));

    let ws_route = Router::new().route("/ws/chat/{session_id}", get(ws::ws_chat));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
        ]);

    let app = Router::new()
        .merge(api_routes)
        .merge(ws_route)
        .with_state(state.clone())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(tower::limit::ConcurrencyLimitLayer::new(
            state.config.server.max_connections,
        ));

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: supervisors see EOF on their FIFOs; tmux sessions stay alive
    // for the next reconcile.
    info!("Shutting down...");
    reaper_task.abort();
    engine.stop().await;
    info!("Goodbye");
}
