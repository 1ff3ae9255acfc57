use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use tower_http::trace::TraceLayer;
use tracing::info;

use tricell_server::session::SessionManager;
use tricell_server::ws::{AppState, ws_handler};

#[derive(Parser, Debug)]
#[command(name = "tricell-server", version, about = "tricell simulation server")]
struct Cli {
    /// TCP address to bind the WebSocket server.
    #[arg(long, env = "TRICELL_BIND", default_value = "127.0.0.1:8080")]
    bind: SocketAddr,

    /// Seconds a disconnected session survives before its run is discarded.
    #[arg(long, env = "TRICELL_DISCONNECT_TTL", default_value_t = 60)]
    disconnect_ttl_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let sessions = SessionManager::new(Duration::from_secs(cli.disconnect_ttl_secs));
    let state = AppState { sessions: sessions.clone() };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(cli.bind)
        .await
        .with_context(|| format!("failed to bind {}", cli.bind))?;
    info!(bind = %cli.bind, ttl_secs = cli.disconnect_ttl_secs, "tricell server listening");

    axum::serve(listener, app)
        .await
        .context("server terminated")?;
    sessions.shutdown();
    Ok(())
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
