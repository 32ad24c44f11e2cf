//! botlink: authenticated control plane for a chat bot
//!
//! Companion services (web dashboard, admin tools) connect over TCP, send
//! JSON requests naming an endpoint, and get JSON responses back.
//!
//! Features:
//! - Shared-secret handshake per connection (`ping` is exempt)
//! - Endpoint registry with fixed argument arity
//! - Short-read or length-prefixed framing with a frame size cap
//! - Concurrent sessions with graceful shutdown
//! - Configuration via CLI arguments, environment, or TOML file

mod auth;
mod bot;
mod config;
mod connection;
mod dispatch;
mod endpoints;
mod envelope;
mod error;
mod frame;
mod registry;
mod server;
mod session;

use bot::{Bot, LoggingBot};
use config::Config;
use registry::Registry;
use server::Server;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        framing = ?config.framing,
        max_connections = config.max_connections,
        max_frame_size = config.max_frame_size,
        "Starting botlink control server"
    );

    let bot: Arc<dyn Bot> = Arc::new(LoggingBot);
    let mut registry = Registry::new();
    endpoints::register_all(&mut registry, bot)?;
    info!(endpoints = ?registry.keys(), "Endpoints registered");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(Server::new(config, registry).run(shutdown_signal()))?;

    info!("Server stopped");
    Ok(())
}

/// Resolves on Ctrl-C. A failure to install the handler is logged and the
/// server keeps running.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
