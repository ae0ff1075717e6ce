mod api;
mod cache;
mod config;
mod gateway;
mod idp;
mod openapi;
mod portal;
mod profile;
mod session;
mod state;
#[cfg(test)]
mod test_utils;

use crate::state::AppState;
use axum::Router;
use log::{error, info};
use std::net::{IpAddr, SocketAddr};

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::init_from_env(env_logger::Env::default().default_filter_or("info"));

    // Load configuration from environment
    let config = match config::AuthServerConfig::load() {
        Ok(config) => config,
        Err(e) => {
            error!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Load the platform globals (portal URLs, redis, configured auth methods)
    let globals = match config::Globals::load(&config.globals_file) {
        Ok(globals) => globals,
        Err(e) => {
            error!("Failed to load globals from {}: {e}", config.globals_file);
            std::process::exit(1);
        }
    };

    // Initialize the shared key-value store backing sessions and profiles
    let cache = match cache::create_cache(&config, &globals).await {
        Ok(cache) => cache,
        Err(e) => {
            error!("Failed to initialize session store backend: {e}");
            std::process::exit(1);
        }
    };

    // Initialize application state
    let state = match AppState::with_existing_cache(&config, &globals, cache) {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize application state: {e}");
            std::process::exit(1);
        }
    };

    // Create the application router with one OAuth2 router per auth method
    let app = match create_app(state).await {
        Ok(app) => app,
        Err(e) => {
            error!("Failed to set up auth method routers: {e}");
            std::process::exit(1);
        }
    };

    let host = config.host.parse::<IpAddr>().unwrap_or_else(|e| {
        error!("Invalid host: {} ({})", config.host, e);
        std::process::exit(1);
    });
    let addr = SocketAddr::new(host, config.port);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {addr}: {e}");
            std::process::exit(1);
        }
    };

    info!("Authorization server running on {addr}, press Ctrl+C to stop");
    let serve = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = serve {
        error!("Server error: {e}");
        std::process::exit(1);
    }

    info!("Server shutdown complete");
}

/// Create a new application instance with a given state
pub async fn create_app(state: AppState) -> Result<Router, String> {
    Ok(Router::new().merge(api::router(&state)?).with_state(state))
}

// Simple signal handler that works on all platforms
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
