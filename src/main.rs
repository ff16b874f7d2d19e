// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Identity Gateway API Server
//!
//! Authenticates users against the external identity authority, keeps
//! their sessions and second factors, and brokers OAuth connections to
//! third-party applications.

use identity_gateway::{
    config::Config,
    db::{MemoryStore, PostgresStore, SharedStore},
    services::{spawn_session_reaper, HttpIdentityProvider, HttpOAuthProvider},
    AppState,
};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured JSON logging
    init_logging()?;

    // Load configuration from environment
    let config = Config::from_env()?;
    tracing::info!(
        port = config.port,
        apps = config.oauth_apps.len(),
        "Starting Identity Gateway"
    );

    let store: SharedStore = match config.database_url.as_deref() {
        Some(url) => {
            let store = PostgresStore::connect(url, config.database_max_connections).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store; state is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };
    let identity = Arc::new(HttpIdentityProvider::new(&config)?);
    let provider = Arc::new(HttpOAuthProvider::new(&config)?);

    // Build shared state
    let state = Arc::new(AppState::build(
        config.clone(),
        store,
        identity,
        provider,
    )?);

    let reaper = spawn_session_reaper(
        state.sessions.clone(),
        Duration::from_secs(config.session_cleanup_interval_secs.max(1)),
    );
    tracing::info!(
        interval_secs = config.session_cleanup_interval_secs,
        "Session reaper started"
    );

    // Build router
    let app = identity_gateway::routes::create_router(state);

    // Start server
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    tracing::info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Initialize structured JSON logging.
fn init_logging() -> anyhow::Result<()> {
    let format = tracing_subscriber::fmt::layer()
        .json()
        .with_target(false)
        .with_current_span(true)
        .flatten_event(true);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("identity_gateway=debug".parse()?)
                .add_directive("info".parse()?),
        )
        .with(format)
        .init();
    Ok(())
}
