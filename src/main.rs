//! Splitter federation binary entry point

use std::time::Duration;

use splitter_federation::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Build Axum router
/// 5. Start background federation worker
/// 6. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("SPLITTER__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "splitter_federation=info,tower_http=debug".into())
    };

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting Splitter federation...");

    // 2. Initialize metrics
    splitter_federation::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        federation_enabled = config.federation.enabled,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Build Axum router
    let app = splitter_federation::build_router(state.clone());

    // 6. Start background tasks
    if config.federation.enabled {
        spawn_federation_worker(&state).await;
    } else {
        tracing::info!("Federation disabled; background worker not started");
    }

    // 7. Start HTTP server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

/// Score reputations once, then start the periodic retry and reputation loops
async fn spawn_federation_worker(state: &AppState) {
    match state.worker.run_reputation_sweep().await {
        Ok(Some(scored)) => tracing::info!(scored, "Initial reputation sweep completed"),
        Ok(None) => {}
        Err(error) => tracing::error!(%error, "Initial reputation sweep failed"),
    }

    let federation = &state.config.federation;
    state.worker.clone().spawn(
        Duration::from_secs(federation.retry_interval_seconds),
        Duration::from_secs(federation.reputation_interval_seconds),
    );
    tracing::info!(
        retry_interval_seconds = federation.retry_interval_seconds,
        reputation_interval_seconds = federation.reputation_interval_seconds,
        "Federation worker spawned"
    );
}
