//! fedcore binary entry point

use fedcore::service::JobRunner;
use fedcore::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// How often the actor cache and old ordering records are pruned
const PRUNE_INTERVAL_SECS: u64 = 600;

/// Application entry point
///
/// # Setup
/// 1. Initialize tracing/logging
/// 2. Load configuration from file and environment
/// 3. Initialize AppState
/// 4. Start background runners (jobs, delivery, pruning)
/// 5. Start HTTP server
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 1. Initialize tracing/logging
    let log_format =
        std::env::var("FEDCORE__LOGGING__FORMAT").unwrap_or_else(|_| "pretty".to_string());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "fedcore=info,tower_http=debug".into());

    if log_format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }

    tracing::info!("Starting fedcore...");

    // 2. Initialize metrics
    fedcore::metrics::init_metrics();

    // 3. Load configuration
    let config = config::AppConfig::load()?;
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 4. Initialize application state
    let state = AppState::new(config.clone()).await?;

    // 5. Start background runners
    tokio::spawn(JobRunner::new(state.clone()).run());
    tokio::spawn(state.delivery.clone().run());
    spawn_prune_task(state.clone());
    tracing::info!("Background runners spawned");

    // 6. Start HTTP server
    let app = fedcore::build_router(state);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;

    Ok(())
}

fn spawn_prune_task(state: AppState) {
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(std::time::Duration::from_secs(PRUNE_INTERVAL_SECS));
        let retention =
            chrono::Duration::seconds(state.config.federation.tombstone_retention_secs);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            state.resolver.prune_expired().await;
            match state.db.prune_tombstones(chrono::Utc::now() - retention).await {
                Ok(0) => {}
                Ok(pruned) => tracing::debug!(pruned, "Pruned ordering records"),
                Err(error) => tracing::warn!(%error, "Failed to prune ordering records"),
            }
        }
    });
}
