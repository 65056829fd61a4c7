use maptile_loader::handlers::{self, AppState};
use maptile_loader::{Config, OsmTileSource, TileController};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "maptile_loader=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::default();

    tracing::info!(bind_addr = %config.bind_addr, "Starting map tile loader");
    tracing::info!(cache_dir = ?config.cache_dir, "Disk cache directory");
    tracing::info!(
        memory_cache_size = config.memory_cache_size,
        max_workers = config.max_workers,
        "Cache and worker limits"
    );

    let controller = TileController::from_config(&config, Arc::new(OsmTileSource::mapnik()))?;

    let state = Arc::new(AppState {
        controller,
        cache_max_age_secs: config.disk_max_age.as_secs(),
        // Leave the loader room to report its own upstream timeout
        request_timeout: config.upstream_timeout * 2,
    });

    let app = handlers::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("Listening on {}", config.bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
