pub mod stats;
pub mod tile;
pub mod viewport;

pub use stats::get_stats;
pub use tile::get_tile;
pub use viewport::post_viewport;

use crate::controller::TileController;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub controller: TileController,
    pub cache_max_age_secs: u64,
    /// How long a tile request waits for its load before giving up.
    pub request_timeout: Duration,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/{z}/{x}/{filename}", get(get_tile))
        .route("/viewport", post(post_viewport))
        .route("/stats", get(get_stats))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
