use super::AppState;
use crate::error::{Result, TileError};
use crate::viewport::{visible_tiles, Coordinate, MAX_VIEWPORT_PX};
use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub struct ViewportRequest {
    pub center: Coordinate,
    pub zoom: u8,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ViewportResponse {
    /// Loads dropped from the previous view.
    pub cancelled: usize,
    pub visible: usize,
    pub cached: usize,
    pub pending: usize,
}

/// Moves the view: forgets what the old view was waiting for and starts
/// loading what the new one shows, centre first.
pub async fn post_viewport(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ViewportRequest>,
) -> Result<Json<ViewportResponse>> {
    let source = state.controller.source();
    if request.zoom < source.min_zoom() || request.zoom > source.max_zoom() {
        return Err(TileError::InvalidCoordinates);
    }
    if request.width > MAX_VIEWPORT_PX || request.height > MAX_VIEWPORT_PX {
        tracing::debug!(width = request.width, height = request.height, "Viewport too large");
        return Err(TileError::InvalidCoordinates);
    }

    let cancelled = state.controller.cancel_outstanding_jobs();
    let tiles = visible_tiles(request.center, request.zoom, request.width, request.height);
    let cached = tiles
        .iter()
        .filter(|&&(x, y)| state.controller.get_tile(x, y, request.zoom).is_some())
        .count();

    tracing::debug!(
        zoom = request.zoom,
        visible = tiles.len(),
        cached,
        cancelled,
        "Viewport changed"
    );

    Ok(Json(ViewportResponse {
        cancelled,
        visible: tiles.len(),
        cached,
        pending: tiles.len() - cached,
    }))
}
