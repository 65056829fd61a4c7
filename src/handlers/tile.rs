use super::AppState;
use crate::error::{Result, TileError};
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::sync::Arc;

pub async fn get_tile(
    State(state): State<Arc<AppState>>,
    Path((z, x, filename)): Path<(u8, u32, String)>,
) -> Result<Response> {
    // "5461.png" -> 5461
    let tile_type = state.controller.source().tile_type().to_string();
    let y: u32 = filename
        .strip_suffix(tile_type.as_str())
        .and_then(|rest| rest.strip_suffix('.'))
        .ok_or(TileError::InvalidCoordinates)?
        .parse()
        .map_err(|_| TileError::InvalidCoordinates)?;

    let tile = tokio::time::timeout(state.request_timeout, state.controller.fetch(x, y, z))
        .await
        .map_err(|_| TileError::Timeout)??;

    let image = tile.image().ok_or(TileError::NotFound)?;
    // Stale tiles are a fallback and should not linger in client caches
    let cache_control = if tile.is_stale() {
        "no-cache".to_string()
    } else {
        format!("public, max-age={}", state.cache_max_age_secs)
    };

    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, content_type(&tile_type).to_string()),
            (header::CACHE_CONTROL, cache_control),
        ],
        Body::from(image.data.clone()),
    )
        .into_response())
}

fn content_type(tile_type: &str) -> &'static str {
    match tile_type {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        _ => "application/octet-stream",
    }
}
