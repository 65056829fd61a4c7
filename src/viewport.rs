use crate::types::TILE_SIZE;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Latitude beyond which Web-Mercator is undefined.
pub const MAX_LATITUDE: f64 = 85.051_128_78;

/// Largest view edge, in pixels, that tiles are enumerated for.
pub const MAX_VIEWPORT_PX: u32 = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub lat: f64,
    pub lon: f64,
}

impl Coordinate {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Position in world pixels at `zoom`, origin at the north-west corner.
    pub fn to_pixel(&self, zoom: u8) -> (f64, f64) {
        let world = world_size(zoom);
        let lat = self.lat.clamp(-MAX_LATITUDE, MAX_LATITUDE).to_radians();
        let x = (self.lon + 180.0) / 360.0 * world;
        let y = (1.0 - (lat.tan() + 1.0 / lat.cos()).ln() / PI) / 2.0 * world;
        (x.clamp(0.0, world), y.clamp(0.0, world))
    }

    /// Tile containing this coordinate at `zoom`.
    pub fn to_tile(&self, zoom: u8) -> (u32, u32) {
        let (x, y) = self.to_pixel(zoom);
        let last = tiles_per_axis(zoom) - 1;
        (
            ((x / TILE_SIZE as f64) as u64).min(last) as u32,
            ((y / TILE_SIZE as f64) as u64).min(last) as u32,
        )
    }

    pub fn from_pixel(x: f64, y: f64, zoom: u8) -> Self {
        let world = world_size(zoom);
        let lon = x / world * 360.0 - 180.0;
        let n = PI * (1.0 - 2.0 * y / world);
        Self {
            lat: n.sinh().atan().to_degrees(),
            lon,
        }
    }
}

fn tiles_per_axis(zoom: u8) -> u64 {
    1u64 << zoom.min(31)
}

fn world_size(zoom: u8) -> f64 {
    tiles_per_axis(zoom) as f64 * TILE_SIZE as f64
}

/// Tiles covering a `width` x `height` pixel view centred on `center`,
/// nearest to the centre first.
///
/// The range is clamped to the world; nothing wraps around the antimeridian.
/// Edges longer than [`MAX_VIEWPORT_PX`] are cut down to it around the centre.
pub fn visible_tiles(center: Coordinate, zoom: u8, width: u32, height: u32) -> Vec<(u32, u32)> {
    if width == 0 || height == 0 {
        return Vec::new();
    }
    let width = width.min(MAX_VIEWPORT_PX);
    let height = height.min(MAX_VIEWPORT_PX);

    let tile = TILE_SIZE as f64;
    let last = tiles_per_axis(zoom) - 1;
    let (cx, cy) = center.to_pixel(zoom);
    let half_w = width as f64 / 2.0;
    let half_h = height as f64 / 2.0;

    let span = |lo: f64, hi: f64| -> (u64, u64) {
        let first = (lo / tile).floor().max(0.0) as u64;
        let last_covered = ((hi / tile).ceil() - 1.0).max(0.0) as u64;
        (first.min(last), last_covered.min(last))
    };
    let (x0, x1) = span(cx - half_w, cx + half_w);
    let (y0, y1) = span(cy - half_h, cy + half_h);

    let mut tiles: Vec<(u32, u32)> = (y0..=y1)
        .flat_map(|y| (x0..=x1).map(move |x| (x as u32, y as u32)))
        .collect();

    let distance = |&(x, y): &(u32, u32)| {
        let dx = (x as f64 + 0.5) * tile - cx;
        let dy = (y as f64 + 0.5) * tile - cy;
        dx * dx + dy * dy
    };
    tiles.sort_by(|a, b| distance(a).total_cmp(&distance(b)).then((a.1, a.0).cmp(&(b.1, b.0))));
    tiles
}
