use std::sync::atomic::{AtomicUsize, Ordering};

pub trait TileSource: Send + Sync + std::fmt::Debug {
    /// Stable identifier, also the disk cache subdirectory.
    fn name(&self) -> &str;

    fn tile_url(&self, zoom: u8, x: u32, y: u32) -> String;

    fn min_zoom(&self) -> u8 {
        0
    }

    fn max_zoom(&self) -> u8 {
        18
    }

    /// Image format, used as the file extension on disk.
    fn tile_type(&self) -> &str {
        "png"
    }
}

/// The standard OpenStreetMap rendering, spread over its mirror hosts.
#[derive(Debug)]
pub struct OsmTileSource {
    servers: Vec<&'static str>,
    current_server: AtomicUsize,
}

impl OsmTileSource {
    pub fn mapnik() -> Self {
        Self {
            servers: vec![
                "a.tile.openstreetmap.org",
                "b.tile.openstreetmap.org",
                "c.tile.openstreetmap.org",
            ],
            current_server: AtomicUsize::new(0),
        }
    }

    /// Get next server using round-robin
    fn next_server(&self) -> &'static str {
        let idx = self.current_server.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        self.servers[idx]
    }
}

impl TileSource for OsmTileSource {
    fn name(&self) -> &str {
        "mapnik"
    }

    fn tile_url(&self, zoom: u8, x: u32, y: u32) -> String {
        format!("https://{}/{}/{}/{}.png", self.next_server(), zoom, x, y)
    }
}

/// A provider described by a URL template with `{z}`, `{x}` and `{y}`
/// placeholders.
#[derive(Debug, Clone)]
pub struct TemplateTileSource {
    name: String,
    template: String,
    min_zoom: u8,
    max_zoom: u8,
    tile_type: String,
}

impl TemplateTileSource {
    pub fn new(name: impl Into<String>, template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            template: template.into(),
            min_zoom: 0,
            max_zoom: 18,
            tile_type: "png".to_string(),
        }
    }

    pub fn with_zoom_range(mut self, min_zoom: u8, max_zoom: u8) -> Self {
        self.min_zoom = min_zoom;
        self.max_zoom = max_zoom;
        self
    }

    pub fn with_tile_type(mut self, tile_type: impl Into<String>) -> Self {
        self.tile_type = tile_type.into();
        self
    }
}

impl TileSource for TemplateTileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn tile_url(&self, zoom: u8, x: u32, y: u32) -> String {
        self.template
            .replace("{z}", &zoom.to_string())
            .replace("{x}", &x.to_string())
            .replace("{y}", &y.to_string())
    }

    fn min_zoom(&self) -> u8 {
        self.min_zoom
    }

    fn max_zoom(&self) -> u8 {
        self.max_zoom
    }

    fn tile_type(&self) -> &str {
        &self.tile_type
    }
}
