use crate::error::Result;
use bytes::Bytes;
use image::DynamicImage;
use std::sync::Arc;

/// Edge length of a map tile in pixels.
pub const TILE_SIZE: u32 = 256;

/// Identity of one tile: which source it comes from and where it sits in
/// that source's pyramid.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileKey {
    pub source: Arc<str>,
    pub zoom: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(source: impl Into<Arc<str>>, zoom: u8, x: u32, y: u32) -> Self {
        Self {
            source: source.into(),
            zoom,
            x,
            y,
        }
    }

    /// File name of this tile inside its source's cache directory.
    pub fn file_name(&self, extension: &str) -> String {
        format!("{}_{}_{}.{}", self.zoom, self.x, self.y, extension)
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}/{}", self.source, self.zoom, self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Empty,
    Loading,
    Loaded,
    Failed,
}

/// Encoded tile payload together with its decoded pixels.
///
/// Only ever constructed from bytes that decoded successfully, so a
/// `TileImage` that exists is always complete.
#[derive(Debug, PartialEq)]
pub struct TileImage {
    pub data: Bytes,
    pub decoded: DynamicImage,
}

impl TileImage {
    pub fn decode(data: Bytes) -> Result<Self> {
        let decoded = image::load_from_memory(&data)?;
        Ok(Self { data, decoded })
    }

    pub fn width(&self) -> u32 {
        self.decoded.width()
    }

    pub fn height(&self) -> u32 {
        self.decoded.height()
    }
}

/// A tile as handed out to callers.
///
/// Cloning is cheap: the image is behind an `Arc` and never mutated once
/// attached, so a `Loaded` tile can be shared freely across threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Tile {
    key: TileKey,
    state: TileState,
    image: Option<Arc<TileImage>>,
    stale: bool,
}

impl Tile {
    pub fn loaded(key: TileKey, image: Arc<TileImage>) -> Self {
        Self {
            key,
            state: TileState::Loaded,
            image: Some(image),
            stale: false,
        }
    }

    pub fn failed(key: TileKey) -> Self {
        Self {
            key,
            state: TileState::Failed,
            image: None,
            stale: false,
        }
    }

    /// Marks the tile as served from an expired disk record.
    pub fn into_stale(mut self) -> Self {
        self.stale = true;
        self
    }

    pub fn key(&self) -> &TileKey {
        &self.key
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn image(&self) -> Option<&Arc<TileImage>> {
        self.image.as_ref()
    }

    pub fn is_loaded(&self) -> bool {
        self.state == TileState::Loaded
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }
}
