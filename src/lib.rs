pub mod cache;
pub mod config;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod loader;
pub mod source;
pub mod types;
pub mod upstream;
pub mod viewport;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use controller::TileController;
pub use error::{ErrorKind, Result, TileError};
pub use source::{OsmTileSource, TemplateTileSource, TileSource};
pub use types::{Tile, TileImage, TileKey, TileState};
pub use viewport::{visible_tiles, Coordinate};
