use crate::dispatcher::{Dispatch, Job};
use crate::error::{Result, TileError};
use crate::types::{Tile, TileImage, TileKey};
use crate::upstream::{FetchResult, TileFetcher};
use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageBuffer, ImageFormat, Rgba};
use parking_lot::Mutex;
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, SystemTime};
use tokio::sync::Semaphore;

/// A small valid PNG.
pub fn png_bytes() -> Bytes {
    static PNG: OnceLock<Bytes> = OnceLock::new();
    PNG.get_or_init(|| {
        let image = ImageBuffer::from_pixel(4, 4, Rgba([30u8, 120, 200, 255]));
        let mut out = Cursor::new(Vec::new());
        image.write_to(&mut out, ImageFormat::Png).unwrap();
        Bytes::from(out.into_inner())
    })
    .clone()
}

pub fn loaded_tile(key: TileKey) -> Tile {
    Tile::loaded(key, Arc::new(TileImage::decode(png_bytes()).unwrap()))
}

/// Pushes a file's modification time `age` into the past.
pub fn age_file(path: &Path, age: Duration) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() - age).unwrap();
}

#[derive(Debug, Clone)]
pub enum Behavior {
    Png,
    PngWithEtag(&'static str),
    Garbage,
    NotModified,
    Status(u16),
    /// Never answers.
    Hang,
}

/// Scripted upstream that records every request it sees.
pub struct FakeFetcher {
    behavior: Mutex<Behavior>,
    requests: Mutex<Vec<(String, Option<String>)>>,
    gate: Option<Arc<Semaphore>>,
}

impl FakeFetcher {
    pub fn new(behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
            gate: None,
        })
    }

    /// Every request waits for one permit of the returned semaphore.
    pub fn gated(behavior: Behavior) -> (Arc<Self>, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let fetcher = Arc::new(Self {
            behavior: Mutex::new(behavior),
            requests: Mutex::new(Vec::new()),
            gate: Some(gate.clone()),
        });
        (fetcher, gate)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock() = behavior;
    }

    pub fn requests(&self) -> Vec<(String, Option<String>)> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl TileFetcher for FakeFetcher {
    async fn fetch(&self, url: &str, etag: Option<&str>) -> Result<FetchResult> {
        self.requests
            .lock()
            .push((url.to_string(), etag.map(str::to_string)));

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let behavior = self.behavior.lock().clone();
        match behavior {
            Behavior::Png => Ok(FetchResult::Data {
                data: png_bytes(),
                etag: None,
            }),
            Behavior::PngWithEtag(etag) => Ok(FetchResult::Data {
                data: png_bytes(),
                etag: Some(etag.to_string()),
            }),
            Behavior::Garbage => Ok(FetchResult::Data {
                data: Bytes::from_static(b"<html>rate limited</html>"),
                etag: None,
            }),
            Behavior::NotModified => Ok(FetchResult::NotModified),
            Behavior::Status(code) => Err(TileError::UpstreamStatus(code)),
            Behavior::Hang => std::future::pending().await,
        }
    }
}

/// A dispatcher whose queue is always full.
pub struct RejectingDispatcher;

impl Dispatch for RejectingDispatcher {
    fn submit(&self, _job: Job) -> Result<()> {
        Err(TileError::QueueFull)
    }

    fn cancel_outstanding(&self) -> usize {
        0
    }

    fn queued(&self) -> usize {
        0
    }

    fn workers(&self) -> usize {
        0
    }
}
