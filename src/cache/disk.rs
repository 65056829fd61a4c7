use crate::config::Config;
use crate::error::Result;
use crate::types::{Tile, TileImage, TileKey};
use bytes::Bytes;
use memmap2::Mmap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, oneshot};

pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Outcome of reading one tile's record from disk.
#[derive(Debug)]
pub enum DiskLookup {
    Fresh(TileImage),
    /// Decodable but older than the max age. Kept for revalidation and as a
    /// fallback when the network is unavailable.
    Stale {
        image: TileImage,
        etag: Option<String>,
    },
    Missing,
}

/// Persistent tile cache, one file per tile under
/// `<root>/<source>/<zoom>_<x>_<y>.<tile_type>`.
///
/// Freshness comes from the file's modification time alone.
#[derive(Clone, Debug)]
pub struct DiskCache {
    base_dir: PathBuf,
    tile_type: String,
    max_age: Duration,
}

impl DiskCache {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        tile_type: impl Into<String>,
        max_age: Duration,
    ) -> Result<Self> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir)?;
        Ok(Self {
            base_dir,
            tile_type: tile_type.into(),
            max_age,
        })
    }

    pub fn from_config(config: &Config, tile_type: &str) -> Result<Self> {
        Self::new(config.cache_dir.clone(), tile_type, config.disk_max_age)
    }

    pub fn tile_path(&self, key: &TileKey) -> PathBuf {
        self.base_dir
            .join(&*key.source)
            .join(key.file_name(&self.tile_type))
    }

    fn etag_path(&self, key: &TileKey) -> PathBuf {
        self.base_dir.join(&*key.source).join(key.file_name("etag"))
    }

    /// Returns the tile if its record exists, is fresh and decodes.
    pub fn get(&self, key: &TileKey) -> Option<Tile> {
        match self.lookup(key) {
            DiskLookup::Fresh(image) => Some(Tile::loaded(key.clone(), Arc::new(image))),
            _ => None,
        }
    }

    /// Reads and classifies the record for `key`.
    pub fn lookup(&self, key: &TileKey) -> DiskLookup {
        let path = self.tile_path(key);
        let Ok(file) = File::open(&path) else {
            tracing::trace!(key = %key, "No disk record");
            return DiskLookup::Missing;
        };

        let fresh = match file.metadata().and_then(|m| m.modified()) {
            Ok(modified) => self.is_fresh(modified),
            Err(_) => false,
        };

        // Use mmap for the read, the decoder copies out of it anyway
        let data = match unsafe { Mmap::map(&file) } {
            Ok(mmap) => Bytes::copy_from_slice(&mmap),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Failed to map disk record");
                return DiskLookup::Missing;
            }
        };

        let image = match TileImage::decode(data) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Corrupt disk record, ignoring");
                return DiskLookup::Missing;
            }
        };

        if fresh {
            tracing::trace!(key = %key, "Fresh disk record");
            DiskLookup::Fresh(image)
        } else {
            tracing::debug!(key = %key, "Disk record too old");
            DiskLookup::Stale {
                image,
                etag: self.get_etag(key),
            }
        }
    }

    fn is_fresh(&self, modified: SystemTime) -> bool {
        match SystemTime::now().duration_since(modified) {
            Ok(age) => age < self.max_age,
            // Modified in the future, clock skew
            Err(_) => true,
        }
    }

    /// Store tile to disk, replacing any previous record.
    pub fn put(&self, key: &TileKey, data: &Bytes, etag: Option<&str>) -> Result<()> {
        let path = self.tile_path(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Write tile data atomically
        let tmp_path = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;

        let etag_path = self.etag_path(key);
        match etag {
            Some(etag) => fs::write(etag_path, etag)?,
            None => match fs::remove_file(etag_path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                _ => {}
            },
        }

        Ok(())
    }

    /// Marks an existing record as freshly validated.
    pub fn touch(&self, key: &TileKey) -> Result<()> {
        let file = File::options().write(true).open(self.tile_path(key))?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    /// Get stored etag for conditional requests
    pub fn get_etag(&self, key: &TileKey) -> Option<String> {
        fs::read_to_string(self.etag_path(key)).ok()
    }

    /// Check if tile exists on disk, regardless of age
    pub fn exists(&self, key: &TileKey) -> bool {
        self.tile_path(key).exists()
    }
}

enum DiskRequest {
    Lookup {
        key: TileKey,
        reply: oneshot::Sender<DiskLookup>,
    },
    Store {
        key: TileKey,
        data: Bytes,
        etag: Option<String>,
        reply: oneshot::Sender<()>,
    },
    Touch {
        key: TileKey,
    },
}

/// Handle to the thread that owns all disk access.
///
/// Reads and writes are executed one at a time in submission order, so disk
/// work never competes with network workers and two writers never race on
/// the same path. Write failures are logged here and never reach the caller.
#[derive(Clone)]
pub struct DiskWorker {
    tx: mpsc::UnboundedSender<DiskRequest>,
}

impl DiskWorker {
    /// Starts the disk thread. It exits once every handle is dropped.
    pub fn spawn(cache: DiskCache) -> io::Result<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<DiskRequest>();

        thread::Builder::new()
            .name("tile-disk-io".to_string())
            .spawn(move || {
                while let Some(request) = rx.blocking_recv() {
                    match request {
                        DiskRequest::Lookup { key, reply } => {
                            let _ = reply.send(cache.lookup(&key));
                        }
                        DiskRequest::Store {
                            key,
                            data,
                            etag,
                            reply,
                        } => {
                            match cache.put(&key, &data, etag.as_deref()) {
                                Ok(()) => tracing::debug!(key = %key, size = data.len(), "Stored tile on disk"),
                                Err(e) => tracing::warn!(key = %key, error = %e, "Failed to store to disk cache"),
                            }
                            let _ = reply.send(());
                        }
                        DiskRequest::Touch { key } => {
                            if let Err(e) = cache.touch(&key) {
                                tracing::warn!(key = %key, error = %e, "Failed to refresh disk record");
                            }
                        }
                    }
                }
                tracing::debug!("Disk worker stopped");
            })?;

        Ok(Self { tx })
    }

    pub async fn lookup(&self, key: TileKey) -> DiskLookup {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(DiskRequest::Lookup { key, reply }).is_err() {
            return DiskLookup::Missing;
        }
        rx.await.unwrap_or(DiskLookup::Missing)
    }

    /// Writes a tile through to disk and waits until the write was attempted.
    pub async fn store(&self, key: TileKey, data: Bytes, etag: Option<String>) {
        let (reply, rx) = oneshot::channel();
        let request = DiskRequest::Store {
            key,
            data,
            etag,
            reply,
        };
        if self.tx.send(request).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn touch(&self, key: TileKey) {
        let _ = self.tx.send(DiskRequest::Touch { key });
    }
}
