use crate::cache::{DiskLookup, DiskWorker};
use crate::dispatcher::{Dispatch, Job, JobTicket};
use crate::error::TileError;
use crate::source::TileSource;
use crate::types::{Tile, TileImage, TileKey};
use crate::upstream::{FetchResult, TileFetcher};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

type CompletionFn = Box<dyn FnOnce(Tile, bool) + Send>;

/// Delivers a load's outcome at most once, whichever path gets there first.
#[derive(Clone)]
struct Completion(Arc<Mutex<Option<CompletionFn>>>);

impl Completion {
    fn new(f: impl FnOnce(Tile, bool) + Send + 'static) -> Self {
        Self(Arc::new(Mutex::new(Some(Box::new(f)))))
    }

    fn finish(&self, tile: Tile, success: bool) {
        let f = self.0.lock().take();
        if let Some(f) = f {
            f(tile, success);
        }
    }
}

/// Turns a tile key into a loaded tile: disk first, network second.
///
/// Keeps no per-key state; de-duplication belongs to the controller.
#[derive(Clone)]
pub struct TileLoader {
    source: Arc<dyn TileSource>,
    fetcher: Arc<dyn TileFetcher>,
    dispatcher: Arc<dyn Dispatch>,
    disk: DiskWorker,
    fetch_timeout: Duration,
    serve_stale_on_error: bool,
    runtime: Handle,
}

impl TileLoader {
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn new(
        source: Arc<dyn TileSource>,
        fetcher: Arc<dyn TileFetcher>,
        dispatcher: Arc<dyn Dispatch>,
        disk: DiskWorker,
    ) -> Self {
        Self {
            source,
            fetcher,
            dispatcher,
            disk,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            serve_stale_on_error: true,
            runtime: Handle::current(),
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_stale_fallback(mut self, enabled: bool) -> Self {
        self.serve_stale_on_error = enabled;
        self
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        &self.source
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatch> {
        &self.dispatcher
    }

    /// Starts loading `key` in the background and returns immediately.
    ///
    /// `on_complete` runs exactly once, off the caller's thread, unless the
    /// load is cancelled through `ticket` before it starts.
    pub fn load(
        &self,
        key: TileKey,
        ticket: JobTicket,
        on_complete: impl FnOnce(Tile, bool) + Send + 'static,
    ) {
        let loader = self.clone();
        let done = Completion::new(on_complete);
        self.runtime.spawn(async move {
            loader.load_from_disk(key, ticket, done).await;
        });
    }

    /// Discards queued network jobs. Running fetches are not interrupted.
    pub fn cancel_outstanding(&self) -> usize {
        self.dispatcher.cancel_outstanding()
    }

    async fn load_from_disk(self, key: TileKey, ticket: JobTicket, done: Completion) {
        if ticket.is_cancelled() {
            return;
        }

        match self.disk.lookup(key.clone()).await {
            DiskLookup::Fresh(image) => {
                if ticket.start() {
                    tracing::trace!(key = %key, "Disk cache hit");
                    done.finish(Tile::loaded(key, Arc::new(image)), true);
                }
            }
            DiskLookup::Stale { image, etag } => self.dispatch(key, ticket, Some((image, etag)), done),
            DiskLookup::Missing => self.dispatch(key, ticket, None, done),
        }
    }

    fn dispatch(
        &self,
        key: TileKey,
        ticket: JobTicket,
        stale: Option<(TileImage, Option<String>)>,
        done: Completion,
    ) {
        let loader = self.clone();
        let job_key = key.clone();
        let job_done = done.clone();
        let job = Job::new(ticket, async move {
            loader.fetch_from_network(job_key, stale, job_done).await;
        });

        if let Err(e) = self.dispatcher.submit(job) {
            tracing::warn!(key = %key, error = %e, "Could not schedule tile download");
            done.finish(Tile::failed(key), false);
        }
    }

    async fn fetch_from_network(
        self,
        key: TileKey,
        stale: Option<(TileImage, Option<String>)>,
        done: Completion,
    ) {
        let url = self.source.tile_url(key.zoom, key.x, key.y);
        let (stale_image, etag) = match stale {
            Some((image, etag)) => (Some(image), etag),
            None => (None, None),
        };
        tracing::debug!(key = %key, url = %url, revalidate = etag.is_some(), "Attempting to download tile");

        let fetched = match tokio::time::timeout(
            self.fetch_timeout,
            self.fetcher.fetch(&url, etag.as_deref()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TileError::Timeout),
        };

        match fetched {
            Ok(FetchResult::Data { data, etag }) => match TileImage::decode(data.clone()) {
                Ok(image) => {
                    self.disk.store(key.clone(), data, etag).await;
                    done.finish(Tile::loaded(key, Arc::new(image)), true);
                }
                Err(e) => self.fail(key, stale_image, e, done),
            },
            Ok(FetchResult::NotModified) => match stale_image {
                Some(image) => {
                    tracing::debug!(key = %key, "Disk record still valid");
                    self.disk.touch(key.clone());
                    done.finish(Tile::loaded(key, Arc::new(image)), true);
                }
                None => self.fail(key, None, TileError::NotFound, done),
            },
            Err(e) => self.fail(key, stale_image, e, done),
        }
    }

    fn fail(&self, key: TileKey, stale: Option<TileImage>, error: TileError, done: Completion) {
        match stale {
            Some(image) if self.serve_stale_on_error => {
                tracing::warn!(key = %key, error = %error, "Download failed, serving stale tile");
                done.finish(Tile::loaded(key, Arc::new(image)).into_stale(), true);
            }
            _ => {
                tracing::warn!(key = %key, error = %error, kind = ?error.kind(), "Failed loading tile");
                done.finish(Tile::failed(key), false);
            }
        }
    }
}
