use crate::cache::{DiskCache, DiskWorker, InFlight, Listener, MemoryCache, Registration};
use crate::config::Config;
use crate::dispatcher::{Dispatch, DispatcherConfig, JobDispatcher, JobTicket};
use crate::error::{Result, TileError};
use crate::loader::TileLoader;
use crate::source::TileSource;
use crate::types::{Tile, TileKey, TileState};
use crate::upstream::HttpFetcher;
use parking_lot::RwLock;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Listener notified of every completed load, whoever asked for it.
pub type GlobalListener = Arc<dyn Fn(&Tile, bool) + Send + Sync>;

struct Inner {
    loader: TileLoader,
    memory: MemoryCache,
    in_flight: InFlight,
    listeners: RwLock<Vec<GlobalListener>>,
}

/// Non-blocking tile lookup for a viewer that asks again on every repaint.
#[derive(Clone)]
pub struct TileController {
    inner: Arc<Inner>,
}

impl TileController {
    pub fn new(loader: TileLoader, memory: MemoryCache) -> Self {
        Self {
            inner: Arc::new(Inner {
                loader,
                memory,
                in_flight: InFlight::new(),
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    /// Wires up the full HTTP-backed stack for `source`.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn from_config(config: &Config, source: Arc<dyn TileSource>) -> Result<Self> {
        let disk = DiskCache::from_config(config, source.tile_type())?;
        let loader = TileLoader::new(
            source,
            Arc::new(HttpFetcher::new(config)?),
            Arc::new(JobDispatcher::new(DispatcherConfig::from(config))),
            DiskWorker::spawn(disk)?,
        )
        .with_fetch_timeout(config.upstream_timeout)
        .with_stale_fallback(config.serve_stale_on_error);

        Ok(Self::new(loader, MemoryCache::new(config.memory_cache_size)))
    }

    pub fn source(&self) -> &Arc<dyn TileSource> {
        self.inner.loader.source()
    }

    pub fn dispatcher(&self) -> &Arc<dyn Dispatch> {
        self.inner.loader.dispatcher()
    }

    pub fn memory_cache(&self) -> &MemoryCache {
        &self.inner.memory
    }

    /// Number of loads currently pending.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    /// Registers a listener for every completion. It runs on a background
    /// thread; marshalling back to a UI thread is up to the caller.
    pub fn add_listener(&self, listener: impl Fn(&Tile, bool) + Send + Sync + 'static) {
        self.inner.listeners.write().push(Arc::new(listener));
    }

    /// Returns the tile if it is in memory, otherwise schedules its load (at
    /// most once per tile) and returns `None` without blocking.
    ///
    /// Also `None` for zoom levels the source does not serve.
    pub fn get_tile(&self, x: u32, y: u32, zoom: u8) -> Option<Tile> {
        self.request(x, y, zoom, None).ok().flatten()
    }

    /// Like [`get_tile`](Self::get_tile), with a listener called when this
    /// request's load completes.
    ///
    /// When the tile is returned directly the listener may be dropped
    /// uncalled. It is also dropped on invalid coordinates and when the load
    /// is cancelled.
    pub fn get_tile_with(
        &self,
        x: u32,
        y: u32,
        zoom: u8,
        listener: impl FnOnce(&Tile, bool) + Send + Sync + 'static,
    ) -> Option<Tile> {
        self.request(x, y, zoom, Some(Box::new(listener)))
            .ok()
            .flatten()
    }

    /// Resolves once the tile is available.
    pub async fn fetch(&self, x: u32, y: u32, zoom: u8) -> Result<Tile> {
        let (tx, rx) = oneshot::channel();
        let listener: Listener = Box::new(move |tile: &Tile, success: bool| {
            let _ = tx.send((tile.clone(), success));
        });

        if let Some(tile) = self.request(x, y, zoom, Some(listener))? {
            return Ok(tile);
        }

        match rx.await {
            Ok((tile, true)) => Ok(tile),
            Ok((tile, false)) => Err(TileError::LoadFailed(tile.key().to_string())),
            Err(_) => Err(TileError::Cancelled),
        }
    }

    /// Where a tile currently stands, without scheduling anything.
    pub fn tile_state(&self, x: u32, y: u32, zoom: u8) -> TileState {
        let Ok(key) = self.key(x, y, zoom) else {
            return TileState::Empty;
        };
        if self.inner.memory.peek(&key).is_some() {
            TileState::Loaded
        } else if self.inner.in_flight.contains(&key) {
            TileState::Loading
        } else {
            TileState::Empty
        }
    }

    /// Drops every load that has not started yet.
    ///
    /// Fetches already on the wire finish; their tiles still reach the
    /// memory cache, but listeners registered before this call are not
    /// notified. Calling it again right away changes nothing.
    pub fn cancel_outstanding_jobs(&self) -> usize {
        let queued = self.inner.loader.cancel_outstanding();
        let forgotten = self.inner.in_flight.cancel_all();
        tracing::debug!(queued, forgotten, "Cancelled outstanding tile loads");
        forgotten
    }

    fn key(&self, x: u32, y: u32, zoom: u8) -> Result<TileKey> {
        let source = self.source();
        if zoom < source.min_zoom() || zoom > source.max_zoom() {
            return Err(TileError::InvalidCoordinates);
        }
        Ok(TileKey::new(source.name(), zoom, x, y))
    }

    fn request(
        &self,
        x: u32,
        y: u32,
        zoom: u8,
        listener: Option<Listener>,
    ) -> Result<Option<Tile>> {
        let key = self.key(x, y, zoom)?;

        if let Some(tile) = self.inner.memory.get(&key) {
            tracing::trace!(key = %key, "Memory cache hit");
            return Ok(Some(tile));
        }

        match self.inner.in_flight.register(key.clone(), listener) {
            Registration::Started(ticket) => Ok(self.start_load(key, ticket)),
            Registration::Joined => {
                tracing::trace!(key = %key, "Joined pending load");
                Ok(None)
            }
        }
    }

    /// Kicks off the load for a freshly registered key.
    ///
    /// A load that completed between the memory miss and the registration
    /// has already filled the memory cache; that tile is handed to the new
    /// entry's listeners instead of loading it again.
    fn start_load(&self, key: TileKey, ticket: JobTicket) -> Option<Tile> {
        if let Some(tile) = self.inner.memory.get(&key) {
            tracing::trace!(key = %key, "Loaded while registering");
            if let Some(listeners) = self.inner.in_flight.complete(&key, &ticket) {
                for listener in listeners {
                    listener(&tile, true);
                }
            }
            return Some(tile);
        }

        tracing::debug!(key = %key, "Loading tile");
        let controller = Arc::downgrade(&self.inner);
        let job_ticket = ticket.clone();
        self.inner.loader.load(key, ticket, move |tile, success| {
            loader_completion(&controller, &job_ticket, tile, success);
        });
        None
    }
}

/// Feeds a finished load back into the memory cache and out to listeners.
///
/// The tile enters the memory cache before the key leaves the in-flight
/// map, so a concurrent request sees one or the other and never starts a
/// second fetch.
fn loader_completion(inner: &Weak<Inner>, ticket: &JobTicket, tile: Tile, success: bool) {
    let Some(inner) = inner.upgrade() else {
        return;
    };

    // A stale fallback is served once but not cached, so the next request
    // tries the network again
    if success && !tile.is_stale() {
        inner.memory.put(tile.clone());
    }

    match inner.in_flight.complete(tile.key(), ticket) {
        Some(listeners) => {
            for listener in listeners {
                listener(&tile, success);
            }
        }
        None => tracing::debug!(key = %tile.key(), success, "Completion for cancelled load"),
    }

    let listeners: Vec<GlobalListener> = inner.listeners.read().clone();
    for listener in listeners {
        listener(&tile, success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::TemplateTileSource;
    use crate::test_support::{age_file, loaded_tile, png_bytes, Behavior, FakeFetcher};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    struct Harness {
        controller: TileController,
        fetcher: Arc<FakeFetcher>,
        disk: DiskCache,
        dir: TempDir,
    }

    fn harness(fetcher: Arc<FakeFetcher>, dispatcher: Arc<dyn Dispatch>) -> Harness {
        let dir = TempDir::new().unwrap();
        let disk = DiskCache::new(dir.path(), "png", Duration::from_secs(24 * 3600)).unwrap();
        let source = Arc::new(
            TemplateTileSource::new("mock", "http://tiles.test/{z}/{x}/{y}.png").with_zoom_range(1, 18),
        );
        let loader = TileLoader::new(
            source,
            fetcher.clone(),
            dispatcher,
            DiskWorker::spawn(disk.clone()).unwrap(),
        )
        .with_fetch_timeout(Duration::from_millis(200));
        Harness {
            controller: TileController::new(loader, MemoryCache::new(200)),
            fetcher,
            disk,
            dir,
        }
    }

    fn default_dispatcher() -> Arc<dyn Dispatch> {
        Arc::new(JobDispatcher::new(DispatcherConfig::default()))
    }

    fn completion_channel() -> (
        mpsc::UnboundedSender<(Tile, bool)>,
        mpsc::UnboundedReceiver<(Tile, bool)>,
    ) {
        mpsc::unbounded_channel()
    }

    fn forward(tx: &mpsc::UnboundedSender<(Tile, bool)>) -> impl FnOnce(&Tile, bool) + Send + Sync {
        let tx = tx.clone();
        move |tile: &Tile, success: bool| {
            let _ = tx.send((tile.clone(), success));
        }
    }

    #[tokio::test]
    async fn cache_fill_then_hit() {
        let h = harness(FakeFetcher::new(Behavior::Png), default_dispatcher());
        let (tx, mut rx) = completion_channel();

        assert!(h.controller.get_tile_with(12, 34, 3, forward(&tx)).is_none());
        let (tile, success) = rx.recv().await.unwrap();
        assert!(success);
        assert!(tile.is_loaded());

        let hit = h.controller.get_tile(12, 34, 3).unwrap();
        assert_eq!(hit, tile);
        assert!(h.dir.path().join("mock").join("3_12_34.png").is_file());
        assert_eq!(h.controller.tile_state(12, 34, 3), TileState::Loaded);
        assert_eq!(h.controller.in_flight(), 0);
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_fetch_once() {
        let (fetcher, gate) = FakeFetcher::gated(Behavior::Png);
        let h = harness(fetcher, default_dispatcher());
        let (tx, mut rx) = completion_channel();

        for _ in 0..10 {
            assert!(h.controller.get_tile_with(12, 34, 3, forward(&tx)).is_none());
        }
        assert_eq!(h.controller.tile_state(12, 34, 3), TileState::Loading);

        gate.add_permits(1);
        for _ in 0..10 {
            let (_, success) = rx.recv().await.unwrap();
            assert!(success);
        }
        assert_eq!(h.fetcher.request_count(), 1);
        assert_eq!(h.controller.in_flight(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_threads_fetch_once() {
        let (fetcher, gate) = FakeFetcher::gated(Behavior::Png);
        let h = harness(fetcher, default_dispatcher());
        let (tx, mut rx) = completion_channel();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let controller = h.controller.clone();
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        controller.get_tile_with(3, 5, 4, forward(&tx));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        gate.add_permits(1);
        for _ in 0..40 {
            assert!(rx.recv().await.unwrap().1);
        }
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn timeout_reports_failure_and_leaves_caches_alone() {
        let h = harness(FakeFetcher::new(Behavior::Hang), default_dispatcher());
        let (tx, mut rx) = completion_channel();

        h.controller.get_tile_with(12, 34, 3, forward(&tx));
        let (tile, success) = rx.recv().await.unwrap();

        assert!(!success);
        assert_eq!(tile.state(), TileState::Failed);
        assert_eq!(h.controller.in_flight(), 0);
        assert!(h.controller.memory_cache().is_empty());
        assert!(!h.disk.exists(tile.key()));
    }

    #[tokio::test]
    async fn failed_tile_is_retried_on_next_request() {
        let h = harness(FakeFetcher::new(Behavior::Status(502)), default_dispatcher());
        assert!(matches!(
            h.controller.fetch(1, 1, 2).await,
            Err(TileError::LoadFailed(_))
        ));

        h.fetcher.set_behavior(Behavior::Png);
        assert!(h.controller.fetch(1, 1, 2).await.unwrap().is_loaded());
        assert_eq!(h.fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn late_completion_after_cancel_is_harmless() {
        let (fetcher, gate) = FakeFetcher::gated(Behavior::Png);
        let h = harness(fetcher, default_dispatcher());
        let (tx, mut rx) = completion_channel();

        h.controller.get_tile_with(12, 34, 3, forward(&tx));
        // Wait until the fetch is on the wire
        while h.fetcher.request_count() == 0 {
            tokio::task::yield_now().await;
        }

        h.controller.cancel_outstanding_jobs();
        assert_eq!(h.controller.tile_state(12, 34, 3), TileState::Loading);

        // A new request joins the running fetch instead of starting another
        h.controller.get_tile_with(12, 34, 3, forward(&tx));
        gate.add_permits(1);

        let (tile, success) = rx.recv().await.unwrap();
        assert!(success);
        assert_eq!(tile.key(), &TileKey::new("mock", 3, 12, 34));
        assert_eq!(h.fetcher.request_count(), 1);
        assert_eq!(h.controller.in_flight(), 0);
        assert!(h.controller.get_tile(12, 34, 3).is_some());

        // The listener registered before cancelling was dropped
        drop(tx);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn cancel_drops_queued_loads() {
        let (fetcher, gate) = FakeFetcher::gated(Behavior::Png);
        let dispatcher = Arc::new(JobDispatcher::new(DispatcherConfig {
            max_workers: 1,
            queue_capacity: 100,
            idle_timeout: Duration::from_secs(30),
        }));
        let h = harness(fetcher, dispatcher.clone());

        let notified = Arc::new(AtomicUsize::new(0));
        let counter = notified.clone();
        h.controller.add_listener(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for x in 0..5 {
            h.controller.get_tile(x, 0, 4);
        }
        while h.fetcher.request_count() == 0 || dispatcher.queued() < 4 {
            tokio::task::yield_now().await;
        }

        assert_eq!(h.controller.cancel_outstanding_jobs(), 4);
        assert_eq!(h.controller.cancel_outstanding_jobs(), 0);
        assert_eq!(h.controller.in_flight(), 1);
        assert_eq!(dispatcher.queued(), 0);

        gate.add_permits(5);
        while notified.load(Ordering::SeqCst) < 1 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fetcher.request_count(), 1);
        assert_eq!(notified.load(Ordering::SeqCst), 1);
        assert_eq!(h.controller.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_twice_matches_cancel_once() {
        let (fetcher, _gate) = FakeFetcher::gated(Behavior::Png);
        let h = harness(fetcher, default_dispatcher());
        for x in 0..3 {
            h.controller.get_tile(x, 0, 2);
        }
        while h.fetcher.request_count() < 3 {
            tokio::task::yield_now().await;
        }

        h.controller.cancel_outstanding_jobs();
        let after_once = h.controller.in_flight();
        h.controller.cancel_outstanding_jobs();
        assert_eq!(h.controller.in_flight(), after_once);
        assert_eq!(after_once, 3);
    }

    #[tokio::test]
    async fn disk_hit_populates_memory() {
        let h = harness(FakeFetcher::new(Behavior::Status(500)), default_dispatcher());
        h.disk
            .put(&TileKey::new("mock", 3, 12, 34), &png_bytes(), None)
            .unwrap();

        let tile = h.controller.fetch(12, 34, 3).await.unwrap();
        assert_eq!(tile.image().unwrap().data, png_bytes());
        assert!(h.controller.get_tile(12, 34, 3).is_some());
        assert_eq!(h.fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn stale_disk_record_triggers_fetch() {
        let h = harness(FakeFetcher::new(Behavior::Png), default_dispatcher());
        let key = TileKey::new("mock", 3, 12, 34);
        h.disk.put(&key, &png_bytes(), None).unwrap();
        age_file(&h.disk.tile_path(&key), Duration::from_secs(25 * 3600));

        let tile = h.controller.fetch(12, 34, 3).await.unwrap();
        assert!(!tile.is_stale());
        assert_eq!(h.fetcher.request_count(), 1);
    }

    #[tokio::test]
    async fn stale_fallback_is_not_cached() {
        let h = harness(FakeFetcher::new(Behavior::Status(500)), default_dispatcher());
        let key = TileKey::new("mock", 3, 12, 34);
        h.disk.put(&key, &png_bytes(), None).unwrap();
        age_file(&h.disk.tile_path(&key), Duration::from_secs(25 * 3600));

        let tile = h.controller.fetch(12, 34, 3).await.unwrap();
        assert!(tile.is_stale());
        assert!(h.controller.memory_cache().is_empty());
        assert_eq!(h.fetcher.request_count(), 1);

        // Upstream is back: the next repaint goes to the network again
        h.fetcher.set_behavior(Behavior::Png);
        let (tx, mut rx) = completion_channel();
        assert!(h.controller.get_tile_with(12, 34, 3, forward(&tx)).is_none());
        let (fresh, success) = rx.recv().await.unwrap();
        assert!(success);
        assert!(!fresh.is_stale());
        assert_eq!(h.fetcher.request_count(), 2);

        let hit = h.controller.get_tile(12, 34, 3).unwrap();
        assert!(!hit.is_stale());
        assert_eq!(h.fetcher.request_count(), 2);
    }

    #[tokio::test]
    async fn tile_cached_during_registration_is_not_reloaded() {
        let h = harness(FakeFetcher::new(Behavior::Png), default_dispatcher());
        let key = TileKey::new("mock", 3, 12, 34);
        let (tx, mut rx) = completion_channel();

        // Memory missed, then a completion lands before the load is started
        let Registration::Started(ticket) = h
            .controller
            .inner
            .in_flight
            .register(key.clone(), Some(Box::new(forward(&tx))))
        else {
            panic!("expected to start");
        };
        h.controller.memory_cache().put(loaded_tile(key.clone()));

        let tile = h.controller.start_load(key.clone(), ticket).unwrap();
        assert_eq!(tile.key(), &key);
        let (notified, success) = rx.recv().await.unwrap();
        assert!(success);
        assert_eq!(notified, tile);

        assert_eq!(h.controller.in_flight(), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn invalid_coordinates_schedule_nothing() {
        let h = harness(FakeFetcher::new(Behavior::Png), default_dispatcher());

        assert!(h.controller.get_tile(0, 0, 0).is_none());
        assert!(h.controller.get_tile(0, 0, 19).is_none());
        assert_eq!(h.controller.in_flight(), 0);
        assert!(matches!(
            h.controller.fetch(0, 0, 19).await,
            Err(TileError::InvalidCoordinates)
        ));
        assert_eq!(h.controller.tile_state(0, 0, 0), TileState::Empty);
        assert_eq!(h.fetcher.request_count(), 0);
    }

    #[tokio::test]
    async fn global_listeners_see_every_completion() {
        let h = harness(FakeFetcher::new(Behavior::Png), default_dispatcher());
        let (tx, mut rx) = completion_channel();
        h.controller.add_listener(move |tile, success| {
            let _ = tx.send((tile.clone(), success));
        });

        for x in 0..3 {
            h.controller.get_tile(x, 1, 2);
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (tile, success) = rx.recv().await.unwrap();
            assert!(success);
            seen.push(tile.key().x);
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
