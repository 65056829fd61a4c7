use crate::types::{Tile, TileKey};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;

pub const DEFAULT_CAPACITY: usize = 200;

/// Bounded in-process cache of decoded tiles with least-recently-used
/// eviction.
///
/// Every operation runs under one lock and never performs I/O, so the UI
/// thread and loader completions can share it without blocking each other
/// for more than a map update.
pub struct MemoryCache {
    cache: Mutex<LruCache<TileKey, Tile>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Looks up a tile and marks it most recently used.
    pub fn get(&self, key: &TileKey) -> Option<Tile> {
        self.cache.lock().get(key).cloned()
    }

    /// Looks up a tile without touching the recency order.
    pub fn peek(&self, key: &TileKey) -> Option<Tile> {
        self.cache.lock().peek(key).cloned()
    }

    /// Inserts a tile as most recently used.
    ///
    /// Returns the entry evicted to stay within capacity, if any. Replacing
    /// a tile under the same key is not an eviction.
    pub fn put(&self, tile: Tile) -> Option<Tile> {
        let key = tile.key().clone();
        let mut cache = self.cache.lock();
        match cache.push(key.clone(), tile) {
            Some((old_key, evicted)) if old_key != key => {
                tracing::trace!(key = %old_key, "Evicted tile from memory cache");
                Some(evicted)
            }
            _ => None,
        }
    }

    /// Drops the least recently used entry.
    pub fn evict_lru(&self) -> Option<Tile> {
        self.cache.lock().pop_lru().map(|(_, tile)| tile)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }

    pub fn clear(&self) {
        self.cache.lock().clear();
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
