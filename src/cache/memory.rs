//! LRU-backed in-memory cache.

use super::watch::{CacheEvent, WatchHandle, WatchManager};
use super::{CacheEntry, EntryStatus, QueryCache};
use crate::error::BridgeError;
use crate::types::{CacheKey, Snapshot};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Deserialize;
use std::num::NonZeroUsize;

/// Memory cache configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MemoryCacheConfig {
    /// Maximum number of entries before the least recently used one is
    /// evicted (None = unbounded).
    pub max_entries: Option<usize>,

    /// Max buffered events per watcher before it is dropped.
    /// Default: 256
    pub watch_buffer_size: usize,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: None,
            watch_buffer_size: 256,
        }
    }
}

/// In-memory [`QueryCache`].
pub struct MemoryCache {
    entries: Mutex<LruCache<CacheKey, CacheEntry>>,
    watchers: WatchManager,
}

impl MemoryCache {
    pub fn new(config: MemoryCacheConfig) -> Self {
        let entries = match config.max_entries.and_then(NonZeroUsize::new) {
            Some(cap) => LruCache::new(cap),
            None => LruCache::unbounded(),
        };
        Self {
            entries: Mutex::new(entries),
            watchers: WatchManager::new(config.watch_buffer_size),
        }
    }

    /// Watch one key, or every key when `key` is `None`.
    pub fn watch(&self, key: Option<CacheKey>) -> WatchHandle {
        self.watchers.watch(key)
    }

    pub fn watchers(&self) -> &WatchManager {
        &self.watchers
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// Remove every entry.
    pub fn clear(&self) {
        let removed: Vec<CacheKey> = {
            let mut entries = self.entries.lock();
            let keys = entries.iter().map(|(k, _)| k.clone()).collect();
            entries.clear();
            keys
        };
        for key in removed {
            self.watchers.broadcast(CacheEvent::Removed { key });
        }
    }

    /// Apply `update` to the entry for `key`, inserting a loading entry
    /// first if needed. Returns the key evicted to make room, if any.
    fn upsert(&self, key: &CacheKey, update: impl FnOnce(&mut CacheEntry)) -> Option<CacheKey> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            update(entry);
            return None;
        }
        let mut entry = CacheEntry::loading(key.clone());
        update(&mut entry);
        entries.push(key.clone(), entry).map(|(evicted, _)| evicted)
    }

    fn notify_evicted(&self, evicted: Option<CacheKey>) {
        if let Some(key) = evicted {
            self.watchers.broadcast(CacheEvent::Removed { key });
        }
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new(MemoryCacheConfig::default())
    }
}

impl QueryCache for MemoryCache {
    fn ensure(&self, key: &CacheKey) -> EntryStatus {
        let (status, evicted, created) = {
            let mut entries = self.entries.lock();
            match entries.get(key).map(|e| e.status) {
                Some(status) => (status, None, false),
                None => {
                    let evicted = entries
                        .push(key.clone(), CacheEntry::loading(key.clone()))
                        .map(|(k, _)| k);
                    (EntryStatus::Loading, evicted, true)
                }
            }
        };
        self.notify_evicted(evicted);
        if created {
            self.watchers
                .broadcast(CacheEvent::Loading { key: key.clone() });
        }
        status
    }

    fn resolve(&self, key: &CacheKey, value: Snapshot) {
        let event = CacheEvent::Resolved {
            key: key.clone(),
            value: value.clone(),
        };
        let evicted = self.upsert(key, |entry| entry.apply_resolve(value));
        self.notify_evicted(evicted);
        self.watchers.broadcast(event);
    }

    fn reject(&self, key: &CacheKey, error: BridgeError) {
        let event = CacheEvent::Rejected {
            key: key.clone(),
            error: error.clone(),
        };
        let evicted = self.upsert(key, |entry| entry.apply_reject(error));
        self.notify_evicted(evicted);
        self.watchers.broadcast(event);
    }

    fn status(&self, key: &CacheKey) -> Option<EntryStatus> {
        self.entries.lock().peek(key).map(|e| e.status)
    }

    fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.lock().get(key).cloned()
    }

    fn remove(&self, key: &CacheKey) -> Option<CacheEntry> {
        let removed = self.entries.lock().pop(key);
        if removed.is_some() {
            self.watchers
                .broadcast(CacheEvent::Removed { key: key.clone() });
        }
        removed
    }
}
