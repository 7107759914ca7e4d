//! Change notification for cache entries.

use crate::error::BridgeError;
use crate::types::{CacheKey, Snapshot};
use crossbeam_channel::{bounded, Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Events emitted to cache watchers.
#[derive(Clone, Debug, PartialEq)]
pub enum CacheEvent {
    /// A loading entry was created.
    Loading { key: CacheKey },

    /// An entry received a value.
    Resolved { key: CacheKey, value: Snapshot },

    /// An entry received an error.
    Rejected { key: CacheKey, error: BridgeError },

    /// An entry was removed or evicted.
    Removed { key: CacheKey },

    /// The watcher was dropped and will receive nothing further.
    Dropped { reason: DropReason },
}

impl CacheEvent {
    pub fn key(&self) -> Option<&CacheKey> {
        match self {
            CacheEvent::Loading { key }
            | CacheEvent::Resolved { key, .. }
            | CacheEvent::Rejected { key, .. }
            | CacheEvent::Removed { key } => Some(key),
            CacheEvent::Dropped { .. } => None,
        }
    }
}

/// Why a watcher was dropped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unwatched.
    Unwatched,
}

/// Unique identifier for a watcher.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct WatchId(pub u64);

struct Watcher {
    /// `None` watches every key.
    key: Option<CacheKey>,
    sender: Sender<CacheEvent>,
}

impl Watcher {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: CacheEvent) -> bool {
        self.sender.try_send(event).is_ok()
    }

    fn matches(&self, key: &CacheKey) -> bool {
        self.key.as_ref().map_or(true, |k| k == key)
    }
}

/// Fans cache events out to watchers.
pub struct WatchManager {
    watchers: RwLock<HashMap<WatchId, Watcher>>,
    next_id: AtomicU64,
    buffer_size: usize,
}

impl WatchManager {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            watchers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Watch one key, or every key when `key` is `None`.
    pub fn watch(&self, key: Option<CacheKey>) -> WatchHandle {
        let id = WatchId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(self.buffer_size);
        self.watchers.write().insert(id, Watcher { key, sender });
        WatchHandle { id, receiver }
    }

    pub fn unwatch(&self, id: WatchId) {
        if let Some(watcher) = self.watchers.write().remove(&id) {
            let _ = watcher.sender.try_send(CacheEvent::Dropped {
                reason: DropReason::Unwatched,
            });
        }
    }

    pub fn watch_count(&self) -> usize {
        self.watchers.read().len()
    }

    /// Send `event` to every matching watcher. Drops watchers that cannot
    /// keep up or whose handle is gone.
    pub fn broadcast(&self, event: CacheEvent) {
        let Some(key) = event.key() else {
            return;
        };

        let mut to_remove = Vec::new();
        {
            let watchers = self.watchers.read();
            for (id, watcher) in watchers.iter() {
                if watcher.matches(key) && !watcher.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        if !to_remove.is_empty() {
            let mut watchers = self.watchers.write();
            for id in to_remove {
                if let Some(watcher) = watchers.remove(&id) {
                    warn!(watch = id.0, "dropping cache watcher");
                    let _ = watcher.sender.try_send(CacheEvent::Dropped {
                        reason: DropReason::BufferOverflow,
                    });
                }
            }
        }
    }
}

/// Receiving side of a watcher.
pub struct WatchHandle {
    pub id: WatchId,
    pub receiver: Receiver<CacheEvent>,
}

impl WatchHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<CacheEvent, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<CacheEvent, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<CacheEvent, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything currently buffered.
    pub fn drain(&self) -> Vec<CacheEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watch_unwatch() {
        let manager = WatchManager::new(16);
        let handle = manager.watch(None);
        assert_eq!(manager.watch_count(), 1);

        manager.unwatch(handle.id);
        assert_eq!(manager.watch_count(), 0);
        assert_eq!(
            handle.try_recv().unwrap(),
            CacheEvent::Dropped {
                reason: DropReason::Unwatched
            }
        );
    }

    #[test]
    fn test_broadcast_filters_by_key() {
        let manager = WatchManager::new(16);
        let products = manager.watch(Some(CacheKey::from("products")));
        let everything = manager.watch(None);

        manager.broadcast(CacheEvent::Loading {
            key: CacheKey::from("orders"),
        });
        manager.broadcast(CacheEvent::Loading {
            key: CacheKey::from("products"),
        });

        assert_eq!(products.drain().len(), 1);
        assert_eq!(everything.drain().len(), 2);
    }

    #[test]
    fn test_drop_slow_watcher() {
        let manager = WatchManager::new(2);
        let _handle = manager.watch(None);

        for _ in 0..10 {
            manager.broadcast(CacheEvent::Removed {
                key: CacheKey::from("k"),
            });
        }

        assert_eq!(manager.watch_count(), 0);
    }

    #[test]
    fn test_disconnected_watcher_is_removed() {
        let manager = WatchManager::new(4);
        let handle = manager.watch(None);
        drop(handle);

        manager.broadcast(CacheEvent::Removed {
            key: CacheKey::from("k"),
        });
        assert_eq!(manager.watch_count(), 0);
    }
}
