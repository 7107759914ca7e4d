//! The external cache the bridge feeds.
//!
//! The bridge never owns entries. It pushes three kinds of events through
//! [`QueryCache`]: "make sure a loading entry exists", "resolve" and
//! "reject". Everything else (eviction, garbage collection, observers)
//! belongs to the cache implementation.
//!
//! [`MemoryCache`] is the bundled implementation: an LRU map of entries with
//! per-key change notification.
//!
//! # Example
//!
//! ```ignore
//! let cache = MemoryCache::new(MemoryCacheConfig::default());
//! let watch = cache.watch(Some(CacheKey::from("profile")));
//!
//! loop {
//!     match watch.recv() {
//!         Ok(CacheEvent::Resolved { value, .. }) => render(value),
//!         Ok(CacheEvent::Rejected { error, .. }) => show_error(error),
//!         Ok(CacheEvent::Dropped { .. }) | Err(_) => break,
//!         Ok(_) => {}
//!     }
//! }
//! ```

mod memory;
mod watch;

pub use memory::{MemoryCache, MemoryCacheConfig};
pub use watch::{CacheEvent, DropReason, WatchHandle, WatchId, WatchManager};

use crate::error::BridgeError;
use crate::types::{CacheKey, Snapshot, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lifecycle state of a cache entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Loading,
    Success,
    Error,
}

impl EntryStatus {
    /// Success or error.
    pub fn is_settled(&self) -> bool {
        !matches!(self, EntryStatus::Loading)
    }
}

/// One cached value and its status.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub status: EntryStatus,
    /// Last resolved value. Kept across a later rejection.
    pub value: Option<Snapshot>,
    /// Last rejection. Cleared by the next resolution.
    pub error: Option<BridgeError>,
    /// Time of the last resolution.
    pub updated_at: Option<Timestamp>,
    /// Time of the last rejection.
    pub error_updated_at: Option<Timestamp>,
    pub resolve_count: u64,
    pub reject_count: u64,
}

impl CacheEntry {
    pub fn loading(key: CacheKey) -> Self {
        Self {
            key,
            status: EntryStatus::Loading,
            value: None,
            error: None,
            updated_at: None,
            error_updated_at: None,
            resolve_count: 0,
            reject_count: 0,
        }
    }

    pub fn apply_resolve(&mut self, value: Snapshot) {
        self.status = EntryStatus::Success;
        self.value = Some(value);
        self.error = None;
        self.updated_at = Some(Timestamp::now());
        self.resolve_count += 1;
    }

    pub fn apply_reject(&mut self, error: BridgeError) {
        self.status = EntryStatus::Error;
        self.error = Some(error);
        self.error_updated_at = Some(Timestamp::now());
        self.reject_count += 1;
    }

    pub fn view(&self) -> EntryView {
        EntryView {
            status: self.status,
            value: self.value.clone(),
            error: self.error.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// What a consumer sees: current value, status and error.
#[derive(Clone, Debug, PartialEq)]
pub struct EntryView {
    pub status: EntryStatus,
    pub value: Option<Snapshot>,
    pub error: Option<BridgeError>,
    pub updated_at: Option<Timestamp>,
}

impl EntryView {
    /// View of an entry that does not exist yet.
    pub fn loading() -> Self {
        Self {
            status: EntryStatus::Loading,
            value: None,
            error: None,
            updated_at: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == EntryStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == EntryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == EntryStatus::Error
    }

    /// Data-only projection of the value. See [`Snapshot::to_data`].
    pub fn data(&self, id_field: Option<&str>) -> Option<Value> {
        self.value.as_ref().map(|v| v.to_data(id_field))
    }
}

/// Cache operations the bridge depends on.
pub trait QueryCache: Send + Sync {
    /// Create a loading entry for `key` if there is none. Returns the status
    /// of the entry after the call.
    fn ensure(&self, key: &CacheKey) -> EntryStatus;

    /// Store a value, creating the entry if needed.
    fn resolve(&self, key: &CacheKey, value: Snapshot);

    /// Store an error, creating the entry if needed.
    fn reject(&self, key: &CacheKey, error: BridgeError);

    fn status(&self, key: &CacheKey) -> Option<EntryStatus>;

    fn entry(&self, key: &CacheKey) -> Option<CacheEntry>;

    fn remove(&self, key: &CacheKey) -> Option<CacheEntry>;
}
