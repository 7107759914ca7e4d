//! # Tether
//!
//! Binds backend data sources to a client-side query cache.
//!
//! ## Core Concepts
//!
//! - **Descriptors**: what to read (a query, a document, a named query from a
//!   loaded bundle, or the user's ID token)
//! - **Cache keys**: caller-chosen identities for cache entries; the bridge
//!   never derives them from descriptors
//! - **Bindings**: a consumer's claim on a key; one-shot reads settle once,
//!   subscriptions keep the entry current until the last binding goes away
//! - **Listeners**: at most one per key, released deterministically
//!
//! ## Example
//!
//! ```ignore
//! use tether::{Bridge, CacheKey, FetchOptions, MemoryBackend, MemoryCache, Query, SourceDescriptor};
//! use serde_json::json;
//!
//! let backend = Arc::new(MemoryBackend::new());
//! let cache = Arc::new(MemoryCache::default());
//! let bridge = Bridge::new(backend, cache);
//!
//! let binding = bridge
//!     .bind(
//!         CacheKey::new(json!(["products", {"limitTo": 10}])),
//!         SourceDescriptor::LiveQuery(Query::collection("products").limit(10)),
//!         FetchOptions::subscribe(),
//!     )
//!     .await;
//!
//! println!("{:?}", binding.view().status);
//! // Dropping the binding releases the listener.
//! ```

pub mod backend;
pub mod bridge;
pub mod cache;
pub mod error;
pub mod listener;
pub mod named;
pub mod types;

// Re-exports
pub use backend::{Backend, ListenerRegistration, MemoryBackend, SnapshotSink};
pub use bridge::{Binding, Bridge, BridgeConfig};
pub use cache::{
    CacheEntry, CacheEvent, DropReason, EntryStatus, EntryView, MemoryCache, MemoryCacheConfig,
    QueryCache, WatchHandle, WatchId, WatchManager,
};
pub use error::{BackendError, BackendErrorCode, BackendResult, BridgeError, Result};
pub use listener::{Acquired, ListenerGuard, ListenerTable, ObserverTicket, SinkGate};
pub use named::NamedQueryCache;
pub use types::*;
