//! The subscription bridge: binds a cache key to a backend source.

use crate::backend::{Backend, SnapshotSink};
use crate::cache::{CacheEntry, EntryStatus, EntryView, QueryCache};
use crate::error::{BridgeError, Result};
use crate::listener::{Acquired, ListenerGuard, ListenerTable, ObserverTicket, SinkGate};
use crate::named::NamedQueryCache;
use crate::types::{CacheKey, FetchOptions, Snapshot, SourceDescriptor};
use parking_lot::Mutex;
use serde::Deserialize;
use std::borrow::Cow;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Bridge configuration.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Options used by [`Bridge::bind_default`].
    pub default_options: FetchOptions,
}

struct Shared {
    backend: Arc<dyn Backend>,
    cache: Arc<dyn QueryCache>,
    named: Arc<NamedQueryCache>,
    listeners: Arc<ListenerTable>,
    /// Keys with a one-shot read in progress.
    inflight: Mutex<HashSet<CacheKey>>,
    config: BridgeConfig,
}

/// Feeds backend reads and listener emissions into a [`QueryCache`].
///
/// Cloning is cheap; clones share the listener table and in-flight set.
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl Bridge {
    pub fn new(backend: Arc<dyn Backend>, cache: Arc<dyn QueryCache>) -> Self {
        Self::with_config(backend, cache, BridgeConfig::default())
    }

    pub fn with_config(
        backend: Arc<dyn Backend>,
        cache: Arc<dyn QueryCache>,
        config: BridgeConfig,
    ) -> Self {
        Self::with_named_queries(backend, cache, Arc::new(NamedQueryCache::new()), config)
    }

    /// Build a bridge that resolves named queries through a shared map.
    pub fn with_named_queries(
        backend: Arc<dyn Backend>,
        cache: Arc<dyn QueryCache>,
        named: Arc<NamedQueryCache>,
        config: BridgeConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                cache,
                named,
                listeners: Arc::new(ListenerTable::new()),
                inflight: Mutex::new(HashSet::new()),
                config,
            }),
        }
    }

    pub fn cache(&self) -> &Arc<dyn QueryCache> {
        &self.shared.cache
    }

    pub fn named_queries(&self) -> &Arc<NamedQueryCache> {
        &self.shared.named
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    /// Bind `key` to `descriptor`.
    ///
    /// In one-shot mode this returns after the read settled (or immediately
    /// when the key is already settled or being read). In subscribe mode it
    /// returns once the listener is registered; emissions keep flowing into
    /// the cache until the returned binding, and every other binding for the
    /// same key, is dropped.
    pub async fn bind(
        &self,
        key: CacheKey,
        descriptor: SourceDescriptor,
        options: FetchOptions,
    ) -> Binding {
        let ticket = self.attach(&key, &descriptor, &options).await;
        Binding {
            bridge: self.clone(),
            key,
            descriptor,
            options,
            ticket,
        }
    }

    /// Bind with [`BridgeConfig::default_options`].
    pub async fn bind_default(&self, key: CacheKey, descriptor: SourceDescriptor) -> Binding {
        let options = self.shared.config.default_options.clone();
        self.bind(key, descriptor, options).await
    }

    /// Remove the entry for `key` and tear down its listener.
    pub fn evict(&self, key: &CacheKey) -> Option<CacheEntry> {
        if self.shared.listeners.evict(key) {
            debug!(key = %key, "evicted listener");
        }
        self.shared.cache.remove(key)
    }

    /// Number of live backend listeners.
    pub fn active_listeners(&self) -> usize {
        self.shared.listeners.active_count()
    }

    /// Bindings currently sharing the listener for `key`.
    pub fn observers(&self, key: &CacheKey) -> usize {
        self.shared.listeners.observers(key)
    }

    async fn attach(
        &self,
        key: &CacheKey,
        descriptor: &SourceDescriptor,
        options: &FetchOptions,
    ) -> Option<ObserverTicket> {
        debug!(
            key = %key,
            kind = descriptor.kind(),
            subscribe = options.subscribe,
            "binding"
        );

        if let Err(error) = descriptor.validate(options) {
            debug!(key = %key, %error, "rejecting descriptor");
            self.shared.cache.reject(key, error);
            return None;
        }

        if options.subscribe {
            self.subscribe(key, descriptor, options).await
        } else {
            self.read_once(key, descriptor, options, false).await;
            None
        }
    }

    async fn read_once(
        &self,
        key: &CacheKey,
        descriptor: &SourceDescriptor,
        options: &FetchOptions,
        force: bool,
    ) {
        let shared = &self.shared;
        let status = shared.cache.ensure(key);
        if shared.listeners.contains(key) {
            debug!(key = %key, "key is fed by a listener, skipping read");
            return;
        }
        if status.is_settled() && !force {
            debug!(key = %key, ?status, "entry already settled, skipping read");
            return;
        }
        let Some(_claim) = InflightRead::claim(&shared.inflight, key) else {
            debug!(key = %key, "read already in flight");
            return;
        };

        match self.fetch(descriptor, options).await {
            Ok(snapshot) => {
                trace!(key = %key, "one-shot read resolved");
                shared.cache.resolve(key, snapshot);
            }
            Err(error) => {
                debug!(key = %key, %error, "one-shot read failed");
                shared.cache.reject(key, error);
            }
        }
    }

    async fn fetch(
        &self,
        descriptor: &SourceDescriptor,
        options: &FetchOptions,
    ) -> Result<Snapshot> {
        let backend = self.shared.backend.as_ref();
        let read = options.read_options();
        let snapshot = match descriptor {
            SourceDescriptor::OneTimeQuery(query) | SourceDescriptor::LiveQuery(query) => {
                Snapshot::Query(backend.get_query(query, read).await?)
            }
            SourceDescriptor::LiveDocument(path) => {
                Snapshot::Document(backend.get_document(path, read).await?)
            }
            SourceDescriptor::NamedQuery { store, name } => {
                let query = self.shared.named.resolve(backend, store, name).await?;
                Snapshot::Query(backend.get_query(&query, read).await?)
            }
            SourceDescriptor::IdToken(auth) => {
                Snapshot::IdToken(backend.get_id_token(auth, options.force_refresh).await?)
            }
        };
        Ok(snapshot)
    }

    async fn subscribe(
        &self,
        key: &CacheKey,
        descriptor: &SourceDescriptor,
        options: &FetchOptions,
    ) -> Option<ObserverTicket> {
        let shared = &self.shared;
        // Named queries resolve before the slot is reserved; nothing below
        // awaits, so a reservation is always installed or abandoned.
        let descriptor = match descriptor {
            SourceDescriptor::NamedQuery { store, name } => {
                match shared.named.resolve(shared.backend.as_ref(), store, name).await {
                    Ok(query) => Cow::Owned(SourceDescriptor::LiveQuery(query)),
                    Err(error) => {
                        debug!(key = %key, %error, "named query resolution failed");
                        shared.cache.ensure(key);
                        shared.cache.reject(key, error);
                        return None;
                    }
                }
            }
            other => Cow::Borrowed(other),
        };

        let mut ticket = match shared.listeners.acquire(key) {
            Acquired::Joined(ticket) => {
                debug!(key = %key, observers = shared.listeners.observers(key), "joined listener");
                shared.cache.ensure(key);
                return Some(ticket);
            }
            Acquired::Reserved(ticket) => ticket,
        };
        shared.cache.ensure(key);

        match self.listen(key, &descriptor, options) {
            Ok(guard) => {
                if ticket.install(guard) {
                    debug!(key = %key, generation = ticket.generation(), "listener registered");
                    return Some(ticket);
                }
                // Evicted while registering. Drop whatever the initial
                // snapshot wrote unless a newer listener feeds the key.
                if !shared.listeners.contains(key) {
                    shared.cache.remove(key);
                }
                None
            }
            Err(error) => {
                debug!(key = %key, %error, "listener registration failed");
                ticket.abandon();
                shared.cache.reject(key, error);
                None
            }
        }
    }

    fn listen(
        &self,
        key: &CacheKey,
        descriptor: &SourceDescriptor,
        options: &FetchOptions,
    ) -> Result<ListenerGuard> {
        let backend = self.shared.backend.as_ref();
        let listen = options.listen_options();
        let gate = SinkGate::open();
        let sink = self.sink(key, &gate);

        let registration = match descriptor {
            SourceDescriptor::OneTimeQuery(_) => Err(BridgeError::InvalidDescriptor(
                "a one-time query cannot be subscribed to".to_string(),
            )),
            SourceDescriptor::NamedQuery { name, .. } => Err(BridgeError::InvalidDescriptor(
                format!("named query {name} was not resolved before listening"),
            )),
            SourceDescriptor::LiveQuery(query) => backend
                .listen_query(query, listen, sink)
                .map_err(BridgeError::from),
            SourceDescriptor::LiveDocument(path) => backend
                .listen_document(path, listen, sink)
                .map_err(BridgeError::from),
            SourceDescriptor::IdToken(auth) => backend
                .listen_id_token(auth, sink)
                .map_err(BridgeError::from),
        };

        match registration {
            Ok(registration) => Ok(ListenerGuard::new(key.clone(), gate, registration)),
            Err(error) => {
                gate.close();
                Err(error)
            }
        }
    }

    /// Sink that forwards emissions for `key` while `gate` is open. The gate
    /// stays held across the cache write, so closing it waits for the write.
    fn sink(&self, key: &CacheKey, gate: &SinkGate) -> SnapshotSink {
        let cache = Arc::clone(&self.shared.cache);
        let key = key.clone();
        let gate = gate.clone();
        Arc::new(move |result| {
            let Some(_open) = gate.enter() else {
                warn!(key = %key, "ignoring emission from released listener");
                return;
            };
            match result {
                Ok(snapshot) => {
                    trace!(key = %key, "listener emission");
                    cache.resolve(&key, snapshot);
                }
                Err(error) => {
                    debug!(key = %key, %error, "listener error");
                    cache.reject(&key, BridgeError::Backend(error));
                }
            }
        })
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("active_listeners", &self.active_listeners())
            .field("config", &self.shared.config)
            .finish()
    }
}

/// Marks a key as having a one-shot read in progress.
struct InflightRead<'a> {
    set: &'a Mutex<HashSet<CacheKey>>,
    key: CacheKey,
}

impl<'a> InflightRead<'a> {
    fn claim(set: &'a Mutex<HashSet<CacheKey>>, key: &CacheKey) -> Option<Self> {
        if !set.lock().insert(key.clone()) {
            return None;
        }
        Some(Self {
            set,
            key: key.clone(),
        })
    }
}

impl Drop for InflightRead<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.key);
    }
}

/// A consumer's binding of a cache key to a source.
///
/// Dropping the binding releases its interest in the key's listener.
pub struct Binding {
    bridge: Bridge,
    key: CacheKey,
    descriptor: SourceDescriptor,
    options: FetchOptions,
    ticket: Option<ObserverTicket>,
}

impl Binding {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    pub fn options(&self) -> &FetchOptions {
        &self.options
    }

    /// True while this binding observes an installed backend listener.
    pub fn is_subscribed(&self) -> bool {
        self.ticket.as_ref().is_some_and(ObserverTicket::is_live)
    }

    /// Current value, status and error for the bound key.
    pub fn view(&self) -> EntryView {
        self.bridge
            .cache()
            .entry(&self.key)
            .map(|entry| entry.view())
            .unwrap_or_else(EntryView::loading)
    }

    pub fn status(&self) -> EntryStatus {
        self.bridge
            .cache()
            .status(&self.key)
            .unwrap_or(EntryStatus::Loading)
    }

    /// Point the binding at `key`. Does nothing when `key` equals the current
    /// key, even if `descriptor` or `options` differ. Otherwise the old
    /// listener claim is released before the new key is bound. Returns true
    /// if the binding changed.
    pub async fn rebind(
        &mut self,
        key: CacheKey,
        descriptor: SourceDescriptor,
        options: FetchOptions,
    ) -> bool {
        if key == self.key {
            return false;
        }
        debug!(from = %self.key, to = %key, "rebinding");
        self.ticket = None;
        self.key = key;
        self.descriptor = descriptor;
        self.options = options;
        self.ticket = self
            .bridge
            .attach(&self.key, &self.descriptor, &self.options)
            .await;
        true
    }

    /// Issue a new one-shot read for the bound key. No-op for subscribed
    /// bindings; their listener keeps the entry current.
    pub async fn refetch(&self) {
        if self.options.subscribe {
            return;
        }
        if let Err(error) = self.descriptor.validate(&self.options) {
            self.bridge.cache().reject(&self.key, error);
            return;
        }
        self.bridge
            .read_once(&self.key, &self.descriptor, &self.options, true)
            .await;
    }

    /// Release the binding now.
    pub fn dispose(self) {}
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("key", &self.key)
            .field("kind", &self.descriptor.kind())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}
