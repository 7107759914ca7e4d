//! Shared test support: a backend whose every answer is scripted by the test.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tether::{
    AuthHandle, Backend, BackendError, BackendErrorCode, BackendResult, Bridge, DocumentPath,
    DocumentSnapshot, IdToken, ListenOptions, ListenerRegistration, MemoryCache, Query,
    QuerySnapshot, ReadOptions, Snapshot, SnapshotMetadata, SnapshotSink, StoreHandle, Timestamp,
};

/// Install a log subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub struct Registration {
    pub target: String,
    pub options: ListenOptions,
    pub sink: SnapshotSink,
    pub unsubscribed: bool,
}

#[derive(Default)]
struct State {
    query_results: VecDeque<BackendResult<QuerySnapshot>>,
    document_results: VecDeque<BackendResult<DocumentSnapshot>>,
    token_results: VecDeque<BackendResult<Option<IdToken>>>,
    named: HashMap<(StoreHandle, String), Query>,
    registrations: Vec<Registration>,
    listen_failures: VecDeque<BackendError>,
    /// Run once each, after a registration is recorded and before `listen_*`
    /// returns.
    listen_hooks: VecDeque<Box<dyn FnOnce() + Send>>,
    /// "listen #n" / "unsubscribe #n" in the order they happened.
    log: Vec<String>,
    reads: usize,
    named_lookups: usize,
    last_read_options: Option<ReadOptions>,
    last_force_refresh: Option<bool>,
}

/// Backend that answers reads from queues and lets the test drive listener
/// emissions by registration index, including after unsubscribe.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<State>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_query_result(&self, result: BackendResult<QuerySnapshot>) {
        self.state.lock().query_results.push_back(result);
    }

    pub fn push_document_result(&self, result: BackendResult<DocumentSnapshot>) {
        self.state.lock().document_results.push_back(result);
    }

    pub fn push_token_result(&self, result: BackendResult<Option<IdToken>>) {
        self.state.lock().token_results.push_back(result);
    }

    pub fn define_named(&self, store: &StoreHandle, name: &str, query: Query) {
        self.state
            .lock()
            .named
            .insert((store.clone(), name.to_string()), query);
    }

    pub fn fail_next_listen(&self, error: BackendError) {
        self.state.lock().listen_failures.push_back(error);
    }

    /// Run `hook` inside the next successful listen call.
    pub fn on_next_listen(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().listen_hooks.push_back(Box::new(hook));
    }

    /// Deliver `result` to registration `index`, whether or not it was
    /// unsubscribed.
    pub fn emit(&self, index: usize, result: BackendResult<Snapshot>) {
        let sink = Arc::clone(&self.state.lock().registrations[index].sink);
        sink(result);
    }

    pub fn registration_count(&self) -> usize {
        self.state.lock().registrations.len()
    }

    pub fn active_registrations(&self) -> usize {
        self.state
            .lock()
            .registrations
            .iter()
            .filter(|r| !r.unsubscribed)
            .count()
    }

    pub fn is_unsubscribed(&self, index: usize) -> bool {
        self.state.lock().registrations[index].unsubscribed
    }

    pub fn registration_target(&self, index: usize) -> String {
        self.state.lock().registrations[index].target.clone()
    }

    pub fn registration_options(&self, index: usize) -> ListenOptions {
        self.state.lock().registrations[index].options
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    pub fn read_count(&self) -> usize {
        self.state.lock().reads
    }

    pub fn named_lookup_count(&self) -> usize {
        self.state.lock().named_lookups
    }

    pub fn last_read_options(&self) -> Option<ReadOptions> {
        self.state.lock().last_read_options
    }

    pub fn last_force_refresh(&self) -> Option<bool> {
        self.state.lock().last_force_refresh
    }

    fn register(
        &self,
        target: String,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        let (index, hook) = {
            let mut state = self.state.lock();
            if let Some(error) = state.listen_failures.pop_front() {
                return Err(error);
            }
            let index = state.registrations.len();
            state.registrations.push(Registration {
                target,
                options,
                sink,
                unsubscribed: false,
            });
            state.log.push(format!("listen #{index}"));
            (index, state.listen_hooks.pop_front())
        };
        if let Some(hook) = hook {
            hook();
        }

        let shared = Arc::clone(&self.state);
        Ok(ListenerRegistration::new(move || {
            let mut state = shared.lock();
            state.registrations[index].unsubscribed = true;
            state.log.push(format!("unsubscribe #{index}"));
        }))
    }
}

fn unscripted() -> BackendError {
    BackendError::new(BackendErrorCode::Internal, "no scripted result")
}

#[async_trait]
impl Backend for ScriptedBackend {
    async fn get_query(&self, _query: &Query, options: ReadOptions) -> BackendResult<QuerySnapshot> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.last_read_options = Some(options);
        state.query_results.pop_front().unwrap_or_else(|| Err(unscripted()))
    }

    async fn get_document(
        &self,
        _path: &DocumentPath,
        options: ReadOptions,
    ) -> BackendResult<DocumentSnapshot> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.last_read_options = Some(options);
        state
            .document_results
            .pop_front()
            .unwrap_or_else(|| Err(unscripted()))
    }

    async fn named_query(&self, store: &StoreHandle, name: &str) -> BackendResult<Option<Query>> {
        let mut state = self.state.lock();
        state.named_lookups += 1;
        Ok(state.named.get(&(store.clone(), name.to_string())).cloned())
    }

    async fn get_id_token(
        &self,
        _auth: &AuthHandle,
        force_refresh: bool,
    ) -> BackendResult<Option<IdToken>> {
        let mut state = self.state.lock();
        state.reads += 1;
        state.last_force_refresh = Some(force_refresh);
        state.token_results.pop_front().unwrap_or_else(|| Err(unscripted()))
    }

    fn listen_query(
        &self,
        query: &Query,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        self.register(format!("query:{}", query.collection), options, sink)
    }

    fn listen_document(
        &self,
        path: &DocumentPath,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        self.register(format!("document:{}", path), options, sink)
    }

    fn listen_id_token(
        &self,
        auth: &AuthHandle,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        self.register(format!("token:{}", auth.0), ListenOptions::default(), sink)
    }
}

/// A bridge over a scripted backend and a fresh memory cache.
pub fn scripted_bridge() -> (ScriptedBackend, Arc<MemoryCache>, Bridge) {
    let backend = ScriptedBackend::new();
    let cache = Arc::new(MemoryCache::default());
    let bridge = Bridge::new(Arc::new(backend.clone()), cache.clone());
    (backend, cache, bridge)
}

/// `count` product documents ranked 0..count.
pub fn products(count: usize) -> QuerySnapshot {
    QuerySnapshot {
        docs: (0..count)
            .map(|i| DocumentSnapshot {
                path: DocumentPath::new(format!("products/p{i}")),
                data: Some(json!({ "name": format!("product {i}"), "rank": i })),
                metadata: SnapshotMetadata::default(),
            })
            .collect(),
        metadata: SnapshotMetadata::default(),
    }
}

pub fn product_snapshot(count: usize) -> Snapshot {
    Snapshot::Query(products(count))
}

pub fn document(path: &str, data: serde_json::Value) -> DocumentSnapshot {
    DocumentSnapshot {
        path: DocumentPath::new(path),
        data: Some(data),
        metadata: SnapshotMetadata::default(),
    }
}

pub fn token(uid: &str, n: u64) -> IdToken {
    IdToken {
        uid: uid.to_string(),
        token: format!("{uid}.{n}"),
        issued_at: Timestamp(0),
    }
}
