//! In-process backend holding JSON documents.

use super::{Backend, ListenerRegistration, SnapshotSink};
use crate::error::{BackendError, BackendErrorCode, BackendResult};
use crate::types::{
    AuthHandle, CollectionPath, Direction, DocumentPath, DocumentSnapshot, FilterOp, IdToken,
    ListenOptions, Query, QuerySnapshot, ReadOptions, ReadSource, Snapshot, SnapshotMetadata,
    StoreHandle, Timestamp,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// What a registered listener is watching.
#[derive(Clone, Debug)]
enum ListenTarget {
    Query(Query),
    Document(DocumentPath),
    IdToken(AuthHandle),
}

struct Listener {
    target: ListenTarget,
    include_metadata_changes: bool,
    sink: SnapshotSink,
    /// Last snapshot delivered, used to suppress no-op emissions.
    last: Option<Snapshot>,
}

#[derive(Default)]
struct UserState {
    uid: String,
    token: Option<IdToken>,
    minted: u64,
}

#[derive(Default)]
struct Inner {
    documents: BTreeMap<DocumentPath, Value>,
    bundles: HashMap<(StoreHandle, String), Query>,
    users: HashMap<AuthHandle, UserState>,
    listeners: BTreeMap<u64, Listener>,
    next_listener_id: u64,
    offline: bool,
    latency: Option<Duration>,
    pending_failures: VecDeque<BackendError>,
    reads: u64,
    named_lookups: u64,
}

type Delivery = (SnapshotSink, BackendResult<Snapshot>);

impl Inner {
    fn metadata(&self, from_cache: bool) -> SnapshotMetadata {
        SnapshotMetadata {
            from_cache: from_cache || self.offline,
            has_pending_writes: false,
        }
    }

    fn read_document(&self, path: &DocumentPath, from_cache: bool) -> DocumentSnapshot {
        DocumentSnapshot {
            path: path.clone(),
            data: self.documents.get(path).cloned(),
            metadata: self.metadata(from_cache),
        }
    }

    fn run_query(&self, query: &Query, from_cache: bool) -> QuerySnapshot {
        let metadata = self.metadata(from_cache);
        let mut docs: Vec<DocumentSnapshot> = self
            .documents
            .iter()
            .filter(|(path, _)| path.parent() == query.collection)
            .filter(|(_, data)| matches_filters(query, data))
            .map(|(path, data)| DocumentSnapshot {
                path: path.clone(),
                data: Some(data.clone()),
                metadata,
            })
            .collect();

        if let Some((field, direction)) = &query.order_by {
            docs.sort_by(|a, b| {
                let left = a.data.as_ref().and_then(|d| field_value(d, field));
                let right = b.data.as_ref().and_then(|d| field_value(d, field));
                let ord = compare_optional(left, right);
                match direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = query.limit {
            docs.truncate(limit);
        }

        QuerySnapshot { docs, metadata }
    }

    fn current_token(&self, auth: &AuthHandle) -> Option<IdToken> {
        self.users.get(auth).and_then(|u| u.token.clone())
    }

    fn mint_token(&mut self, auth: &AuthHandle) -> Option<IdToken> {
        let user = self.users.get_mut(auth)?;
        user.minted += 1;
        let token = IdToken {
            uid: user.uid.clone(),
            token: format!("{}.{}", user.uid, user.minted),
            issued_at: Timestamp::now(),
        };
        user.token = Some(token.clone());
        Some(token)
    }

    fn snapshot_for(&self, target: &ListenTarget) -> Snapshot {
        match target {
            ListenTarget::Query(query) => Snapshot::Query(self.run_query(query, false)),
            ListenTarget::Document(path) => Snapshot::Document(self.read_document(path, false)),
            ListenTarget::IdToken(auth) => Snapshot::IdToken(self.current_token(auth)),
        }
    }

    /// Recompute every listener matching `affected` and queue deliveries for
    /// the ones whose view changed.
    fn collect_changes(&mut self, affected: impl Fn(&ListenTarget) -> bool) -> Vec<Delivery> {
        let ids: Vec<u64> = self
            .listeners
            .iter()
            .filter(|(_, l)| affected(&l.target))
            .map(|(id, _)| *id)
            .collect();

        let mut deliveries = Vec::new();
        for id in ids {
            let next = match self.listeners.get(&id) {
                Some(listener) => self.snapshot_for(&listener.target),
                None => continue,
            };
            let Some(listener) = self.listeners.get_mut(&id) else {
                continue;
            };
            let changed = match &listener.last {
                None => true,
                Some(last) if same_data(last, &next) => {
                    listener.include_metadata_changes && last.metadata() != next.metadata()
                }
                Some(_) => true,
            };
            listener.last = Some(next.clone());
            if changed {
                deliveries.push((Arc::clone(&listener.sink), Ok(next)));
            }
        }
        deliveries
    }
}

fn same_data(a: &Snapshot, b: &Snapshot) -> bool {
    match (a, b) {
        (Snapshot::Query(a), Snapshot::Query(b)) => {
            a.docs.len() == b.docs.len()
                && a.docs
                    .iter()
                    .zip(&b.docs)
                    .all(|(x, y)| x.path == y.path && x.data == y.data)
        }
        (Snapshot::Document(a), Snapshot::Document(b)) => a.path == b.path && a.data == b.data,
        (Snapshot::IdToken(a), Snapshot::IdToken(b)) => a == b,
        _ => false,
    }
}

fn field_value<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(data, |value, part| value.get(part))
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn compare_optional(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
    }
}

fn matches_filters(query: &Query, data: &Value) -> bool {
    query.filters.iter().all(|filter| {
        let Some(actual) = field_value(data, &filter.field) else {
            return false;
        };
        let ord = compare_values(actual, &filter.value);
        match filter.op {
            FilterOp::Equal => actual == &filter.value,
            FilterOp::NotEqual => actual != &filter.value,
            FilterOp::LessThan => ord == Some(Ordering::Less),
            FilterOp::LessThanOrEqual => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
            FilterOp::GreaterThan => ord == Some(Ordering::Greater),
            FilterOp::GreaterThanOrEqual => {
                matches!(ord, Some(Ordering::Greater | Ordering::Equal))
            }
        }
    })
}

fn deliver(deliveries: Vec<Delivery>) {
    for (sink, result) in deliveries {
        sink(result);
    }
}

/// In-memory backend.
///
/// Documents live in a sorted map keyed by path. Listeners get an initial
/// snapshot when they register and a fresh one after every write that
/// changes what they see. Sinks are always called with the internal lock
/// released.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    // --- Writes ---

    /// Create or replace a document.
    pub fn set_document(&self, path: &DocumentPath, data: Value) {
        let parent = path.parent();
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.documents.insert(path.clone(), data);
            inner.collect_changes(|target| touches(target, path, &parent))
        };
        deliver(deliveries);
    }

    /// Delete a document. Returns false if it did not exist.
    pub fn delete_document(&self, path: &DocumentPath) -> bool {
        let parent = path.parent();
        let (existed, deliveries) = {
            let mut inner = self.inner.lock();
            let existed = inner.documents.remove(path).is_some();
            let deliveries = if existed {
                inner.collect_changes(|target| touches(target, path, &parent))
            } else {
                Vec::new()
            };
            (existed, deliveries)
        };
        deliver(deliveries);
        existed
    }

    /// Register named queries for a store, as loading a bundle would.
    pub fn load_bundle(&self, store: &StoreHandle, queries: impl IntoIterator<Item = (String, Query)>) {
        let mut inner = self.inner.lock();
        for (name, query) in queries {
            inner.bundles.insert((store.clone(), name), query);
        }
    }

    // --- Auth ---

    /// Sign a user in and notify token listeners.
    pub fn sign_in(&self, auth: &AuthHandle, uid: impl Into<String>) -> Option<IdToken> {
        let (token, deliveries) = {
            let mut inner = self.inner.lock();
            inner.users.insert(
                auth.clone(),
                UserState {
                    uid: uid.into(),
                    ..Default::default()
                },
            );
            let token = inner.mint_token(auth);
            let deliveries = inner.collect_changes(|t| matches!(t, ListenTarget::IdToken(a) if a == auth));
            (token, deliveries)
        };
        deliver(deliveries);
        token
    }

    pub fn sign_out(&self, auth: &AuthHandle) {
        let deliveries = {
            let mut inner = self.inner.lock();
            inner.users.remove(auth);
            inner.collect_changes(|t| matches!(t, ListenTarget::IdToken(a) if a == auth))
        };
        deliver(deliveries);
    }

    // --- Network simulation ---

    /// Switch between online and offline. Listeners that asked for metadata
    /// changes see the `from_cache` flip.
    pub fn set_offline(&self, offline: bool) {
        let deliveries = {
            let mut inner = self.inner.lock();
            if inner.offline == offline {
                return;
            }
            inner.offline = offline;
            inner.collect_changes(|t| !matches!(t, ListenTarget::IdToken(_)))
        };
        deliver(deliveries);
    }

    /// Delay every one-shot read and named-query lookup by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.inner.lock().latency = latency;
    }

    /// Make the next one-shot data read fail with `error`.
    pub fn fail_next_read(&self, error: BackendError) {
        self.inner.lock().pending_failures.push_back(error);
    }

    /// Deliver `error` to every registered listener. Listeners stay registered.
    pub fn broadcast_listener_error(&self, error: BackendError) {
        let sinks: Vec<SnapshotSink> = {
            let inner = self.inner.lock();
            inner.listeners.values().map(|l| Arc::clone(&l.sink)).collect()
        };
        for sink in sinks {
            sink(Err(error.clone()));
        }
    }

    // --- Introspection ---

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    /// Number of one-shot data reads served (including failed ones).
    pub fn read_count(&self) -> u64 {
        self.inner.lock().reads
    }

    /// Number of named-query lookups performed.
    pub fn named_lookup_count(&self) -> u64 {
        self.inner.lock().named_lookups
    }

    // --- Internals ---

    async fn begin_read(&self, options: ReadOptions) -> BackendResult<bool> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.reads += 1;
            if let Some(error) = inner.pending_failures.pop_front() {
                return Err(error);
            }
            inner.latency
        };

        if let Some(latency) = latency {
            match options.timeout {
                Some(timeout) => tokio::time::timeout(timeout, tokio::time::sleep(latency))
                    .await
                    .map_err(|_| {
                        BackendError::new(
                            BackendErrorCode::DeadlineExceeded,
                            format!("read did not complete within {:?}", timeout),
                        )
                    })?,
                None => tokio::time::sleep(latency).await,
            }
        }

        let offline = self.inner.lock().offline;
        match options.source {
            ReadSource::Server if offline => Err(BackendError::unavailable(
                "the client is offline and the read requires the server",
            )),
            ReadSource::Cache => Ok(true),
            ReadSource::Server | ReadSource::Default => Ok(offline),
        }
    }

    fn register(
        &self,
        target: ListenTarget,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> ListenerRegistration {
        let (id, initial) = {
            let mut inner = self.inner.lock();
            let id = inner.next_listener_id;
            inner.next_listener_id += 1;
            let initial = inner.snapshot_for(&target);
            inner.listeners.insert(
                id,
                Listener {
                    target,
                    include_metadata_changes: options.include_metadata_changes,
                    sink: Arc::clone(&sink),
                    last: Some(initial.clone()),
                },
            );
            (id, initial)
        };
        sink(Ok(initial));

        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        ListenerRegistration::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().listeners.remove(&id);
            }
        })
    }
}

fn touches(target: &ListenTarget, path: &DocumentPath, parent: &CollectionPath) -> bool {
    match target {
        ListenTarget::Query(query) => &query.collection == parent,
        ListenTarget::Document(doc) => doc == path,
        ListenTarget::IdToken(_) => false,
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn get_query(&self, query: &Query, options: ReadOptions) -> BackendResult<QuerySnapshot> {
        let from_cache = self.begin_read(options).await?;
        Ok(self.inner.lock().run_query(query, from_cache))
    }

    async fn get_document(
        &self,
        path: &DocumentPath,
        options: ReadOptions,
    ) -> BackendResult<DocumentSnapshot> {
        let from_cache = self.begin_read(options).await?;
        Ok(self.inner.lock().read_document(path, from_cache))
    }

    async fn named_query(&self, store: &StoreHandle, name: &str) -> BackendResult<Option<Query>> {
        let latency = {
            let mut inner = self.inner.lock();
            inner.named_lookups += 1;
            inner.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        Ok(self
            .inner
            .lock()
            .bundles
            .get(&(store.clone(), name.to_string()))
            .cloned())
    }

    async fn get_id_token(
        &self,
        auth: &AuthHandle,
        force_refresh: bool,
    ) -> BackendResult<Option<IdToken>> {
        let (token, deliveries) = {
            let mut inner = self.inner.lock();
            if !inner.users.contains_key(auth) {
                return Ok(None);
            }
            if !force_refresh {
                if let Some(token) = inner.current_token(auth) {
                    return Ok(Some(token));
                }
            }
            let token = inner.mint_token(auth);
            let deliveries = inner.collect_changes(|t| matches!(t, ListenTarget::IdToken(a) if a == auth));
            (token, deliveries)
        };
        deliver(deliveries);
        Ok(token)
    }

    fn listen_query(
        &self,
        query: &Query,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        Ok(self.register(ListenTarget::Query(query.clone()), options, sink))
    }

    fn listen_document(
        &self,
        path: &DocumentPath,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        Ok(self.register(ListenTarget::Document(path.clone()), options, sink))
    }

    fn listen_id_token(
        &self,
        auth: &AuthHandle,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration> {
        Ok(self.register(
            ListenTarget::IdToken(auth.clone()),
            ListenOptions::default(),
            sink,
        ))
    }
}
