//! Core types for the bridge: keys, descriptors, options and snapshot values.

use crate::error::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Caller-supplied cache key.
///
/// Equality and hashing are structural: two keys are equal when their
/// canonical JSON text is equal. Object members are ordered, so
/// `{"a":1,"b":2}` and `{"b":2,"a":1}` name the same entry.
#[derive(Clone, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub struct CacheKey {
    value: Value,
    canonical: String,
}

impl CacheKey {
    pub fn new(value: impl Into<Value>) -> Self {
        let value = value.into();
        let canonical = value.to_string();
        Self { value, canonical }
    }

    /// The key as the caller supplied it.
    pub fn as_value(&self) -> &Value {
        &self.value
    }

    /// Canonical JSON text used for equality.
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl From<Value> for CacheKey {
    fn from(value: Value) -> Self {
        CacheKey::new(value)
    }
}

impl From<CacheKey> for Value {
    fn from(key: CacheKey) -> Self {
        key.value
    }
}

impl From<&str> for CacheKey {
    fn from(s: &str) -> Self {
        CacheKey::new(Value::String(s.to_string()))
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", self.canonical)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Identity of a backend store (database instance).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreHandle(pub String);

impl StoreHandle {
    pub fn new(id: impl Into<String>) -> Self {
        StoreHandle(id.into())
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        StoreHandle("(default)".to_string())
    }
}

impl fmt::Display for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of an auth instance (one per app).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AuthHandle(pub String);

impl AuthHandle {
    pub fn new(app: impl Into<String>) -> Self {
        AuthHandle(app.into())
    }
}

impl Default for AuthHandle {
    fn default() -> Self {
        AuthHandle("[DEFAULT]".to_string())
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.trim_matches('/').split('/').collect()
}

fn check_segments(path: &str, want_even: bool, what: &str) -> Result<(), BridgeError> {
    let parts = segments(path);
    if parts.iter().any(|s| s.is_empty()) {
        return Err(BridgeError::InvalidDescriptor(format!(
            "{what} path '{path}' contains an empty segment"
        )));
    }
    if (parts.len() % 2 == 0) != want_even {
        return Err(BridgeError::InvalidDescriptor(format!(
            "{what} path '{path}' has {} segments",
            parts.len()
        )));
    }
    Ok(())
}

/// Slash-separated path to a collection, e.g. `users/alice/orders`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CollectionPath(String);

impl CollectionPath {
    /// Create a path without validating it. Use [`CollectionPath::parse`] to
    /// reject malformed input early.
    pub fn new(path: impl Into<String>) -> Self {
        CollectionPath(path.into())
    }

    pub fn parse(path: impl Into<String>) -> Result<Self, BridgeError> {
        let path = Self::new(path);
        path.validate()?;
        Ok(path)
    }

    /// A collection path has an odd number of non-empty segments.
    pub fn validate(&self) -> Result<(), BridgeError> {
        check_segments(&self.0, false, "collection")
    }

    pub fn as_str(&self) -> &str {
        self.0.trim_matches('/')
    }

    pub fn doc(&self, id: &str) -> DocumentPath {
        DocumentPath::new(format!("{}/{}", self.as_str(), id))
    }
}

impl fmt::Display for CollectionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Slash-separated path to a document, e.g. `products/widget`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Create a path without validating it.
    pub fn new(path: impl Into<String>) -> Self {
        DocumentPath(path.into())
    }

    pub fn parse(path: impl Into<String>) -> Result<Self, BridgeError> {
        let path = Self::new(path);
        path.validate()?;
        Ok(path)
    }

    /// A document path has an even number of non-empty segments.
    pub fn validate(&self) -> Result<(), BridgeError> {
        check_segments(&self.0, true, "document")
    }

    pub fn as_str(&self) -> &str {
        self.0.trim_matches('/')
    }

    /// Last segment.
    pub fn id(&self) -> &str {
        self.as_str().rsplit('/').next().unwrap_or_default()
    }

    /// Collection containing this document.
    pub fn parent(&self) -> CollectionPath {
        let s = self.as_str();
        match s.rfind('/') {
            Some(idx) => CollectionPath::new(&s[..idx]),
            None => CollectionPath::new(""),
        }
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Comparison used by a query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

/// A query over one collection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: CollectionPath,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<(String, Direction)>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    /// Query every document in a collection.
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            collection: CollectionPath::new(path),
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: Value) -> Self {
        self.filters.push(Filter {
            field: field.into(),
            op,
            value,
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some((field.into(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        self.collection.validate()?;
        if self.limit == Some(0) {
            return Err(BridgeError::InvalidDescriptor(
                "query limit must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// What the bridge should read.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceDescriptor {
    /// A query read exactly once; cannot be subscribed to.
    OneTimeQuery(Query),
    /// A query that is read once or listened to, depending on `subscribe`.
    LiveQuery(Query),
    /// A single document, read once or listened to.
    LiveDocument(DocumentPath),
    /// A query loaded from a bundle and looked up by name.
    NamedQuery { store: StoreHandle, name: String },
    /// The signed-in user's ID token.
    IdToken(AuthHandle),
}

impl SourceDescriptor {
    pub fn named(store: StoreHandle, name: impl Into<String>) -> Self {
        SourceDescriptor::NamedQuery {
            store,
            name: name.into(),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SourceDescriptor::OneTimeQuery(_) => "one_time_query",
            SourceDescriptor::LiveQuery(_) => "live_query",
            SourceDescriptor::LiveDocument(_) => "live_document",
            SourceDescriptor::NamedQuery { .. } => "named_query",
            SourceDescriptor::IdToken(_) => "id_token",
        }
    }

    /// Check the descriptor against the options it will be used with.
    pub fn validate(&self, options: &FetchOptions) -> Result<(), BridgeError> {
        match self {
            SourceDescriptor::OneTimeQuery(query) => {
                if options.subscribe {
                    return Err(BridgeError::InvalidDescriptor(
                        "a one-time query cannot be subscribed to".to_string(),
                    ));
                }
                query.validate()
            }
            SourceDescriptor::LiveQuery(query) => query.validate(),
            SourceDescriptor::LiveDocument(path) => path.validate(),
            SourceDescriptor::NamedQuery { name, .. } => {
                if name.is_empty() {
                    return Err(BridgeError::InvalidDescriptor(
                        "named query with empty name".to_string(),
                    ));
                }
                Ok(())
            }
            SourceDescriptor::IdToken(_) => Ok(()),
        }
    }
}

/// Where a one-shot read is served from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadSource {
    /// Server when reachable, otherwise the local cache.
    #[default]
    Default,
    /// Local cache only.
    Cache,
    /// Server only; fails when offline.
    Server,
}

/// Per-binding options.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchOptions {
    /// Open a live listener instead of reading once.
    pub subscribe: bool,
    /// Read path for one-shot reads. Ignored when subscribing.
    pub source: ReadSource,
    /// Deliver metadata-only changes. Ignored for one-shot reads.
    pub include_metadata_changes: bool,
    /// Force a fresh ID token. Only meaningful for token sources.
    pub force_refresh: bool,
    /// Passed through to the one-shot call.
    pub timeout: Option<Duration>,
}

impl FetchOptions {
    pub fn subscribe() -> Self {
        Self {
            subscribe: true,
            ..Default::default()
        }
    }

    pub fn from_source(source: ReadSource) -> Self {
        Self {
            source,
            ..Default::default()
        }
    }

    pub(crate) fn read_options(&self) -> ReadOptions {
        ReadOptions {
            source: self.source,
            timeout: self.timeout,
        }
    }

    pub(crate) fn listen_options(&self) -> ListenOptions {
        ListenOptions {
            include_metadata_changes: self.include_metadata_changes,
        }
    }
}

/// Options handed to the backend's one-shot read.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ReadOptions {
    pub source: ReadSource,
    pub timeout: Option<Duration>,
}

/// Options handed to the backend's listen call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct ListenOptions {
    pub include_metadata_changes: bool,
}

/// Where a snapshot came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub from_cache: bool,
    pub has_pending_writes: bool,
}

/// A single document as read from the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub path: DocumentPath,
    /// `None` when the document does not exist.
    pub data: Option<Value>,
    pub metadata: SnapshotMetadata,
}

impl DocumentSnapshot {
    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Document data with the id injected under `id_field`, if given.
    pub fn to_data(&self, id_field: Option<&str>) -> Option<Value> {
        let mut data = self.data.clone()?;
        if let (Some(field), Value::Object(map)) = (id_field, &mut data) {
            map.insert(field.to_string(), Value::String(self.id().to_string()));
        }
        Some(data)
    }
}

/// The result of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QuerySnapshot {
    pub docs: Vec<DocumentSnapshot>,
    pub metadata: SnapshotMetadata,
}

impl QuerySnapshot {
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }
}

/// A signed ID token for the current user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdToken {
    pub uid: String,
    pub token: String,
    pub issued_at: Timestamp,
}

/// A value pushed into a cache entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Snapshot {
    Query(QuerySnapshot),
    Document(DocumentSnapshot),
    /// `None` when no user is signed in.
    IdToken(Option<IdToken>),
}

impl Snapshot {
    pub fn metadata(&self) -> SnapshotMetadata {
        match self {
            Snapshot::Query(q) => q.metadata,
            Snapshot::Document(d) => d.metadata,
            Snapshot::IdToken(_) => SnapshotMetadata::default(),
        }
    }

    pub fn as_query(&self) -> Option<&QuerySnapshot> {
        match self {
            Snapshot::Query(q) => Some(q),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentSnapshot> {
        match self {
            Snapshot::Document(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_id_token(&self) -> Option<&IdToken> {
        match self {
            Snapshot::IdToken(t) => t.as_ref(),
            _ => None,
        }
    }

    /// Plain data view: an array of documents for queries, the document data
    /// (or `null` when missing) for documents, the token string for tokens.
    pub fn to_data(&self, id_field: Option<&str>) -> Value {
        match self {
            Snapshot::Query(q) => Value::Array(
                q.docs
                    .iter()
                    .filter_map(|doc| doc.to_data(id_field))
                    .collect(),
            ),
            Snapshot::Document(d) => d.to_data(id_field).unwrap_or(Value::Null),
            Snapshot::IdToken(t) => t
                .as_ref()
                .map(|t| Value::String(t.token.clone()))
                .unwrap_or(Value::Null),
        }
    }
}
