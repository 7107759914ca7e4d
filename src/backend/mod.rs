//! The backend collaborator.
//!
//! The bridge consumes only two capabilities from a backend: a one-shot read
//! and a live listen that hands back an unsubscribe handle. Named-query
//! lookup and ID tokens ride on the same trait. Transactions and batched
//! writes are not part of this surface.

mod memory;

pub use memory::MemoryBackend;

use crate::error::BackendResult;
use crate::types::{
    AuthHandle, DocumentPath, DocumentSnapshot, IdToken, ListenOptions, Query, QuerySnapshot,
    ReadOptions, Snapshot, StoreHandle,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Callback a backend invokes for every listener emission.
///
/// Emissions from one registration must be delivered in order. An error does
/// not end the registration; only [`ListenerRegistration::unsubscribe`] does.
pub type SnapshotSink = Arc<dyn Fn(BackendResult<Snapshot>) + Send + Sync>;

/// Unsubscribe handle returned by a backend listen call.
pub struct ListenerRegistration {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// A registration with nothing to release.
    pub fn noop() -> Self {
        Self { unsubscribe: None }
    }

    /// Detach the listener from the backend.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

/// A backend-as-a-service data source.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run a query once.
    async fn get_query(&self, query: &Query, options: ReadOptions) -> BackendResult<QuerySnapshot>;

    /// Read a document once.
    async fn get_document(
        &self,
        path: &DocumentPath,
        options: ReadOptions,
    ) -> BackendResult<DocumentSnapshot>;

    /// Look up a query loaded from a bundle. `Ok(None)` when no loaded bundle
    /// defines `name`.
    async fn named_query(&self, store: &StoreHandle, name: &str) -> BackendResult<Option<Query>>;

    /// Current user's ID token, minting a new one when `force_refresh` is set.
    async fn get_id_token(
        &self,
        auth: &AuthHandle,
        force_refresh: bool,
    ) -> BackendResult<Option<IdToken>>;

    /// Listen to a query. The sink receives `Snapshot::Query` values.
    fn listen_query(
        &self,
        query: &Query,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration>;

    /// Listen to a document. The sink receives `Snapshot::Document` values.
    fn listen_document(
        &self,
        path: &DocumentPath,
        options: ListenOptions,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration>;

    /// Listen to ID token changes. The sink receives `Snapshot::IdToken` values.
    fn listen_id_token(
        &self,
        auth: &AuthHandle,
        sink: SnapshotSink,
    ) -> BackendResult<ListenerRegistration>;
}
