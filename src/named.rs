//! Named query resolution cache.
//!
//! Looking a name up in the loaded bundles is asynchronous and the answer
//! never changes once found, so each (store, name) pair is resolved at most
//! once per map. The map is an explicit value, usually held in an `Arc` and
//! shared by every bridge in the process. Nothing is ever evicted; bundle
//! names are few.

use crate::backend::Backend;
use crate::error::{BridgeError, Result};
use crate::types::{Query, StoreHandle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::debug;

type Slot = Arc<OnceCell<Query>>;

/// Process-scoped map from (store, name) to the resolved query.
#[derive(Default)]
pub struct NamedQueryCache {
    slots: Mutex<HashMap<(StoreHandle, String), Slot>>,
}

impl NamedQueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the query registered as `name` in `store`, asking the backend
    /// only if no earlier call succeeded. Concurrent callers for the same pair
    /// share one lookup. Failures are not cached.
    pub async fn resolve(
        &self,
        backend: &dyn Backend,
        store: &StoreHandle,
        name: &str,
    ) -> Result<Query> {
        let slot = {
            let mut slots = self.slots.lock();
            Arc::clone(
                slots
                    .entry((store.clone(), name.to_string()))
                    .or_default(),
            )
        };

        let query = slot
            .get_or_try_init(|| async {
                debug!(store = %store, name, "resolving named query");
                match backend.named_query(store, name).await? {
                    Some(query) => Ok(query),
                    None => Err(BridgeError::NamedQueryNotFound {
                        store: store.clone(),
                        name: name.to_string(),
                    }),
                }
            })
            .await?;
        Ok(query.clone())
    }

    /// Cached query for the pair, without touching the backend.
    pub fn get(&self, store: &StoreHandle, name: &str) -> Option<Query> {
        self.slots
            .lock()
            .get(&(store.clone(), name.to_string()))
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of names resolved so far.
    pub fn resolved_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }
}
