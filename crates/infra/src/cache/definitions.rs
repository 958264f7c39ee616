use std::sync::Arc;

use tracing::debug;

use flowforge_core::ProcessDefinitionId;

use super::CacheError;
use super::loading::{CacheStats, LoadingCache};
use crate::definitions::{ProcessDefinition, SharedDefinitionStore};

/// Default number of cached process definitions.
pub const DEFAULT_DEFINITION_CACHE_LIMIT: i64 = 128;

/// Read-through cache of parsed process definitions.
pub struct ProcessDefinitionCache {
    store: SharedDefinitionStore,
    cache: LoadingCache<ProcessDefinitionId, ProcessDefinition>,
}

impl std::fmt::Debug for ProcessDefinitionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessDefinitionCache")
            .field("stats", &self.cache.stats())
            .finish()
    }
}

impl ProcessDefinitionCache {
    /// `limit <= 0` disables eviction.
    pub fn new(store: SharedDefinitionStore, limit: i64) -> Self {
        Self {
            store,
            cache: LoadingCache::with_limit(limit),
        }
    }

    pub fn store(&self) -> &SharedDefinitionStore {
        &self.store
    }

    pub async fn get(&self, id: ProcessDefinitionId) -> Result<Arc<ProcessDefinition>, CacheError> {
        let store = self.store.clone();
        self.cache
            .get_or_try_load(id, || async move {
                debug!(definition_id = %id, "loading process definition");
                store.get(id).await?.ok_or(CacheError::NotFound(id))
            })
            .await
    }

    /// Seed the cache right after a deploy.
    pub fn put(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        self.cache.insert(definition.id, definition)
    }

    pub fn invalidate(&self, id: ProcessDefinitionId) -> bool {
        self.cache.invalidate(&id)
    }

    pub fn clear(&self) {
        self.cache.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
