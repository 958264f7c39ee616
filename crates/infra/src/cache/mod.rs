//! Bounded caches.
//!
//! - `LruCache`: unsynchronized LRU map
//! - `LoadingCache`: thread-safe read-through LRU with a stampede guard
//! - `ProcessDefinitionCache`: `LoadingCache` over a process definition store

pub mod definitions;
pub mod loading;
pub mod lru;

pub use definitions::{DEFAULT_DEFINITION_CACHE_LIMIT, ProcessDefinitionCache};
pub use loading::{CacheStats, LoadingCache};
pub use lru::LruCache;

use flowforge_core::ProcessDefinitionId;

use crate::definitions::DefinitionError;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("process definition not found: {0}")]
    NotFound(ProcessDefinitionId),

    #[error("failed to load process definition: {0}")]
    Load(#[from] DefinitionError),
}
