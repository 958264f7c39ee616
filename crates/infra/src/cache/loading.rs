//! Read-through LRU cache with a per-key stampede guard.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::OnceCell;

use super::lru::LruCache;

/// Cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Loader invocations (at most one per concurrent miss burst)
    pub loads: u64,
    pub evictions: u64,
    pub size: usize,
    pub capacity: Option<usize>,
}

struct State<K, V> {
    lru: LruCache<K, Arc<V>>,
    in_flight: HashMap<K, Arc<OnceCell<Arc<V>>>>,
}

/// LRU of `Arc<V>` values loaded on demand.
///
/// A miss installs an in-flight slot for the key under the same lock that
/// checked the LRU, so concurrent misses share one load and receive the same
/// `Arc`. Failed loads leave nothing behind.
pub struct LoadingCache<K, V> {
    state: Mutex<State<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> std::fmt::Debug for LoadingCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadingCache")
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> LoadingCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// A capacity of 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self::from_lru(LruCache::new(capacity))
    }

    /// Capacity from a signed property value (`<= 0` is unbounded).
    pub fn with_limit(limit: i64) -> Self {
        Self::from_lru(LruCache::with_limit(limit))
    }

    fn from_lru(lru: LruCache<K, Arc<V>>) -> Self {
        Self {
            state: Mutex::new(State {
                lru,
                in_flight: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Cached value, if present. Counts as an access.
    pub fn get_if_present(&self, key: &K) -> Option<Arc<V>> {
        self.lock().lru.get(key).cloned()
    }

    /// Return the cached value or run `load` to produce it.
    ///
    /// Waiters that joined a load which then failed retry with their own loader.
    pub async fn get_or_try_load<E, F, Fut>(&self, key: K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut state = self.lock();
            if let Some(value) = state.lru.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value.clone());
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            state.in_flight.entry(key.clone()).or_default().clone()
        };

        let loaded = cell
            .get_or_try_init(|| async move {
                self.loads.fetch_add(1, Ordering::Relaxed);
                load().await.map(Arc::new)
            })
            .await
            .cloned();

        let mut state = self.lock();
        let ours = state
            .in_flight
            .get(&key)
            .is_some_and(|current| Arc::ptr_eq(current, &cell));

        match loaded {
            Ok(value) => {
                // First finisher publishes; an invalidate during the load removed our slot.
                if ours {
                    state.in_flight.remove(&key);
                    if state.lru.insert(key, value.clone()).is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Ok(value)
            }
            Err(e) => {
                // Map plus this handle: nobody else is waiting on the slot.
                if ours && Arc::strong_count(&cell) <= 2 && !cell.initialized() {
                    state.in_flight.remove(&key);
                }
                Err(e)
            }
        }
    }

    /// Insert a value directly, superseding any in-flight load for the key.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let mut state = self.lock();
        state.in_flight.remove(&key);
        if state.lru.insert(key, value.clone()).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Drop one entry. An in-flight load for the key is not published.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut state = self.lock();
        state.in_flight.remove(key);
        state.lru.remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.in_flight.clear();
        state.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().lru.contains(key)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.lock();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            size: state.lru.len(),
            capacity: state.lru.capacity(),
        }
    }
}
