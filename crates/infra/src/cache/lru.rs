//! Plain least-recently-used map.
//!
//! Not synchronized; [`LoadingCache`](super::LoadingCache) wraps it in a mutex.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Bounded LRU map. A capacity of `None` never evicts.
///
/// Every access stamps the entry with a monotonically increasing tick; the
/// entry with the smallest tick is the eviction victim.
#[derive(Debug)]
pub struct LruCache<K, V> {
    entries: HashMap<K, (V, u64)>,
    order: BTreeMap<u64, K>,
    tick: u64,
    capacity: Option<usize>,
}

impl<K, V> LruCache<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Bounded cache. A capacity of 0 means unbounded.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            tick: 0,
            capacity: (capacity > 0).then_some(capacity),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(0)
    }

    /// Capacity from a signed limit as found in engine properties (`<= 0` is unbounded).
    pub fn with_limit(limit: i64) -> Self {
        Self::new(usize::try_from(limit).unwrap_or(0))
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up and mark as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        let (value, stamp) = self.entries.get_mut(key)?;
        self.order.remove(stamp);
        *stamp = tick;
        self.order.insert(tick, key.clone());
        Some(value)
    }

    /// Look up without touching recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(v, _)| v)
    }

    /// Insert or replace. Returns the evicted entry, if the insert pushed one out.
    pub fn insert(&mut self, key: K, value: V) -> Option<(K, V)> {
        let tick = self.next_tick();
        if let Some((_, old_stamp)) = self.entries.insert(key.clone(), (value, tick)) {
            self.order.remove(&old_stamp);
            self.order.insert(tick, key);
            return None;
        }
        self.order.insert(tick, key);

        match self.capacity {
            Some(capacity) if self.entries.len() > capacity => self.evict_oldest(),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, stamp) = self.entries.remove(key)?;
        self.order.remove(&stamp);
        Some(value)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &K> {
        self.order.values()
    }

    fn evict_oldest(&mut self) -> Option<(K, V)> {
        let (_, key) = self.order.pop_first()?;
        let (value, _) = self.entries.remove(&key)?;
        Some((key, value))
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}
