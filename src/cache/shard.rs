//! Sharded Map Implementation
//!
//! Concurrent hashmap split into `N` independently locked shards so
//! operations on unrelated keys do not contend.
//!
//! # Design
//!
//! - Each shard has its own RwLock
//! - Power-of-2 shard count enables fast modulo via bitwise AND
//! - Per-shard byte accounting driven by [`Weighted`]

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

/// Values that know their own accounting size
pub trait Weighted {
    fn weight(&self) -> u64;
}

impl Weighted for bytes::Bytes {
    fn weight(&self) -> u64 {
        self.len() as u64
    }
}

/// Single shard: a locked hashmap plus its byte total
pub struct Shard<K, V> {
    map: RwLock<HashMap<K, V>>,
    /// Total weight of stored values
    size_bytes: AtomicU64,
}

impl<K, V> Default for Shard<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shard<K, V> {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            size_bytes: AtomicU64::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes.load(Ordering::Relaxed)
    }
}

impl<K: Eq + Hash, V: Weighted> Shard<K, V> {
    /// Get a value from the shard
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.map.read().get(key).cloned()
    }

    /// Run `f` against a value under the read lock
    pub fn with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.map.read().get(key).map(f)
    }

    /// Insert a value, returning the replaced one
    pub fn insert(&self, key: K, value: V) -> Option<V> {
        let added = value.weight();
        let mut guard = self.map.write();
        let old = guard.insert(key, value);

        self.size_bytes.fetch_add(added, Ordering::Relaxed);
        if let Some(old) = &old {
            self.size_bytes.fetch_sub(old.weight(), Ordering::Relaxed);
        }
        old
    }

    /// Remove a value, returning it if present
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let removed = self.map.write().remove(key);
        if let Some(v) = &removed {
            self.size_bytes.fetch_sub(v.weight(), Ordering::Relaxed);
        }
        removed
    }

    /// Remove only if `predicate` still holds under the write lock
    pub fn remove_if<Q>(&self, key: &Q, predicate: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let mut guard = self.map.write();
        if !guard.get(key).map(predicate).unwrap_or(false) {
            return None;
        }
        let removed = guard.remove(key);
        if let Some(v) = &removed {
            self.size_bytes.fetch_sub(v.weight(), Ordering::Relaxed);
        }
        removed
    }

    pub fn clear(&self) {
        let mut guard = self.map.write();
        guard.clear();
        self.size_bytes.store(0, Ordering::Relaxed);
    }

    /// Project every entry under one read lock
    pub fn collect<T>(&self, mut f: impl FnMut(&K, &V) -> Option<T>) -> Vec<T> {
        self.map.read().iter().filter_map(|(k, v)| f(k, v)).collect()
    }
}

/// Sharded map with a compile-time shard count
pub struct ShardedMap<K, V, const N: usize> {
    shards: Box<[Shard<K, V>]>,
}

impl<K, V, const N: usize> Default for ShardedMap<K, V, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, const N: usize> ShardedMap<K, V, N> {
    pub fn new() -> Self {
        debug_assert!(N.is_power_of_two(), "shard count must be a power of two");
        let shards: Vec<Shard<K, V>> = (0..N).map(|_| Shard::new()).collect();
        Self {
            shards: shards.into_boxed_slice(),
        }
    }

    /// Total entries across all shards
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    /// Total weight across all shards
    pub fn size_bytes(&self) -> u64 {
        self.shards.iter().map(|s| s.size_bytes()).sum()
    }
}

impl<K: Eq + Hash, V: Weighted, const N: usize> ShardedMap<K, V, N> {
    #[inline]
    fn shard_for<Q: Hash + ?Sized>(&self, key: &Q) -> &Shard<K, V> {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) & (N - 1)]
    }

    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.shard_for(key).get(key)
    }

    pub fn with<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Option<R>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).with(key, f)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard_for(&key).insert(key, value)
    }

    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove(key)
    }

    pub fn remove_if<Q>(&self, key: &Q, predicate: impl FnOnce(&V) -> bool) -> Option<V>
    where
        K: std::borrow::Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.shard_for(key).remove_if(key, predicate)
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    /// Project every entry, shard by shard
    pub fn collect<T>(&self, mut f: impl FnMut(&K, &V) -> Option<T>) -> Vec<T> {
        let mut out = Vec::new();
        for shard in self.shards.iter() {
            out.extend(shard.collect(&mut f));
        }
        out
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn value(n: usize) -> Bytes {
        Bytes::from(vec![0u8; n])
    }

    #[test]
    fn test_shard_insert_get_remove() {
        let shard: Shard<String, Bytes> = Shard::new();
        assert!(shard.is_empty());

        assert!(shard.insert("k1".to_string(), value(4)).is_none());
        assert_eq!(shard.len(), 1);
        assert_eq!(shard.size_bytes(), 4);
        assert_eq!(shard.get("k1"), Some(value(4)));

        assert_eq!(shard.remove("k1"), Some(value(4)));
        assert!(shard.is_empty());
        assert_eq!(shard.size_bytes(), 0);
    }

    #[test]
    fn test_replace_adjusts_size() {
        let shard: Shard<String, Bytes> = Shard::new();
        shard.insert("k".to_string(), value(10));
        shard.insert("k".to_string(), value(3));

        assert_eq!(shard.len(), 1);
        assert_eq!(shard.size_bytes(), 3);
    }

    #[test]
    fn test_remove_if() {
        let shard: Shard<String, Bytes> = Shard::new();
        shard.insert("k".to_string(), value(2));

        assert!(shard.remove_if("k", |v| v.len() > 5).is_none());
        assert!(shard.remove_if("k", |v| v.len() == 2).is_some());
        assert!(shard.remove_if("missing", |_| true).is_none());
    }

    #[test]
    fn test_sharded_map_basic() {
        let map: ShardedMap<String, Bytes, 16> = ShardedMap::new();
        assert_eq!(map.shards.len(), 16);

        map.insert("a".to_string(), value(1));
        map.insert("b".to_string(), value(2));

        assert_eq!(map.len(), 2);
        assert_eq!(map.size_bytes(), 3);
        assert!(map.with("a", |_| ()).is_some());
        assert_eq!(map.with("b", |v| v.len()), Some(2));
        assert_eq!(map.get("c"), None);

        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.size_bytes(), 0);
    }

    #[test]
    fn test_sharded_map_collect() {
        let map: ShardedMap<String, Bytes, 16> = ShardedMap::new();
        for i in 0..50 {
            map.insert(format!("key{}", i), value(i % 3));
        }

        let mut keys = map.collect(|k, v| (v.len() == 0).then(|| k.clone()));
        keys.sort();
        assert_eq!(keys.len(), 17);
        assert_eq!(map.len(), 50);
    }

    #[test]
    fn test_sharded_map_distribution() {
        let map: ShardedMap<String, Bytes, 16> = ShardedMap::new();
        for i in 0..1000 {
            map.insert(format!("key{}", i), value(1));
        }

        let counts: Vec<usize> = map.shards.iter().map(|s| s.len()).collect();
        let max = counts.iter().copied().max().unwrap_or(0);
        let min = counts.iter().copied().min().unwrap_or(0);
        assert!(max < 200, "uneven distribution: max shard has {} entries", max);
        assert!(min > 20, "uneven distribution: min shard has {} entries", min);
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let map: Arc<ShardedMap<String, Bytes, 16>> = Arc::new(ShardedMap::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || {
                    for i in 0..500 {
                        let key = format!("key-{}-{}", t, i);
                        map.insert(key.clone(), value(1));
                        map.get(&key);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.len(), 4000);
        assert_eq!(map.size_bytes(), 4000);
    }
}
