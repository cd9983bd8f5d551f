//! Fast Tier - In-Process Memory Cache
//!
//! Volatile tier backed by a 64-way [`ShardedMap`].
//!
//! # Design
//!
//! - Bounded by entry count and, optionally, total bytes
//! - LRU eviction (least recently accessed first) with high/low watermarks
//! - Expired entries are purged lazily on access and preferred by eviction
//! - Every eviction is reported to an [`EvictionListener`]

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::entry::{now_millis, CacheEntry, EntryOptions};
use super::policy::EvictionPolicy;
use super::shard::{ShardedMap, Weighted};
use super::tier::{CacheTier, KeyPattern, TierName, TierStats, TierStatsRecorder};
use super::{DEFAULT_FAST_TTL, SHARD_COUNT};
use crate::error::{Error, Result};

/// Notified synchronously whenever a tier evicts an entry
pub trait EvictionListener: Send + Sync {
    fn on_evict(&self, tier: TierName, key: &str);
}

impl<F> EvictionListener for F
where
    F: Fn(TierName, &str) + Send + Sync,
{
    fn on_evict(&self, tier: TierName, key: &str) {
        self(tier, key)
    }
}

impl Weighted for CacheEntry {
    fn weight(&self) -> u64 {
        self.size()
    }
}

/// Memory tier configuration
#[derive(Debug, Clone)]
pub struct MemoryTierConfig {
    /// Default TTL (also this tier's TTL ceiling)
    pub ttl: Duration,
    /// Maximum number of entries
    pub max_entries: usize,
    /// Maximum payload bytes
    pub max_bytes: Option<u64>,
    /// Watermarks
    pub eviction: EvictionPolicy,
}

impl Default for MemoryTierConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_FAST_TTL,
            max_entries: 1_000,
            max_bytes: None,
            eviction: EvictionPolicy::lru(),
        }
    }
}

/// Fast tier
pub struct MemoryTier {
    name: TierName,
    storage: ShardedMap<String, CacheEntry, SHARD_COUNT>,
    config: MemoryTierConfig,
    stats: TierStatsRecorder,
    listener: Option<Arc<dyn EvictionListener>>,
    /// Serializes eviction passes
    eviction_lock: Mutex<()>,
}

impl MemoryTier {
    pub fn new() -> Self {
        Self::with_config(MemoryTierConfig::default())
    }

    pub fn with_config(config: MemoryTierConfig) -> Self {
        Self {
            name: TierName::Fast,
            storage: ShardedMap::new(),
            config,
            stats: TierStatsRecorder::new(),
            listener: None,
            eviction_lock: Mutex::new(()),
        }
    }

    /// Occupy a different slot (e.g. a memory-backed medium tier in tests)
    pub fn with_name(mut self, name: TierName) -> Self {
        self.name = name;
        self
    }

    pub fn with_eviction_listener(mut self, listener: Arc<dyn EvictionListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn config(&self) -> &MemoryTierConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Entry snapshot without touching stats or access telemetry
    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.storage.get(key).filter(|e| !e.is_expired())
    }

    /// Drop every expired entry, returning how many went
    pub fn purge_expired(&self) -> usize {
        let now = now_millis();
        let expired = self
            .storage
            .collect(|k, e| e.metadata.is_expired_at(now).then(|| k.clone()));

        let mut purged = 0;
        for key in expired {
            if self.storage.remove_if(key.as_str(), |e| e.is_expired()).is_some() {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!(tier = %self.name, purged, "Purged expired entries");
        }
        purged
    }

    fn over_capacity(&self) -> bool {
        let policy = &self.config.eviction;
        if policy.should_evict(self.storage.len() as u64, self.config.max_entries as u64) {
            return true;
        }
        match self.config.max_bytes {
            Some(max) => policy.should_evict(self.storage.size_bytes(), max),
            None => false,
        }
    }

    /// Evict down to the low watermark, never touching `keep`
    fn evict(&self, keep: &str) {
        let _guard = self.eviction_lock.lock();
        if !self.over_capacity() {
            return;
        }

        let policy = self.config.eviction;
        let target_entries = policy.target(self.config.max_entries as u64);
        let target_bytes = self.config.max_bytes.map(|max| policy.target(max));

        let now = now_millis();
        let mut candidates = self.storage.collect(|k, e| {
            (k != keep).then(|| {
                (
                    !e.metadata.is_expired_at(now),
                    e.metadata.is_immutable(),
                    e.metadata.last_accessed_at(),
                    k.clone(),
                )
            })
        });
        // Expired first, then mutable before immutable, then least recently used
        candidates.sort();

        let mut evicted = 0u64;
        for (_, _, _, key) in candidates {
            let entries_ok = self.storage.len() as u64 <= target_entries;
            let bytes_ok = target_bytes.map_or(true, |t| self.storage.size_bytes() <= t);
            if entries_ok && bytes_ok {
                break;
            }

            if self.storage.remove(key.as_str()).is_some() {
                evicted += 1;
                if let Some(listener) = &self.listener {
                    listener.on_evict(self.name, &key);
                }
            }
        }

        if evicted > 0 {
            self.stats.record_evictions(evicted);
            debug!(tier = %self.name, evicted, remaining = self.storage.len(), "Evicted entries");
        }
    }
}

impl Default for MemoryTier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheTier for MemoryTier {
    fn name(&self) -> TierName {
        self.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let start = Instant::now();

        let found = self.storage.with(key, |e| {
            if e.is_expired() {
                None
            } else {
                e.record_access();
                Some(e.value().clone())
            }
        });

        match found {
            Some(Some(value)) => {
                self.stats.record_hit(start.elapsed());
                Ok(Some(value))
            }
            Some(None) => {
                self.storage.remove_if(key, |e| e.is_expired());
                self.stats.record_miss(start.elapsed());
                Ok(None)
            }
            None => {
                self.stats.record_miss(start.elapsed());
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: Bytes, options: EntryOptions) -> Result<()> {
        let size = value.len() as u64;
        if let Some(max) = self.config.max_bytes {
            if size > max {
                return Err(Error::Capacity {
                    tier: self.name,
                    reason: format!("value of {} bytes exceeds limit of {}", size, max),
                });
            }
        }

        let ttl = options.ttl.unwrap_or(self.config.ttl);
        let entry = CacheEntry::new(value, ttl, options.immutable);
        self.storage.insert(key.to_string(), entry);

        if self.over_capacity() {
            self.evict(key);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.storage.remove(key).is_some())
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self.storage.with(key, |e| e.is_expired()) {
            Some(false) => Ok(true),
            Some(true) => {
                self.storage.remove_if(key, |e| e.is_expired());
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let pattern = KeyPattern::compile(pattern)?;
        let now = now_millis();
        Ok(self.storage.collect(|k, e| {
            let live = !e.metadata.is_expired_at(now);
            let matched = pattern.as_ref().map_or(true, |p| p.matches(k));
            (live && matched).then(|| k.clone())
        }))
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.storage.size_bytes())
    }

    async fn clear(&self) -> Result<()> {
        self.storage.clear();
        self.stats.reset();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        self.stats
            .snapshot(self.storage.size_bytes(), self.storage.len() as u64)
    }

    fn default_ttl(&self) -> Duration {
        self.config.ttl
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn small(max_entries: usize) -> MemoryTier {
        MemoryTier::with_config(MemoryTierConfig {
            max_entries,
            eviction: EvictionPolicy::strict(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_set_get() {
        let tier = MemoryTier::new();
        tier.set("eth:1:blockNumber", Bytes::from_static(b"0x10"), EntryOptions::default())
            .await
            .unwrap();

        let value = tier.get("eth:1:blockNumber").await.unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"0x10")));
        assert!(tier.has("eth:1:blockNumber").await.unwrap());

        let stats = tier.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.item_count, 1);
        assert_eq!(stats.total_size, 4);
    }

    #[tokio::test]
    async fn test_miss_recorded() {
        let tier = MemoryTier::new();
        assert!(tier.get("absent").await.unwrap().is_none());
        assert_eq!(tier.stats().misses, 1);
        assert_eq!(tier.stats().hit_ratio, 0.0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_purged() {
        let tier = MemoryTier::new();
        tier.set("k", Bytes::from_static(b"v"), EntryOptions::with_ttl(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(tier.get("k").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(tier.get("k").await.unwrap().is_none());
        assert!(tier.is_empty());
        assert!(!tier.has("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_lru_eviction_notifies_listener() {
        let evicted = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&evicted);
        let tier = small(2).with_eviction_listener(Arc::new(move |tier: TierName, key: &str| {
            assert_eq!(tier, TierName::Fast);
            sink.lock().push(key.to_string());
        }));

        tier.set("a", Bytes::from_static(b"1"), EntryOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        tier.set("b", Bytes::from_static(b"2"), EntryOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        // Touch "a" so "b" becomes least recently used
        tier.get("a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        tier.set("c", Bytes::from_static(b"3"), EntryOptions::default()).await.unwrap();

        assert_eq!(tier.len(), 2);
        assert!(tier.has("a").await.unwrap());
        assert!(tier.has("c").await.unwrap());
        assert_eq!(*evicted.lock(), vec!["b".to_string()]);
        assert_eq!(tier.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_immutable_entries_evicted_last() {
        let tier = small(2);
        tier.set("old-immutable", Bytes::from_static(b"1"), EntryOptions { ttl: None, immutable: true })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        tier.set("newer", Bytes::from_static(b"2"), EntryOptions::default()).await.unwrap();
        tier.set("newest", Bytes::from_static(b"3"), EntryOptions::default()).await.unwrap();

        assert!(tier.has("old-immutable").await.unwrap());
        assert!(!tier.has("newer").await.unwrap());
    }

    #[tokio::test]
    async fn test_byte_limit() {
        let tier = MemoryTier::with_config(MemoryTierConfig {
            max_bytes: Some(8),
            eviction: EvictionPolicy::strict(),
            ..Default::default()
        });

        let err = tier
            .set("big", Bytes::from(vec![0u8; 9]), EntryOptions::default())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Capacity { tier: TierName::Fast, .. });

        tier.set("a", Bytes::from(vec![0u8; 5]), EntryOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(2)).await;
        tier.set("b", Bytes::from(vec![0u8; 5]), EntryOptions::default()).await.unwrap();

        assert_eq!(tier.size().await.unwrap(), 5);
        assert!(tier.has("b").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_with_pattern() {
        let tier = MemoryTier::new();
        for key in ["eth:1:a", "eth:1:b", "eth:137:a"] {
            tier.set(key, Bytes::from_static(b"x"), EntryOptions::default()).await.unwrap();
        }

        let mut keys = tier.keys(Some("eth:1:*")).await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["eth:1:a", "eth:1:b"]);
        assert_eq!(tier.keys(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let tier = MemoryTier::new();
        tier.set("short", Bytes::from_static(b"x"), EntryOptions::with_ttl(Duration::from_millis(5)))
            .await
            .unwrap();
        tier.set("long", Bytes::from_static(b"x"), EntryOptions::default()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(tier.purge_expired(), 1);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test]
    async fn test_clear_resets_stats() {
        let tier = MemoryTier::new();
        tier.set("k", Bytes::from_static(b"v"), EntryOptions::default()).await.unwrap();
        tier.get("k").await.unwrap();
        tier.get("missing").await.unwrap();

        tier.clear().await.unwrap();
        assert_eq!(tier.stats(), TierStats::default());
        assert_eq!(tier.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete() {
        let tier = MemoryTier::new();
        tier.set("k", Bytes::from_static(b"v"), EntryOptions::default()).await.unwrap();
        assert!(tier.delete("k").await.unwrap());
        assert!(!tier.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_writers_stay_bounded() {
        let tier = Arc::new(small(50));
        let writes = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tier = Arc::clone(&tier);
                let writes = Arc::clone(&writes);
                tokio::spawn(async move {
                    for i in 0..100 {
                        tier.set(&format!("{}-{}", t, i), Bytes::from_static(b"v"), EntryOptions::default())
                            .await
                            .unwrap();
                        writes.fetch_add(1, Ordering::Relaxed);
                    }
                })
            })
            .collect();
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(writes.load(Ordering::Relaxed), 800);
        assert!(tier.len() <= 50 + 8, "len {}", tier.len());
    }
}
