//! Cache Manager
//!
//! Orchestrates the registered tiers: picks where writes land, probes reads
//! fastest first, promotes lower-tier hits, and optionally routes work
//! through the deduplicators and the write batch processor.
//!
//! # Routing
//!
//! ```text
//! get(key) ──► [dedup "get:key"] ──► fast ─miss─► medium ─miss─► slow ─miss─► None
//!                                      │hit         │hit           │hit
//!                                      ▼            └──── spawn promote ──► fast
//!                                    value
//!
//! set(key) ──► TierSelector ──► [dedup "set:key"] ──► [write batch] ──► tier.set
//!                                                                          │
//!                                                   SyncEvent::Set ◄───────┘
//! ```
//!
//! Tier read errors count as a miss for that tier. Tier write errors reach
//! the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::{join_all, try_join_all};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::entry::EntryOptions;
use super::memory::{EvictionListener, MemoryTier};
use super::persistent::{InMemoryBackend, PersistentTier, StorageBackend};
use super::policy::TierSelector;
use super::stats::{CacheStats, RequestStats};
use super::sync::{SyncEvent, SyncEventKind, SyncHub, SyncSource, SyncSubscription};
use super::tier::{millis, CacheTier, KeyPattern, TierName, TierStatsRecorder};
use crate::batch::{BatchConfig, BatchProcessor, BatchStats};
use crate::config::CacheConfig;
use crate::cost::CostTracker;
use crate::dedup::{Deduplicator, DeduplicatorStats};
use crate::error::{Error, Result};

/// Buffered sync events per broadcast receiver
const SYNC_CHANNEL_CAPACITY: usize = 1024;

type Tiers = BTreeMap<TierName, Arc<dyn CacheTier>>;

// =============================================================================
// Options
// =============================================================================

/// Domain tag attached to a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Blockchain,
    Semantic,
    Transaction,
    Token,
    Generic,
}

impl Strategy {
    /// Writes with this tag are recorded by the cost tracker
    pub fn is_billable(&self) -> bool {
        matches!(self, Strategy::Blockchain)
    }
}

/// Read options. The default probes every tier without coalescing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Probe only this tier
    pub tier: Option<TierName>,
    /// Coalesce concurrent identical probes
    pub deduplicate: bool,
}

/// Write options. The default writes directly into the tier chosen by the
/// selector with that tier's TTL.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    /// Force a tier
    pub tier: Option<TierName>,
    /// Entry TTL; also drives tier selection
    pub ttl: Option<Duration>,
    pub immutable: bool,
    /// Coalesce concurrent writes of the same key
    pub deduplicate: bool,
    /// Route through the write batch processor
    pub batch: bool,
    pub strategy: Option<Strategy>,
    /// Method name for cost tracking
    pub cost_method: Option<String>,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }

    pub fn in_tier(tier: TierName) -> Self {
        Self {
            tier: Some(tier),
            ..Default::default()
        }
    }

    /// Tag the write as billable under `method`
    pub fn billable(mut self, method: impl Into<String>) -> Self {
        self.strategy = Some(Strategy::Blockchain);
        self.cost_method = Some(method.into());
        self
    }

    pub fn entry_options(&self) -> EntryOptions {
        EntryOptions {
            ttl: self.ttl,
            immutable: self.immutable,
        }
    }

    fn is_billable(&self) -> bool {
        self.strategy.is_some_and(|s| s.is_billable())
    }
}

// =============================================================================
// Write Batching
// =============================================================================

#[derive(Debug, Clone)]
struct WriteRequest {
    key: String,
    value: Bytes,
    tier: TierName,
    options: EntryOptions,
}

/// Per-item result of a batched write; one failing write does not fail its
/// neighbours
type WriteOutcome = std::result::Result<(), Arc<Error>>;

fn write_processor(tiers: Arc<Tiers>, config: BatchConfig) -> BatchProcessor<WriteRequest, WriteOutcome> {
    BatchProcessor::new(config, move |batch: Vec<WriteRequest>| {
        let tiers = Arc::clone(&tiers);
        async move {
            let size = batch.len();
            let writes = batch.into_iter().map(|req| {
                let tiers = Arc::clone(&tiers);
                async move {
                    match tiers.get(&req.tier) {
                        Some(tier) => tier.set(&req.key, req.value, req.options).await.map_err(Arc::new),
                        None => Err(Arc::new(Error::TierNotConfigured(req.tier))),
                    }
                }
            });
            let outcomes = join_all(writes).await;
            debug!(size, "Wrote batch");
            Ok(outcomes)
        }
    })
}

// =============================================================================
// Manager
// =============================================================================

struct Inner {
    id: Uuid,
    config: CacheConfig,
    tiers: Arc<Tiers>,
    selector: TierSelector,
    get_dedup: Deduplicator<Option<(TierName, Bytes)>>,
    set_dedup: Deduplicator<()>,
    fetch_dedup: Deduplicator<Bytes>,
    writer: Option<BatchProcessor<WriteRequest, WriteOutcome>>,
    cost: Option<Arc<CostTracker>>,
    sync: SyncHub,
    requests: TierStatsRecorder,
}

/// Multi-tier cache front end. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheManager")
            .field("id", &self.inner.id)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    /// Manager over the reference tiers described by `config`
    pub fn new(config: CacheConfig) -> Result<Self> {
        Self::builder().config(config).with_default_tiers().build()
    }

    pub fn builder() -> CacheManagerBuilder {
        CacheManagerBuilder::default()
    }

    /// Instance id stamped on emitted sync events
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn tier(&self, name: TierName) -> Option<Arc<dyn CacheTier>> {
        self.inner.tiers.get(&name).cloned()
    }

    /// Registered tiers, fastest first
    pub fn tier_names(&self) -> Vec<TierName> {
        self.inner.tiers.keys().copied().collect()
    }

    pub fn cost_tracker(&self) -> Option<&Arc<CostTracker>> {
        self.inner.cost.as_ref()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    #[instrument(skip(self), fields(tier = ?options.tier))]
    pub async fn get(&self, key: &str, options: GetOptions) -> Result<Option<Bytes>> {
        let start = Instant::now();
        if let Some(tier) = options.tier {
            if !self.inner.tiers.contains_key(&tier) {
                return Err(Error::TierNotConfigured(tier));
            }
        }

        let found = if options.deduplicate && self.inner.config.dedupe.enabled {
            let inner = Arc::clone(&self.inner);
            let owned = key.to_string();
            let only = options.tier;
            self.inner
                .get_dedup
                .execute(
                    &format!("get:{}", key),
                    move || async move { Ok(inner.probe(&owned, only).await) },
                    Some(Duration::ZERO),
                )
                .await?
        } else {
            self.inner.probe(key, options.tier).await
        };

        match found {
            Some((tier, value)) => {
                self.inner.requests.record_hit(start.elapsed());
                debug!(tier = %tier, "Cache hit");
                Ok(Some(value))
            }
            None => {
                self.inner.requests.record_miss(start.elapsed());
                Ok(None)
            }
        }
    }

    /// True when any tier holds a live entry for `key`
    pub async fn has(&self, key: &str) -> Result<bool> {
        for (name, tier) in self.inner.tiers.iter() {
            match tier.has(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => warn!(tier = %name, key, error = %e, "Tier lookup failed, treating as absent"),
            }
        }
        Ok(false)
    }

    /// Concurrent reads, results in key order
    pub async fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Option<Bytes>>> {
        try_join_all(keys.iter().map(|k| self.get(k.as_ref(), GetOptions::default()))).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key, GetOptions::default()).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Cache-aside read.
    ///
    /// On a miss `fetch` runs at most once per key across concurrent callers;
    /// its value is stored with `options` and returned. A failed store is
    /// logged and the fetched value is still returned.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, options: SetOptions, fetch: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        if let Some(value) = self.get(key, GetOptions::default()).await? {
            if let (Some(cost), Some(method)) = (&self.inner.cost, &options.cost_method) {
                cost.track_call(method, true, 0.0);
            }
            return Ok(value);
        }

        let tier = self.inner.selector.select(options.tier, options.ttl)?;
        let inner = Arc::clone(&self.inner);
        let owned = key.to_string();
        let load = move || async move {
            let start = Instant::now();
            let value = fetch().await?;
            if let (Some(cost), Some(method)) = (&inner.cost, &options.cost_method) {
                cost.track_call(method, false, millis(start.elapsed()));
            }
            if let Err(e) = inner.commit(owned.clone(), value.clone(), tier, &options, false).await {
                warn!(key = %owned, tier = %tier, error = %e, "Failed to store fetched value");
            }
            Ok(value)
        };

        if self.inner.config.dedupe.enabled {
            self.inner
                .fetch_dedup
                .execute(&format!("fetch:{}", key), load, None)
                .await
        } else {
            load().await
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    #[instrument(skip(self, value, options), fields(size = value.len(), tier = ?options.tier))]
    pub async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> Result<()> {
        let tier = self.inner.selector.select(options.tier, options.ttl)?;
        self.inner.fetch_dedup.clear_key(&format!("fetch:{}", key));

        if options.deduplicate && self.inner.config.dedupe.enabled {
            let inner = Arc::clone(&self.inner);
            let owned = key.to_string();
            return self
                .inner
                .set_dedup
                .execute(
                    &format!("set:{}", key),
                    move || async move { inner.commit(owned, value, tier, &options, true).await },
                    Some(Duration::ZERO),
                )
                .await;
        }

        self.inner.commit(key.to_string(), value, tier, &options, true).await
    }

    /// Write every entry with the same options; `batch` routes them through
    /// the write batch processor
    pub async fn set_many(&self, entries: Vec<(String, Bytes)>, options: SetOptions) -> Result<()> {
        let count = entries.len();
        try_join_all(entries.into_iter().map(|(key, value)| {
            let options = options.clone();
            async move { self.set(&key, value, options).await }
        }))
        .await?;
        debug!(count, batched = options.batch, "Stored entries");
        Ok(())
    }

    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: SetOptions) -> Result<()> {
        let raw = Bytes::from(serde_json::to_vec(value)?);
        self.set(key, raw, options).await
    }

    /// Remove `key` from every tier. Returns true if any tier had it.
    #[instrument(skip(self))]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let deleted = self.inner.delete_everywhere(key).await?;
        if deleted {
            self.inner.emit(SyncEventKind::Delete { key: key.to_string() });
        }
        Ok(deleted)
    }

    /// Empty every tier and reset deduplicators, queued writes and stats
    #[instrument(skip(self))]
    pub async fn clear(&self) -> Result<()> {
        let cleared = self.inner.clear_tiers().await;
        self.inner.reset_state();
        if let Some(writer) = &self.inner.writer {
            writer.clear();
            writer.reset_stats();
        }
        if let Some(cost) = &self.inner.cost {
            cost.reset();
        }
        cleared?;

        info!("Cache cleared");
        self.inner.emit(SyncEventKind::Clear);
        Ok(())
    }

    /// Wait for queued batched writes
    pub async fn flush_writes(&self) {
        if let Some(writer) = &self.inner.writer {
            writer.flush().await;
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Distinct live keys across tiers, sorted
    pub async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        // Surface a bad pattern once instead of per tier
        KeyPattern::compile(pattern)?;

        let mut all = BTreeSet::new();
        for (name, tier) in self.inner.tiers.iter() {
            match tier.keys(pattern).await {
                Ok(keys) => all.extend(keys),
                Err(e) => warn!(tier = %name, error = %e, "Failed to list tier keys"),
            }
        }
        Ok(all.into_iter().collect())
    }

    /// Stored bytes across tiers
    pub async fn size(&self) -> Result<u64> {
        let mut total = 0;
        for tier in self.inner.tiers.values() {
            total += tier.size().await?;
        }
        Ok(total)
    }

    pub fn stats(&self) -> CacheStats {
        let tiers = self.inner.tiers.iter().map(|(name, tier)| (*name, tier.stats()));
        let requests = RequestStats::from(self.inner.requests.snapshot(0, 0));
        let savings = self.inner.cost.as_ref().map_or(0.0, |c| c.total_savings());
        CacheStats::aggregate(tiers, requests, savings)
    }

    /// Stats of the read, write and fetch deduplicators
    pub fn dedup_stats(&self) -> BTreeMap<&'static str, DeduplicatorStats> {
        BTreeMap::from([
            ("get", self.inner.get_dedup.stats()),
            ("set", self.inner.set_dedup.stats()),
            ("fetch", self.inner.fetch_dedup.stats()),
        ])
    }

    /// Write batch processor stats, when batching is enabled
    pub fn batch_stats(&self) -> Option<BatchStats> {
        self.inner.writer.as_ref().map(|w| w.stats())
    }

    // =========================================================================
    // Sync
    // =========================================================================

    /// Call `listener` for every local change and every applied remote one
    pub fn on_sync<F>(&self, listener: F) -> SyncSubscription
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.inner.sync.subscribe(listener)
    }

    /// Async stream of the same events `on_sync` listeners see
    pub fn sync_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.sync.receiver()
    }

    /// Apply another instance's change locally without re-emitting it as a
    /// local one. Events from this instance are ignored; returns whether the
    /// event was applied.
    #[instrument(skip(self, event), fields(event_type = event.event_type(), origin = %event.origin))]
    pub async fn apply_remote(&self, mut event: SyncEvent) -> Result<bool> {
        if event.origin == self.inner.id {
            debug!("Ignoring own sync event");
            return Ok(false);
        }

        match &event.kind {
            SyncEventKind::Set { key, value } => {
                let tier = self.inner.selector.select(None, None)?;
                let target = self.inner.tier(tier)?;
                target.set(key, value.clone(), EntryOptions::default()).await?;
                self.inner.fetch_dedup.clear_key(&format!("fetch:{}", key));
            }
            SyncEventKind::Delete { key } => {
                self.inner.delete_everywhere(key).await?;
            }
            SyncEventKind::Clear => {
                self.inner.clear_tiers().await?;
                self.inner.reset_state();
            }
        }

        event.source = SyncSource::Remote;
        if self.inner.config.enable_sync {
            self.inner.sync.emit(event);
        }
        Ok(true)
    }
}

impl Inner {
    fn tier(&self, name: TierName) -> Result<&Arc<dyn CacheTier>> {
        self.tiers.get(&name).ok_or(Error::TierNotConfigured(name))
    }

    /// First hit in probe order. Spawns promotion for lower-tier hits of an
    /// unrestricted probe.
    async fn probe(&self, key: &str, only: Option<TierName>) -> Option<(TierName, Bytes)> {
        for (name, tier) in self.tiers.iter() {
            if only.is_some_and(|t| t != *name) {
                continue;
            }
            match tier.get(key).await {
                Ok(Some(value)) => {
                    if only.is_none() {
                        self.promote(key, *name, &value);
                    }
                    return Some((*name, value));
                }
                Ok(None) => {}
                Err(e) => warn!(tier = %name, key, error = %e, "Tier read failed, treating as miss"),
            }
        }
        None
    }

    fn promote(&self, key: &str, from: TierName, value: &Bytes) {
        if !self.config.auto_tiering || from == TierName::Fast {
            return;
        }
        let Some(fast) = self.tiers.get(&TierName::Fast).cloned() else {
            return;
        };

        let key = key.to_string();
        let value = value.clone();
        tokio::spawn(async move {
            match fast.set(&key, value, EntryOptions::default()).await {
                Ok(()) => debug!(key = %key, from = %from, "Promoted to fast tier"),
                Err(e) => warn!(key = %key, from = %from, error = %e, "Promotion failed"),
            }
        });
    }

    /// Write into `tier`, batched or direct, then emit and account
    async fn commit(&self, key: String, value: Bytes, tier: TierName, options: &SetOptions, track: bool) -> Result<()> {
        let entry = options.entry_options();

        match &self.writer {
            Some(writer) if options.batch => {
                let request = WriteRequest {
                    key: key.clone(),
                    value: value.clone(),
                    tier,
                    options: entry,
                };
                writer
                    .add(request)
                    .await?
                    .map_err(|source| Error::OperationFailed {
                        key: key.clone(),
                        source,
                    })?;
            }
            _ => {
                self.tier(tier)?.set(&key, value.clone(), entry).await?;
            }
        }

        if track && options.is_billable() {
            if let Some(cost) = &self.cost {
                cost.track_call(options.cost_method.as_deref().unwrap_or(&key), true, 0.0);
            }
        }
        self.emit(SyncEventKind::Set { key, value });
        Ok(())
    }

    /// Delete from every tier; the first error is returned after all tiers
    /// were tried
    async fn delete_everywhere(&self, key: &str) -> Result<bool> {
        let mut deleted = false;
        let mut first_error = None;
        for (name, tier) in self.tiers.iter() {
            match tier.delete(key).await {
                Ok(hit) => deleted |= hit,
                Err(e) => {
                    warn!(tier = %name, key, error = %e, "Tier delete failed");
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        self.fetch_dedup.clear_key(&format!("fetch:{}", key));

        match first_error {
            Some(e) => Err(e),
            None => Ok(deleted),
        }
    }

    async fn clear_tiers(&self) -> Result<()> {
        let mut first_error = None;
        for (name, tier) in self.tiers.iter() {
            if let Err(e) = tier.clear().await {
                warn!(tier = %name, error = %e, "Tier clear failed");
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn reset_state(&self) {
        self.get_dedup.clear();
        self.set_dedup.clear();
        self.fetch_dedup.clear();
        self.get_dedup.reset_stats();
        self.set_dedup.reset_stats();
        self.fetch_dedup.reset_stats();
        self.requests.reset();
    }

    fn emit(&self, kind: SyncEventKind) {
        if self.config.enable_sync {
            self.sync.emit(SyncEvent::local(kind, self.id));
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`CacheManager`] from a config plus optional custom tiers
#[derive(Default)]
pub struct CacheManagerBuilder {
    config: CacheConfig,
    tiers: Tiers,
    default_tiers: bool,
    eviction_listener: Option<Arc<dyn EvictionListener>>,
    cost: Option<Arc<CostTracker>>,
}

impl CacheManagerBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a tier under its own name, replacing any previous one
    pub fn tier(mut self, tier: Arc<dyn CacheTier>) -> Self {
        self.tiers.insert(tier.name(), tier);
        self
    }

    /// Fill every unregistered slot with the reference tier for it
    pub fn with_default_tiers(mut self) -> Self {
        self.default_tiers = true;
        self
    }

    /// Listener for the default fast tier's evictions
    pub fn eviction_listener(mut self, listener: Arc<dyn EvictionListener>) -> Self {
        self.eviction_listener = Some(listener);
        self
    }

    /// Share a cost tracker instead of creating one
    pub fn cost_tracker(mut self, tracker: Arc<CostTracker>) -> Self {
        self.cost = Some(tracker);
        self
    }

    pub fn build(self) -> Result<CacheManager> {
        let CacheManagerBuilder {
            config,
            mut tiers,
            default_tiers,
            eviction_listener,
            cost,
        } = self;
        config.validate()?;

        if default_tiers {
            tiers.entry(TierName::Fast).or_insert_with(|| {
                let memory = MemoryTier::with_config(config.memory_tier());
                let memory = match eviction_listener {
                    Some(listener) => memory.with_eviction_listener(listener),
                    None => memory,
                };
                Arc::new(memory) as Arc<dyn CacheTier>
            });
            tiers.entry(TierName::Medium).or_insert_with(|| {
                let backend = backend(config.tiers.medium.max_bytes);
                Arc::new(PersistentTier::new(config.medium_tier(), backend)) as Arc<dyn CacheTier>
            });
            tiers.entry(TierName::Slow).or_insert_with(|| {
                let backend = backend(config.tiers.slow.max_bytes);
                Arc::new(PersistentTier::new(config.slow_tier(), backend)) as Arc<dyn CacheTier>
            });
        }
        if tiers.is_empty() {
            return Err(Error::Config("no cache tiers registered".into()));
        }

        let mut selector = TierSelector::new();
        for (name, tier) in tiers.iter() {
            selector.register(*name, tier.default_ttl());
        }

        let tiers = Arc::new(tiers);
        let writer = config
            .batch
            .enabled
            .then(|| write_processor(Arc::clone(&tiers), config.batch.processor_config()));
        let cost = config
            .enable_metrics
            .then(|| cost.unwrap_or_else(|| Arc::new(CostTracker::new())));
        let dedup_config = config.dedupe.deduplicator_config();

        let id = Uuid::new_v4();
        info!(
            %id,
            tiers = ?tiers.keys().collect::<Vec<_>>(),
            batching = writer.is_some(),
            auto_tiering = config.auto_tiering,
            "Cache manager ready"
        );

        Ok(CacheManager {
            inner: Arc::new(Inner {
                id,
                tiers,
                selector,
                get_dedup: Deduplicator::with_config(dedup_config.clone()),
                set_dedup: Deduplicator::with_config(dedup_config.clone()),
                fetch_dedup: Deduplicator::with_config(dedup_config),
                writer,
                cost,
                sync: SyncHub::new(SYNC_CHANNEL_CAPACITY),
                requests: TierStatsRecorder::new(),
                config,
            }),
        })
    }
}

fn backend(quota: Option<u64>) -> Arc<dyn StorageBackend> {
    match quota {
        Some(quota) => Arc::new(InMemoryBackend::with_quota(quota)),
        None => Arc::new(InMemoryBackend::new()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> CacheManager {
        CacheManager::new(CacheConfig::default()).unwrap()
    }

    fn bytes(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[tokio::test]
    async fn test_set_get_defaults_to_fast() {
        let cache = manager();
        cache.set("eth:1:block", bytes("0x10"), SetOptions::default()).await.unwrap();

        assert_eq!(cache.get("eth:1:block", GetOptions::default()).await.unwrap(), Some(bytes("0x10")));
        let fast = cache.tier(TierName::Fast).unwrap();
        assert!(fast.has("eth:1:block").await.unwrap());
        assert_eq!(cache.stats().requests.hits, 1);
    }

    #[tokio::test]
    async fn test_ttl_selects_tier() {
        let cache = manager();
        // Ceilings: fast 5 min, medium 30 min, slow 24 h
        cache.set("a", bytes("1"), SetOptions::with_ttl(Duration::from_secs(60))).await.unwrap();
        cache.set("b", bytes("2"), SetOptions::with_ttl(Duration::from_secs(20 * 60))).await.unwrap();
        cache.set("c", bytes("3"), SetOptions::with_ttl(Duration::from_secs(7 * 86_400))).await.unwrap();

        let held = |tier| cache.tier(tier).unwrap();
        assert!(held(TierName::Fast).has("a").await.unwrap());
        assert!(held(TierName::Medium).has("b").await.unwrap());
        assert!(!held(TierName::Fast).has("b").await.unwrap());
        assert!(held(TierName::Slow).has("c").await.unwrap());
    }

    #[tokio::test]
    async fn test_explicit_unregistered_tier() {
        let cache = CacheManager::builder()
            .tier(Arc::new(MemoryTier::new()))
            .build()
            .unwrap();

        assert_matches!(
            cache.set("k", bytes("v"), SetOptions::in_tier(TierName::Slow)).await,
            Err(Error::TierNotConfigured(TierName::Slow))
        );
        assert_matches!(
            cache
                .get("k", GetOptions { tier: Some(TierName::Medium), deduplicate: false })
                .await,
            Err(Error::TierNotConfigured(TierName::Medium))
        );
    }

    #[tokio::test]
    async fn test_builder_requires_a_tier() {
        assert_matches!(CacheManager::builder().build(), Err(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_promotion_from_slow() {
        let cache = manager();
        cache.set("cold", bytes("v"), SetOptions::in_tier(TierName::Slow)).await.unwrap();

        assert_eq!(cache.get("cold", GetOptions::default()).await.unwrap(), Some(bytes("v")));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(cache.tier(TierName::Fast).unwrap().has("cold").await.unwrap());
    }

    #[tokio::test]
    async fn test_no_promotion_without_auto_tiering() {
        let config = CacheConfig {
            auto_tiering: false,
            ..Default::default()
        };
        let cache = CacheManager::new(config).unwrap();
        cache.set("cold", bytes("v"), SetOptions::in_tier(TierName::Medium)).await.unwrap();

        cache.get("cold", GetOptions::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!cache.tier(TierName::Fast).unwrap().has("cold").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_fans_out() {
        let cache = manager();
        cache.set("k", bytes("1"), SetOptions::in_tier(TierName::Fast)).await.unwrap();
        cache.set("k", bytes("2"), SetOptions::in_tier(TierName::Slow)).await.unwrap();

        assert!(cache.delete("k").await.unwrap());
        assert!(!cache.has("k").await.unwrap());
        assert!(!cache.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_union_and_pattern() {
        let cache = manager();
        cache.set("eth:1:a", bytes("1"), SetOptions::in_tier(TierName::Fast)).await.unwrap();
        cache.set("eth:1:a", bytes("1"), SetOptions::in_tier(TierName::Medium)).await.unwrap();
        cache.set("eth:137:b", bytes("2"), SetOptions::in_tier(TierName::Slow)).await.unwrap();

        assert_eq!(cache.keys(None).await.unwrap(), vec!["eth:137:b", "eth:1:a"]);
        assert_eq!(cache.keys(Some("eth:1:*")).await.unwrap(), vec!["eth:1:a"]);
    }

    #[tokio::test]
    async fn test_get_many_and_set_many_batched() {
        let cache = manager();
        let entries = (0..5).map(|i| (format!("k{}", i), Bytes::from(vec![i as u8]))).collect();
        cache
            .set_many(entries, SetOptions { batch: true, ..Default::default() })
            .await
            .unwrap();

        let values = cache.get_many(&["k0", "k4", "missing"]).await.unwrap();
        assert_eq!(values, vec![Some(Bytes::from(vec![0])), Some(Bytes::from(vec![4])), None]);

        let batch = cache.batch_stats().unwrap();
        assert_eq!(batch.total_items, 5);
        assert!(batch.total_batches >= 1);
    }

    #[tokio::test]
    async fn test_deduplicated_set() {
        let cache = manager();
        let (a, b) = tokio::join!(
            cache.set("k", bytes("v"), SetOptions { deduplicate: true, ..Default::default() }),
            cache.set("k", bytes("v"), SetOptions { deduplicate: true, ..Default::default() }),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(cache.dedup_stats()["set"].total_requests, 2);
    }

    #[tokio::test]
    async fn test_json_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Balance {
            address: String,
            wei: u128,
        }

        let cache = manager();
        let balance = Balance {
            address: "0xabc".into(),
            wei: 10u128.pow(18),
        };
        cache.set_json("balance:0xabc", &balance, SetOptions::default()).await.unwrap();

        assert_eq!(cache.get_json::<Balance>("balance:0xabc").await.unwrap(), Some(balance));
        assert_eq!(cache.get_json::<Balance>("balance:0xdef").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sync_events() {
        let cache = manager();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = cache.on_sync(move |e| sink.lock().push((e.event_type(), e.source)));

        cache.set("k", bytes("v"), SetOptions::default()).await.unwrap();
        cache.delete("k").await.unwrap();
        cache.delete("k").await.unwrap();
        cache.clear().await.unwrap();

        assert_eq!(
            *seen.lock(),
            vec![
                ("set", SyncSource::Local),
                ("delete", SyncSource::Local),
                ("clear", SyncSource::Local)
            ]
        );

        sub.unsubscribe();
        cache.set("k", bytes("v"), SetOptions::default()).await.unwrap();
        assert_eq!(seen.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_apply_remote() {
        let a = manager();
        let b = manager();
        let mut events = a.sync_events();

        a.set("shared", bytes("v"), SetOptions::default()).await.unwrap();
        let event = events.recv().await.unwrap();

        let remote_seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&remote_seen);
        let _sub = b.on_sync(move |e| {
            assert_eq!(e.source, SyncSource::Remote);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(b.apply_remote(event.clone()).await.unwrap());
        assert_eq!(b.get("shared", GetOptions::default()).await.unwrap(), Some(bytes("v")));
        assert_eq!(remote_seen.load(Ordering::SeqCst), 1);

        // Echo back to the originator is ignored
        assert!(!a.apply_remote(event).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_or_fetch() {
        let cache = manager();
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Bytes::from_static(b"0x1234"))
            }
        };

        let options = SetOptions::default().billable("eth_getBalance");
        let (a, b) = tokio::join!(
            cache.get_or_fetch("bal", options.clone(), fetch(Arc::clone(&calls))),
            cache.get_or_fetch("bal", options.clone(), fetch(Arc::clone(&calls))),
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let again = cache.get_or_fetch("bal", options, fetch(Arc::clone(&calls))).await.unwrap();
        assert_eq!(again, Bytes::from_static(b"0x1234"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let metrics = cache.cost_tracker().unwrap().method_metrics("eth_getBalance").unwrap();
        assert_eq!(metrics.calls - metrics.cached_calls, 1);
        assert!(metrics.cached_calls >= 1);
    }

    #[tokio::test]
    async fn test_get_or_fetch_error_not_cached() {
        let cache = manager();
        let err = cache
            .get_or_fetch("k", SetOptions::default(), || async {
                Err(Error::Internal("rpc down".into()))
            })
            .await
            .unwrap_err();
        assert_matches!(err.root(), Error::Internal(_));

        let ok = cache
            .get_or_fetch("k", SetOptions::default(), || async { Ok(Bytes::from_static(b"up")) })
            .await
            .unwrap();
        assert_eq!(ok, Bytes::from_static(b"up"));
    }

    #[tokio::test]
    async fn test_billable_set_tracks_savings() {
        let cache = manager();
        cache
            .set("block", bytes("0x10"), SetOptions::default().billable("eth_blockNumber"))
            .await
            .unwrap();
        assert!(cache.stats().total_savings > 0.0);
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let cache = manager();
        cache.set("a", bytes("1"), SetOptions::in_tier(TierName::Medium)).await.unwrap();
        cache.get("a", GetOptions::default()).await.unwrap();
        cache.get("b", GetOptions::default()).await.unwrap();
        // Let the promotion of "a" land before clearing
        tokio::time::sleep(Duration::from_millis(20)).await;

        for _ in 0..2 {
            cache.clear().await.unwrap();
            let stats = cache.stats();
            assert_eq!(stats.hits, 0);
            assert_eq!(stats.misses, 0);
            assert_eq!(stats.item_count, 0);
            assert_eq!(stats.requests, RequestStats::default());
            assert_eq!(cache.size().await.unwrap(), 0);
        }
    }
}
