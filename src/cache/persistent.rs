//! Medium/Slow Tiers - Record Store over a Storage Backend
//!
//! Durable tiers store each entry as one framed record (metadata header plus
//! payload) in a pluggable [`StorageBackend`]. The slow tier compresses
//! payloads above a threshold with LZ4.
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────┬───────────┬───────┬────────────┬────────────┬──────────┬─────────┐
//! │ version │ algorithm │ flags │ created_at │ expires_at │ raw_size │ payload │
//! │   u8    │    u8     │  u8   │    u64     │    u64     │   u64    │   ...   │
//! └─────────┴───────────┴───────┴────────────┴────────────┴──────────┴─────────┘
//! ```
//!
//! Records are written only by `set`. Reads never write back, so a read racing
//! a `set`, `delete` or `clear` cannot resurrect or revert the key. Hit counts
//! and last access times live in an in-process [`AccessInfo`] ledger instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use tracing::{debug, warn};

use super::compression::{CompressionAlgorithm, CompressionConfig, CompressionManager};
use super::entry::{now_millis, EntryMetadata, EntryOptions};
use super::tier::{CacheTier, KeyPattern, TierName, TierStats, TierStatsRecorder};
use super::{DEFAULT_MEDIUM_TTL, DEFAULT_SLOW_TTL};
use crate::error::{Error, Result};

// =============================================================================
// Storage Backend
// =============================================================================

/// Key/value store holding encoded records
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Store a record; fails with [`Error::QuotaExceeded`] when full
    async fn put(&self, key: &str, record: Bytes) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn keys(&self) -> Result<Vec<String>>;

    async fn clear(&self) -> Result<()>;

    /// Number of stored records
    fn len(&self) -> usize;

    /// Bytes held by stored records
    fn used_bytes(&self) -> u64;
}

/// DashMap-backed store with an optional byte quota
pub struct InMemoryBackend {
    records: DashMap<String, Bytes>,
    quota: Option<u64>,
    total_bytes: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            records: DashMap::new(),
            quota: None,
            total_bytes: AtomicU64::new(0),
        }
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new()
        }
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.records.get(key).map(|r| r.value().clone()))
    }

    async fn put(&self, key: &str, record: Bytes) -> Result<()> {
        let size = record.len() as u64;

        if let Some(quota) = self.quota {
            let replaced = self.records.get(key).map_or(0, |r| r.len() as u64);
            let projected = self.total_bytes.load(Ordering::Relaxed).saturating_sub(replaced) + size;
            if projected > quota {
                return Err(Error::QuotaExceeded {
                    requested: size,
                    quota,
                });
            }
        }

        self.total_bytes.fetch_add(size, Ordering::Relaxed);
        if let Some(old) = self.records.insert(key.to_string(), record) {
            self.total_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        match self.records.remove(key) {
            Some((_, old)) => {
                self.total_bytes.fetch_sub(old.len() as u64, Ordering::Relaxed);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.iter().map(|r| r.key().clone()).collect())
    }

    async fn clear(&self) -> Result<()> {
        self.records.clear();
        self.total_bytes.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    fn used_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }
}

// =============================================================================
// Record Framing
// =============================================================================

const RECORD_VERSION: u8 = 2;
const FLAG_IMMUTABLE: u8 = 0b0000_0001;
const HEADER_LEN: usize = 3 + 3 * 8;

struct Record {
    metadata: EntryMetadata,
    algorithm: CompressionAlgorithm,
    /// Stored (possibly compressed) payload
    payload: Bytes,
}

impl Record {
    fn encode(&self) -> Bytes {
        let m = &self.metadata;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(RECORD_VERSION);
        buf.put_u8(self.algorithm.tag());
        buf.put_u8(if m.is_immutable() { FLAG_IMMUTABLE } else { 0 });
        buf.put_u64(m.created_at());
        buf.put_u64(m.expires_at());
        buf.put_u64(m.size());
        buf.put_slice(&self.payload);
        buf.freeze()
    }

    fn decode(key: &str, mut raw: Bytes) -> Result<Self> {
        let corrupted = |reason: String| Error::Corrupted {
            key: key.to_string(),
            reason,
        };

        if raw.len() < HEADER_LEN {
            return Err(corrupted(format!("record of {} bytes is shorter than header", raw.len())));
        }
        let version = raw.get_u8();
        if version != RECORD_VERSION {
            return Err(corrupted(format!("unsupported record version {}", version)));
        }
        let tag = raw.get_u8();
        let algorithm = CompressionAlgorithm::from_tag(tag)
            .ok_or_else(|| corrupted(format!("unknown compression tag {}", tag)))?;
        let flags = raw.get_u8();
        let created_at = raw.get_u64();
        let expires_at = raw.get_u64();
        let size = raw.get_u64();

        Ok(Self {
            metadata: EntryMetadata::restore(size, created_at, expires_at, 0, created_at, flags & FLAG_IMMUTABLE != 0),
            algorithm,
            payload: raw,
        })
    }
}

// =============================================================================
// Persistent Tier
// =============================================================================

/// Persistent tier configuration
#[derive(Debug, Clone)]
pub struct PersistentTierConfig {
    pub name: TierName,
    /// Default TTL (also this tier's TTL ceiling)
    pub ttl: Duration,
    pub max_entries: usize,
    pub compression: CompressionConfig,
}

impl PersistentTierConfig {
    /// Durable, uncompressed
    pub fn medium() -> Self {
        Self {
            name: TierName::Medium,
            ttl: DEFAULT_MEDIUM_TTL,
            max_entries: 10_000,
            compression: CompressionConfig::disabled(),
        }
    }

    /// Durable, LZ4 above the threshold
    pub fn slow() -> Self {
        Self {
            name: TierName::Slow,
            ttl: DEFAULT_SLOW_TTL,
            max_entries: 100_000,
            compression: CompressionConfig::default(),
        }
    }
}

/// Reads of one key since it was last written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessInfo {
    pub hit_count: u64,
    /// Epoch milliseconds
    pub last_accessed_at: u64,
}

pub struct PersistentTier {
    config: PersistentTierConfig,
    backend: Arc<dyn StorageBackend>,
    compression: CompressionManager,
    access: DashMap<String, AccessInfo>,
    stats: TierStatsRecorder,
}

impl PersistentTier {
    pub fn new(config: PersistentTierConfig, backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            compression: CompressionManager::with_config(config.compression.clone()),
            config,
            backend,
            access: DashMap::new(),
            stats: TierStatsRecorder::new(),
        }
    }

    /// Tier over a fresh [`InMemoryBackend`]
    pub fn in_memory(config: PersistentTierConfig) -> Self {
        Self::new(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn config(&self) -> &PersistentTierConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    /// Hits on `key` since its last write, if it was read at all
    pub fn access(&self, key: &str) -> Option<AccessInfo> {
        self.access.get(key).map(|a| *a)
    }

    fn record_access(&self, key: &str) {
        let now = now_millis();
        self.access
            .entry(key.to_string())
            .and_modify(|a| {
                a.hit_count += 1;
                a.last_accessed_at = now;
            })
            .or_insert(AccessInfo {
                hit_count: 1,
                last_accessed_at: now,
            });
    }

    async fn load(&self, key: &str) -> Result<Option<Record>> {
        let raw = self.backend.get(key).await.map_err(|e| Error::TierUnavailable {
            tier: self.config.name,
            reason: e.to_string(),
        })?;
        match raw {
            Some(raw) => match Record::decode(key, raw) {
                Ok(record) => Ok(Some(record)),
                Err(e) => {
                    warn!(tier = %self.config.name, key, error = %e, "Dropping corrupted record");
                    self.backend.delete(key).await?;
                    Err(e)
                }
            },
            None => Ok(None),
        }
    }

    /// Headers of every decodable record
    async fn scan(&self) -> Result<Vec<(String, EntryMetadata)>> {
        let mut out = Vec::new();
        for key in self.backend.keys().await? {
            if let Some(raw) = self.backend.get(&key).await? {
                if let Ok(record) = Record::decode(&key, raw) {
                    out.push((key, record.metadata));
                }
            }
        }
        Ok(out)
    }

    /// Evict the entry closest to expiry, mutable ones first
    async fn evict_one(&self, keep: &str) -> Result<bool> {
        let victim = self
            .scan()
            .await?
            .into_iter()
            .filter(|(k, _)| k != keep)
            .min_by_key(|(_, m)| (m.is_immutable(), m.expires_at()));

        match victim {
            Some((key, _)) => {
                let removed = self.backend.delete(&key).await?;
                if removed {
                    self.access.remove(&key);
                    self.stats.record_evictions(1);
                    debug!(tier = %self.config.name, key = %key, "Evicted entry");
                }
                Ok(removed)
            }
            None => Ok(false),
        }
    }

    /// Delete every expired record, returning how many went
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let now = now_millis();
        let mut removed = 0;
        for (key, meta) in self.scan().await? {
            if meta.is_expired_at(now) && self.backend.delete(&key).await? {
                self.access.remove(&key);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(tier = %self.config.name, removed, "Cleaned up expired records");
        }
        Ok(removed)
    }
}

#[async_trait]
impl CacheTier for PersistentTier {
    fn name(&self) -> TierName {
        self.config.name
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let start = Instant::now();

        let record = match self.load(key).await? {
            Some(record) if !record.metadata.is_expired() => record,
            Some(_) => {
                self.backend.delete(key).await?;
                self.access.remove(key);
                self.stats.record_miss(start.elapsed());
                return Ok(None);
            }
            None => {
                self.access.remove(key);
                self.stats.record_miss(start.elapsed());
                return Ok(None);
            }
        };

        let value = self
            .compression
            .decompress(&record.payload, record.algorithm)?;

        self.record_access(key);
        self.stats.record_hit(start.elapsed());
        Ok(Some(value))
    }

    async fn set(&self, key: &str, value: Bytes, options: EntryOptions) -> Result<()> {
        let ttl = options.ttl.unwrap_or(self.config.ttl);
        let metadata = EntryMetadata::new(value.len() as u64, ttl, options.immutable);
        let (payload, algorithm) = self.compression.compress(&value);
        let encoded = Record {
            metadata,
            algorithm,
            payload,
        }
        .encode();

        if self.backend.len() >= self.config.max_entries && self.backend.get(key).await?.is_none() {
            self.evict_one(key).await?;
        }

        self.access.remove(key);
        match self.backend.put(key, encoded.clone()).await {
            Err(Error::QuotaExceeded { .. }) => {
                self.evict_one(key).await?;
                self.backend.put(key, encoded).await.map_err(|e| match e {
                    Error::QuotaExceeded { requested, quota } => Error::Capacity {
                        tier: self.config.name,
                        reason: format!("{} byte record does not fit quota of {}", requested, quota),
                    },
                    other => other,
                })
            }
            other => other,
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.access.remove(key);
        self.backend.delete(key).await
    }

    async fn has(&self, key: &str) -> Result<bool> {
        match self.load(key).await? {
            Some(record) if !record.metadata.is_expired() => Ok(true),
            Some(_) => {
                self.backend.delete(key).await?;
                self.access.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>> {
        let pattern = KeyPattern::compile(pattern)?;
        let now = now_millis();
        Ok(self
            .scan()
            .await?
            .into_iter()
            .filter(|(k, m)| !m.is_expired_at(now) && pattern.as_ref().map_or(true, |p| p.matches(k)))
            .map(|(k, _)| k)
            .collect())
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.backend.used_bytes())
    }

    async fn clear(&self) -> Result<()> {
        self.backend.clear().await?;
        self.access.clear();
        self.stats.reset();
        Ok(())
    }

    fn stats(&self) -> TierStats {
        self.stats
            .snapshot(self.backend.used_bytes(), self.backend.len() as u64)
    }

    fn default_ttl(&self) -> Duration {
        self.config.ttl
    }
}

// =============================================================================
// Tests
// =============================================================================
