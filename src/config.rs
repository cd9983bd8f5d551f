//! Engine configuration
//!
//! Loaded from YAML; every field has a default so a partial file (or none at
//! all) is valid. Durations are whole milliseconds.
//!
//! ```yaml
//! tiers:
//!   fast:   { ttl_ms: 300000, max_entries: 1000, max_bytes: 67108864 }
//!   slow:   { ttl_ms: 86400000, max_entries: 100000 }
//! auto_tiering: true
//! compression: { enabled: true, min_size_bytes: 1024, level: 4 }
//! batch: { enabled: true, max_size: 100, max_wait_ms: 100, concurrency: 5 }
//! dedupe: { enabled: true, ttl_ms: 5000 }
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::batch::BatchConfig;
use crate::cache::compression::CompressionConfig;
use crate::cache::{
    EvictionPolicy, MemoryTierConfig, PersistentTierConfig, TierName, DEFAULT_FAST_TTL,
    DEFAULT_MEDIUM_TTL, DEFAULT_SLOW_TTL,
};
use crate::dedup::{DeduplicatorConfig, DEFAULT_CLEANUP_THRESHOLD};
use crate::error::{Error, Result};

/// `Duration` as integer milliseconds, for `#[serde(with = ...)]`
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

// =============================================================================
// Sections
// =============================================================================

/// One tier's limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Default TTL, and the ceiling for TTL-based tier selection
    pub ttl_ms: u64,
    pub max_entries: usize,
    /// Payload byte limit; storage quota for persistent tiers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

impl TierConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    fn validate(&self, tier: TierName) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(Error::Config(format!("tiers.{}.ttl_ms must be positive", tier)));
        }
        if self.max_entries == 0 {
            return Err(Error::Config(format!("tiers.{}.max_entries must be at least 1", tier)));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TiersConfig {
    pub fast: TierConfig,
    pub medium: TierConfig,
    pub slow: TierConfig,
}

impl Default for TiersConfig {
    fn default() -> Self {
        let tier = |ttl: Duration, max_entries| TierConfig {
            ttl_ms: ttl.as_millis() as u64,
            max_entries,
            max_bytes: None,
        };
        Self {
            fast: tier(DEFAULT_FAST_TTL, 1_000),
            medium: tier(DEFAULT_MEDIUM_TTL, 10_000),
            slow: tier(DEFAULT_SLOW_TTL, 100_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSection {
    /// Build the write batch processor used by `set_many`
    pub enabled: bool,
    pub max_size: usize,
    pub max_wait_ms: u64,
    pub concurrency: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            max_wait_ms: 100,
            concurrency: 5,
        }
    }
}

impl BatchSection {
    pub fn processor_config(&self) -> BatchConfig {
        BatchConfig {
            max_batch_size: self.max_size,
            max_wait_time: Duration::from_millis(self.max_wait_ms),
            concurrency: self.concurrency,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeSection {
    pub enabled: bool,
    /// Result reuse window for coalesced reads and fetches
    pub ttl_ms: u64,
    pub cleanup_threshold: usize,
    pub max_results: usize,
}

impl Default for DedupeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5_000,
            cleanup_threshold: DEFAULT_CLEANUP_THRESHOLD,
            max_results: DEFAULT_CLEANUP_THRESHOLD,
        }
    }
}

impl DedupeSection {
    pub fn deduplicator_config(&self) -> DeduplicatorConfig {
        DeduplicatorConfig {
            default_ttl: Duration::from_millis(self.ttl_ms),
            cleanup_threshold: self.cleanup_threshold,
            max_results: self.max_results,
        }
    }
}

// =============================================================================
// Root
// =============================================================================

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub tiers: TiersConfig,
    /// Promote lower-tier hits into the fast tier
    pub auto_tiering: bool,
    /// Emit sync events for local mutations
    pub enable_sync: bool,
    /// Track cost of billable writes and fetches
    pub enable_metrics: bool,
    /// Slow tier payload compression
    pub compression: CompressionConfig,
    pub batch: BatchSection,
    pub dedupe: DedupeSection,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tiers: TiersConfig::default(),
            auto_tiering: true,
            enable_sync: true,
            enable_metrics: true,
            compression: CompressionConfig::default(),
            batch: BatchSection::default(),
            dedupe: DedupeSection::default(),
        }
    }
}

impl CacheConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        debug!(path = %path.display(), "Loaded configuration file");
        Self::from_yaml_str(&raw)
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.tiers.fast.validate(TierName::Fast)?;
        self.tiers.medium.validate(TierName::Medium)?;
        self.tiers.slow.validate(TierName::Slow)?;

        if self.tiers.fast.ttl_ms > self.tiers.medium.ttl_ms
            || self.tiers.medium.ttl_ms > self.tiers.slow.ttl_ms
        {
            return Err(Error::Config(
                "tier TTLs must not decrease from fast to slow".into(),
            ));
        }

        self.batch.processor_config().validate()?;

        if self.dedupe.max_results == 0 {
            return Err(Error::Config("dedupe.max_results must be at least 1".into()));
        }
        Ok(())
    }

    pub fn memory_tier(&self) -> MemoryTierConfig {
        MemoryTierConfig {
            ttl: self.tiers.fast.ttl(),
            max_entries: self.tiers.fast.max_entries,
            max_bytes: self.tiers.fast.max_bytes,
            eviction: EvictionPolicy::lru(),
        }
    }

    pub fn medium_tier(&self) -> PersistentTierConfig {
        PersistentTierConfig {
            ttl: self.tiers.medium.ttl(),
            max_entries: self.tiers.medium.max_entries,
            ..PersistentTierConfig::medium()
        }
    }

    pub fn slow_tier(&self) -> PersistentTierConfig {
        PersistentTierConfig {
            ttl: self.tiers.slow.ttl(),
            max_entries: self.tiers.slow.max_entries,
            compression: self.compression.clone(),
            ..PersistentTierConfig::slow()
        }
    }
}
