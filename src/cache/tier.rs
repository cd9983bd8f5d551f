//! Tier Contract
//!
//! The capability every storage backend exposes to the [`CacheManager`],
//! plus the per-tier statistics it reports.
//!
//! [`CacheManager`]: super::CacheManager

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::entry::EntryOptions;
use crate::error::{Error, Result};

// =============================================================================
// Tier Names
// =============================================================================

/// Fixed tier slots, probed in declaration order on read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TierName {
    /// Volatile in-process tier
    Fast,
    /// Durable uncompressed tier
    Medium,
    /// Durable compressed tier
    Slow,
}

impl TierName {
    /// All tiers, fastest first
    pub const ALL: [TierName; 3] = [TierName::Fast, TierName::Medium, TierName::Slow];

    pub fn as_str(&self) -> &'static str {
        match self {
            TierName::Fast => "fast",
            TierName::Medium => "medium",
            TierName::Slow => "slow",
        }
    }

    /// Position in probe order
    #[inline]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for TierName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TierName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "fast" | "memory" => Ok(TierName::Fast),
            "medium" | "indexeddb" => Ok(TierName::Medium),
            "slow" | "persistent" => Ok(TierName::Slow),
            other => Err(Error::Config(format!("unknown tier: {}", other))),
        }
    }
}

// =============================================================================
// Tier Statistics
// =============================================================================

/// Per-tier counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub hits: u64,
    pub misses: u64,
    /// hits / (hits + misses), 0 without traffic
    pub hit_ratio: f64,
    /// Stored bytes
    pub total_size: u64,
    pub item_count: u64,
    pub evictions: u64,
    /// Running average hit latency (ms)
    pub avg_hit_time: f64,
    /// Running average miss latency (ms)
    pub avg_miss_time: f64,
}

impl TierStats {
    /// Ratio helper shared by tiers and the manager
    pub fn ratio(hits: u64, misses: u64) -> f64 {
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Incremental running average: `avg' = (avg * (n - 1) + sample) / n`
#[inline]
pub fn running_average(avg: f64, n: u64, sample: f64) -> f64 {
    if n == 0 {
        return 0.0;
    }
    (avg * (n - 1) as f64 + sample) / n as f64
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    evictions: u64,
    avg_hit_time: f64,
    avg_miss_time: f64,
}

/// Thread-safe recorder behind a tier's [`TierStats`]
#[derive(Debug, Default)]
pub struct TierStatsRecorder {
    counters: Mutex<Counters>,
}

impl TierStatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self, elapsed: Duration) {
        let mut c = self.counters.lock();
        c.hits += 1;
        c.avg_hit_time = running_average(c.avg_hit_time, c.hits, millis(elapsed));
    }

    pub fn record_miss(&self, elapsed: Duration) {
        let mut c = self.counters.lock();
        c.misses += 1;
        c.avg_miss_time = running_average(c.avg_miss_time, c.misses, millis(elapsed));
    }

    pub fn record_evictions(&self, count: u64) {
        self.counters.lock().evictions += count;
    }

    pub fn reset(&self) {
        *self.counters.lock() = Counters::default();
    }

    /// Snapshot with the tier's current occupancy
    pub fn snapshot(&self, total_size: u64, item_count: u64) -> TierStats {
        let c = self.counters.lock();
        TierStats {
            hits: c.hits,
            misses: c.misses,
            hit_ratio: TierStats::ratio(c.hits, c.misses),
            total_size,
            item_count,
            evictions: c.evictions,
            avg_hit_time: c.avg_hit_time,
            avg_miss_time: c.avg_miss_time,
        }
    }
}

#[inline]
pub(crate) fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

// =============================================================================
// Key Patterns
// =============================================================================

/// Glob matcher for `keys(pattern)`: `*` matches any run, `?` one character
#[derive(Debug, Clone)]
pub struct KeyPattern {
    regex: Regex,
}

impl KeyPattern {
    pub fn new(glob: &str) -> Result<Self> {
        let mut source = String::with_capacity(glob.len() + 8);
        source.push('^');
        for ch in glob.chars() {
            match ch {
                '*' => source.push_str(".*"),
                '?' => source.push('.'),
                other => source.push_str(&regex::escape(other.encode_utf8(&mut [0; 4]))),
            }
        }
        source.push('$');

        let regex = Regex::new(&source)
            .map_err(|e| Error::Config(format!("invalid key pattern {:?}: {}", glob, e)))?;
        Ok(Self { regex })
    }

    #[inline]
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// Compile an optional pattern; `None` matches everything
    pub fn compile(pattern: Option<&str>) -> Result<Option<Self>> {
        pattern.map(Self::new).transpose()
    }
}

// =============================================================================
// Tier Trait
// =============================================================================

/// Storage backend contract consumed by the manager.
///
/// `get` on an expired entry returns `None` and purges it. `set` either
/// succeeds or returns [`Error::Capacity`] after the tier tried to evict.
#[async_trait]
pub trait CacheTier: Send + Sync {
    /// Which slot this tier occupies
    fn name(&self) -> TierName;

    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn set(&self, key: &str, value: Bytes, options: EntryOptions) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    async fn has(&self, key: &str) -> Result<bool>;

    /// Live keys, optionally filtered by a glob
    async fn keys(&self, pattern: Option<&str>) -> Result<Vec<String>>;

    /// Stored bytes
    async fn size(&self) -> Result<u64>;

    /// Remove everything and reset stats
    async fn clear(&self) -> Result<()>;

    fn stats(&self) -> TierStats;

    /// TTL applied when a write carries none; doubles as the tier's TTL ceiling
    fn default_ttl(&self) -> Duration;
}

// =============================================================================
// Tests
// =============================================================================
