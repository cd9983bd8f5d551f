//! Tiered Cache
//!
//! An ordered chain of storage tiers behind one [`CacheManager`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                            Cache Manager                                 │
//! │        (tier selection, promotion, dedup/batch routing, sync)            │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  Fast (MemoryTier)    │ Medium (PersistentTier) │ Slow (PersistentTier)  │
//! │  ┌────────────────┐   │ ┌───────────────────┐   │ ┌───────────────────┐  │
//! │  │ ShardedMap     │   │ │ StorageBackend    │   │ │ StorageBackend    │  │
//! │  │ (64-way, LRU)  │   │ │ framed records    │   │ │ framed + LZ4      │  │
//! │  │ TTL 5 min      │   │ │ TTL 30 min        │   │ │ TTL 24 h          │  │
//! │  └────────────────┘   │ └───────────────────┘   │ └───────────────────┘  │
//! │         ▲             │          │              │          │             │
//! │         └─────────────┴──────────┴──────────────┴──────────┘             │
//! │                        promotion on read hit                             │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Reads probe fast → medium → slow and stop at the first hit. Writes land in
//! an explicit tier, else the first tier whose TTL ceiling covers the TTL,
//! else the fast tier.

mod entry;
mod manager;
mod memory;
mod persistent;
mod policy;
mod shard;
mod stats;
mod sync;
mod tier;
pub mod compression;

#[cfg(test)]
mod proptest;

pub use compression::{CompressionAlgorithm, CompressionConfig, CompressionManager, Compressor};
pub use entry::{now_millis, CacheEntry, EntryMetadata, EntryOptions, IMMUTABLE_TTL};
pub use manager::{CacheManager, CacheManagerBuilder, GetOptions, SetOptions, Strategy};
pub use memory::{EvictionListener, MemoryTier, MemoryTierConfig};
pub use persistent::{AccessInfo, InMemoryBackend, PersistentTier, PersistentTierConfig, StorageBackend};
pub use policy::{EvictionPolicy, TierSelector};
pub use shard::{ShardedMap, Weighted};
pub use stats::{CacheStats, RequestStats};
pub use sync::{SyncEvent, SyncEventKind, SyncSource, SyncSubscription};
pub use tier::{CacheTier, KeyPattern, TierName, TierStats, TierStatsRecorder};

/// Number of shards in the fast tier
pub const SHARD_COUNT: usize = 64;

/// Default fast tier TTL (5 minutes)
pub const DEFAULT_FAST_TTL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Default medium tier TTL (30 minutes)
pub const DEFAULT_MEDIUM_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Default slow tier TTL (24 hours)
pub const DEFAULT_SLOW_TTL: std::time::Duration = std::time::Duration::from_secs(24 * 60 * 60);

// =============================================================================
// Tests
// =============================================================================
