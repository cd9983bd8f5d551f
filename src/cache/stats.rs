//! Aggregated Statistics
//!
//! Blends per-tier counters into one manager-wide view. The hit ratio is
//! recomputed from summed counters, never averaged across tiers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::tier::{TierName, TierStats};

/// Manager-level request counters (one probe chain = one request)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    /// Running average (ms)
    pub avg_hit_time: f64,
    /// Running average (ms)
    pub avg_miss_time: f64,
}

impl From<TierStats> for RequestStats {
    fn from(s: TierStats) -> Self {
        Self {
            hits: s.hits,
            misses: s.misses,
            hit_ratio: s.hit_ratio,
            avg_hit_time: s.avg_hit_time,
            avg_miss_time: s.avg_miss_time,
        }
    }
}

/// Snapshot returned by `CacheManager::stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Σ tier hits
    pub hits: u64,
    /// Σ tier misses
    pub misses: u64,
    /// Σhits / (Σhits + Σmisses)
    pub hit_ratio: f64,
    pub total_size: u64,
    pub item_count: u64,
    pub evictions: u64,
    pub tiers: BTreeMap<TierName, TierStats>,
    pub requests: RequestStats,
    /// Dollars saved by cache hits, from the cost tracker
    pub total_savings: f64,
}

impl CacheStats {
    pub fn aggregate<I>(tiers: I, requests: RequestStats, total_savings: f64) -> Self
    where
        I: IntoIterator<Item = (TierName, TierStats)>,
    {
        let mut stats = CacheStats {
            requests,
            total_savings,
            ..Default::default()
        };

        for (name, tier) in tiers {
            stats.hits += tier.hits;
            stats.misses += tier.misses;
            stats.total_size += tier.total_size;
            stats.item_count += tier.item_count;
            stats.evictions += tier.evictions;
            stats.tiers.insert(name, tier);
        }
        stats.hit_ratio = TierStats::ratio(stats.hits, stats.misses);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tier(hits: u64, misses: u64) -> TierStats {
        TierStats {
            hits,
            misses,
            hit_ratio: TierStats::ratio(hits, misses),
            ..Default::default()
        }
    }

    #[test]
    fn test_blended_ratio_not_averaged() {
        let stats = CacheStats::aggregate(
            [(TierName::Fast, tier(3, 1)), (TierName::Medium, tier(1, 5))],
            RequestStats::default(),
            0.0,
        );

        assert_eq!(stats.hits, 4);
        assert_eq!(stats.misses, 6);
        assert!((stats.hit_ratio - 0.4).abs() < 1e-12);
        assert_eq!(stats.tiers.len(), 2);
    }

    #[test]
    fn test_empty_is_zero() {
        let stats = CacheStats::aggregate(Vec::new(), RequestStats::default(), 0.0);
        assert_eq!(stats.hit_ratio, 0.0);
        assert_eq!(stats, CacheStats::default());
    }

    #[test]
    fn test_sums_sizes_and_evictions() {
        let mut a = tier(0, 0);
        a.total_size = 100;
        a.item_count = 2;
        a.evictions = 1;
        let mut b = tier(0, 0);
        b.total_size = 50;
        b.item_count = 3;

        let stats = CacheStats::aggregate(
            [(TierName::Fast, a), (TierName::Slow, b)],
            RequestStats::default(),
            1.5,
        );
        assert_eq!(stats.total_size, 150);
        assert_eq!(stats.item_count, 5);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.total_savings, 1.5);
    }
}
