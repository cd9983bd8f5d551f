//! Property tests for the statistics arithmetic

use proptest::prelude::*;

use super::stats::{CacheStats, RequestStats};
use super::tier::{running_average, TierName, TierStats};

fn tier(hits: u64, misses: u64) -> TierStats {
    TierStats {
        hits,
        misses,
        hit_ratio: TierStats::ratio(hits, misses),
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn blended_ratio_uses_summed_counters(
        counts in proptest::collection::vec((0u64..10_000, 0u64..10_000), 1..=3)
    ) {
        let tiers: Vec<_> = TierName::ALL
            .iter()
            .zip(&counts)
            .map(|(name, (h, m))| (*name, tier(*h, *m)))
            .collect();

        let stats = CacheStats::aggregate(tiers, RequestStats::default(), 0.0);
        let hits: u64 = counts.iter().map(|(h, _)| h).sum();
        let misses: u64 = counts.iter().map(|(_, m)| m).sum();

        prop_assert_eq!(stats.hits, hits);
        prop_assert_eq!(stats.misses, misses);
        if hits + misses == 0 {
            prop_assert_eq!(stats.hit_ratio, 0.0);
        } else {
            prop_assert!((stats.hit_ratio - hits as f64 / (hits + misses) as f64).abs() < 1e-12);
        }
        prop_assert!((0.0..=1.0).contains(&stats.hit_ratio));
    }

    #[test]
    fn running_average_matches_mean(samples in proptest::collection::vec(0.0f64..1_000.0, 1..50)) {
        let mut avg = 0.0;
        for (i, sample) in samples.iter().enumerate() {
            avg = running_average(avg, i as u64 + 1, *sample);
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        prop_assert!((avg - mean).abs() < 1e-6);
    }

    #[test]
    fn running_average_stays_within_sample_bounds(samples in proptest::collection::vec(0.0f64..1_000.0, 1..50)) {
        let lo = samples.iter().cloned().fold(f64::INFINITY, f64::min);
        let hi = samples.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let mut avg = 0.0;
        for (i, sample) in samples.iter().enumerate() {
            avg = running_average(avg, i as u64 + 1, *sample);
        }
        prop_assert!(avg >= lo - 1e-9 && avg <= hi + 1e-9);
    }
}
