//! Eviction and Placement Policies
//!
//! How a bounded tier sheds entries, and how the manager picks the tier a
//! write lands in.

use std::time::Duration;

use super::tier::TierName;
use crate::error::{Error, Result};

// =============================================================================
// Eviction Policy
// =============================================================================

/// Watermark-driven LRU eviction
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvictionPolicy {
    /// Fraction of capacity that triggers eviction
    pub high_watermark: f64,
    /// Fraction of capacity eviction stops at
    pub low_watermark: f64,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::lru()
    }
}

impl EvictionPolicy {
    /// Evict past capacity, shed down to 90%
    pub fn lru() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 0.9,
        }
    }

    /// Evict exactly down to capacity
    pub fn strict() -> Self {
        Self {
            high_watermark: 1.0,
            low_watermark: 1.0,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.low_watermark)
            || !(0.0..=1.0).contains(&self.high_watermark)
            || self.low_watermark > self.high_watermark
        {
            return Err(Error::Config(format!(
                "invalid watermarks: low {} high {}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }

    /// Whether `current` is past the trigger point of `capacity`
    pub fn should_evict(&self, current: u64, capacity: u64) -> bool {
        current as f64 > capacity as f64 * self.high_watermark
    }

    /// Level eviction runs down to
    pub fn target(&self, capacity: u64) -> u64 {
        ((capacity as f64 * self.low_watermark).floor() as u64).min(capacity)
    }
}

// =============================================================================
// Tier Selection
// =============================================================================

/// Write placement over the registered tiers.
///
/// Ceilings are the tiers' default TTLs, kept in probe order.
#[derive(Debug, Clone, Default)]
pub struct TierSelector {
    ceilings: Vec<(TierName, Duration)>,
}

impl TierSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tier's TTL ceiling
    pub fn register(&mut self, tier: TierName, ceiling: Duration) {
        self.ceilings.retain(|(t, _)| *t != tier);
        self.ceilings.push((tier, ceiling));
        self.ceilings.sort_by_key(|(t, _)| *t);
    }

    pub fn contains(&self, tier: TierName) -> bool {
        self.ceilings.iter().any(|(t, _)| *t == tier)
    }

    /// Explicit tier, else the first tier whose ceiling covers `ttl`, else fast.
    ///
    /// A TTL above every ceiling lands in the slowest registered tier.
    pub fn select(&self, explicit: Option<TierName>, ttl: Option<Duration>) -> Result<TierName> {
        if let Some(tier) = explicit {
            return if self.contains(tier) {
                Ok(tier)
            } else {
                Err(Error::TierNotConfigured(tier))
            };
        }

        if let Some(ttl) = ttl {
            if let Some((tier, _)) = self.ceilings.iter().find(|(_, ceiling)| *ceiling >= ttl) {
                return Ok(*tier);
            }
            if let Some((tier, _)) = self.ceilings.last() {
                return Ok(*tier);
            }
        }

        if self.contains(TierName::Fast) {
            return Ok(TierName::Fast);
        }
        self.ceilings
            .first()
            .map(|(t, _)| *t)
            .ok_or(Error::TierNotConfigured(TierName::Fast))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn selector() -> TierSelector {
        let mut s = TierSelector::new();
        s.register(TierName::Slow, Duration::from_secs(86_400));
        s.register(TierName::Fast, Duration::from_secs(300));
        s.register(TierName::Medium, Duration::from_secs(1_800));
        s
    }

    #[test]
    fn test_eviction_watermarks() {
        let policy = EvictionPolicy::lru();
        assert!(!policy.should_evict(10, 10));
        assert!(policy.should_evict(11, 10));
        assert_eq!(policy.target(10), 9);
        assert_eq!(policy.target(100), 90);
        assert_eq!(EvictionPolicy::strict().target(10), 10);
    }

    #[test]
    fn test_eviction_policy_validation() {
        assert!(EvictionPolicy::lru().validate().is_ok());
        let bad = EvictionPolicy {
            high_watermark: 0.5,
            low_watermark: 0.8,
        };
        assert_matches!(bad.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_select_explicit() {
        let s = selector();
        assert_eq!(s.select(Some(TierName::Slow), None).unwrap(), TierName::Slow);

        let mut only_fast = TierSelector::new();
        only_fast.register(TierName::Fast, Duration::from_secs(300));
        assert_matches!(
            only_fast.select(Some(TierName::Medium), None),
            Err(Error::TierNotConfigured(TierName::Medium))
        );
    }

    #[test]
    fn test_select_by_ttl_bucket() {
        let s = selector();
        assert_eq!(s.select(None, Some(Duration::from_secs(60))).unwrap(), TierName::Fast);
        assert_eq!(s.select(None, Some(Duration::from_secs(300))).unwrap(), TierName::Fast);
        assert_eq!(s.select(None, Some(Duration::from_secs(301))).unwrap(), TierName::Medium);
        assert_eq!(s.select(None, Some(Duration::from_secs(3_600))).unwrap(), TierName::Slow);
        assert_eq!(
            s.select(None, Some(Duration::from_secs(30 * 86_400))).unwrap(),
            TierName::Slow
        );
    }

    #[test]
    fn test_select_default_fast() {
        assert_eq!(selector().select(None, None).unwrap(), TierName::Fast);
        assert_matches!(
            TierSelector::new().select(None, None),
            Err(Error::TierNotConfigured(TierName::Fast))
        );
    }
}
