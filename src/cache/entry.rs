//! Cache Entry Types
//!
//! The value envelope every tier stores: payload plus expiration and access
//! telemetry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;

/// Entries living at least this long are flagged immutable
pub const IMMUTABLE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Current wall-clock time in epoch milliseconds
#[inline]
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Per-write options handed to a tier
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryOptions {
    /// Time to live; `None` uses the tier default
    pub ttl: Option<Duration>,
    /// Explicitly flag the value as immutable
    pub immutable: bool,
}

impl EntryOptions {
    /// Options with an explicit TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            immutable: false,
        }
    }
}

/// Metadata for cache entries
#[derive(Debug)]
pub struct EntryMetadata {
    /// Payload size in bytes
    size: u64,
    /// Creation timestamp (epoch millis)
    created_at: u64,
    /// Absolute expiration timestamp (epoch millis)
    expires_at: u64,
    /// Successful reads
    hit_count: AtomicU64,
    /// Last successful read (epoch millis)
    last_accessed_at: AtomicU64,
    /// Long-lived or explicitly flagged value
    immutable: bool,
}

impl EntryMetadata {
    /// Create metadata for a fresh entry
    pub fn new(size: u64, ttl: Duration, immutable: bool) -> Self {
        let now = now_millis();
        Self {
            size,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            hit_count: AtomicU64::new(0),
            last_accessed_at: AtomicU64::new(now),
            immutable: immutable || ttl >= IMMUTABLE_TTL,
        }
    }

    /// Rebuild metadata from persisted fields
    pub fn restore(
        size: u64,
        created_at: u64,
        expires_at: u64,
        hit_count: u64,
        last_accessed_at: u64,
        immutable: bool,
    ) -> Self {
        Self {
            size,
            created_at,
            expires_at,
            hit_count: AtomicU64::new(hit_count),
            last_accessed_at: AtomicU64::new(last_accessed_at),
            immutable,
        }
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    #[inline]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    #[inline]
    pub fn hit_count(&self) -> u64 {
        self.hit_count.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn last_accessed_at(&self) -> u64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// Record a successful read and return the new hit count
    #[inline]
    pub fn record_access(&self) -> u64 {
        self.last_accessed_at.store(now_millis(), Ordering::Relaxed);
        self.hit_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Expired at the given instant (expiry is inclusive)
    #[inline]
    pub fn is_expired_at(&self, now: u64) -> bool {
        now >= self.expires_at
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_millis())
    }

    /// Time left before expiry
    pub fn remaining_ttl(&self) -> Duration {
        Duration::from_millis(self.expires_at.saturating_sub(now_millis()))
    }
}

impl Clone for EntryMetadata {
    fn clone(&self) -> Self {
        Self {
            size: self.size,
            created_at: self.created_at,
            expires_at: self.expires_at,
            hit_count: AtomicU64::new(self.hit_count()),
            last_accessed_at: AtomicU64::new(self.last_accessed_at()),
            immutable: self.immutable,
        }
    }
}

/// Cache entry containing a payload and its metadata
#[derive(Clone)]
pub struct CacheEntry {
    /// Entry metadata
    pub metadata: EntryMetadata,
    /// Cached payload (zero-copy)
    value: Bytes,
}

impl CacheEntry {
    /// Create a new entry that expires after `ttl`
    pub fn new(value: Bytes, ttl: Duration, immutable: bool) -> Self {
        Self {
            metadata: EntryMetadata::new(value.len() as u64, ttl, immutable),
            value,
        }
    }

    /// Create with existing metadata (tier transfers, decoded records)
    pub fn with_metadata(value: Bytes, metadata: EntryMetadata) -> Self {
        Self { metadata, value }
    }

    #[inline]
    pub fn value(&self) -> &Bytes {
        &self.value
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.metadata.size()
    }

    #[inline]
    pub fn record_access(&self) -> u64 {
        self.metadata.record_access()
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired()
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size", &self.metadata.size())
            .field("hit_count", &self.metadata.hit_count())
            .field("expires_at", &self.metadata.expires_at())
            .field("immutable", &self.metadata.is_immutable())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_creation() {
        let entry = CacheEntry::new(
            Bytes::from_static(b"0x1b4"),
            Duration::from_secs(60),
            false,
        );

        assert_eq!(entry.size(), 5);
        assert_eq!(entry.value().as_ref(), b"0x1b4");
        assert_eq!(entry.metadata.hit_count(), 0);
        assert!(!entry.is_expired());
        assert!(!entry.metadata.is_immutable());
    }

    #[test]
    fn test_access_tracking() {
        let entry = CacheEntry::new(Bytes::from_static(b"v"), Duration::from_secs(60), false);

        assert_eq!(entry.record_access(), 1);
        assert_eq!(entry.record_access(), 2);
        assert_eq!(entry.metadata.hit_count(), 2);
        assert!(entry.metadata.last_accessed_at() >= entry.metadata.created_at());
    }

    #[test]
    fn test_expiry_is_inclusive() {
        let meta = EntryMetadata::restore(1, 1_000, 2_000, 0, 1_000, false);

        assert!(!meta.is_expired_at(1_999));
        assert!(meta.is_expired_at(2_000));
        assert!(meta.is_expired_at(5_000));
    }

    #[test]
    fn test_zero_ttl_expires_immediately() {
        let entry = CacheEntry::new(Bytes::from_static(b"v"), Duration::ZERO, false);
        assert!(entry.is_expired());
    }

    #[test]
    fn test_long_ttl_marks_immutable() {
        let meta = EntryMetadata::new(1, IMMUTABLE_TTL, false);
        assert!(meta.is_immutable());

        let meta = EntryMetadata::new(1, Duration::from_secs(60), true);
        assert!(meta.is_immutable());
    }

    #[test]
    fn test_metadata_clone_keeps_counters() {
        let meta = EntryMetadata::new(64, Duration::from_secs(60), false);
        meta.record_access();
        meta.record_access();

        let cloned = meta.clone();
        assert_eq!(cloned.size(), 64);
        assert_eq!(cloned.hit_count(), 2);
        assert_eq!(cloned.expires_at(), meta.expires_at());
    }

    #[test]
    fn test_entry_debug() {
        let entry = CacheEntry::new(Bytes::from_static(b"v"), Duration::from_secs(1), false);
        let debug = format!("{:?}", entry);
        assert!(debug.contains("CacheEntry"));
        assert!(debug.contains("hit_count"));
    }
}
