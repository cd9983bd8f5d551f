//! Error types for the tiered cache engine

use std::sync::Arc;

use thiserror::Error;

use crate::cache::TierName;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the cache engine
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// A tier could not accept a write, even after evicting
    #[error("Tier {tier} is out of capacity: {reason}")]
    Capacity { tier: TierName, reason: String },

    /// A tier failed while serving a read
    #[error("Tier {tier} unavailable: {reason}")]
    TierUnavailable { tier: TierName, reason: String },

    /// Requested tier is not registered with the manager
    #[error("Cache tier not configured: {0}")]
    TierNotConfigured(TierName),

    /// Storage backend refused a write for lack of space
    #[error("Storage quota exceeded: {requested} bytes requested, quota is {quota}")]
    QuotaExceeded { requested: u64, quota: u64 },

    /// Stored record could not be decoded
    #[error("Corrupted cache record for key {key}: {reason}")]
    Corrupted { key: String, reason: String },

    // =========================================================================
    // Deduplication / Batching Errors
    // =========================================================================
    /// A deduplicated operation failed; every coalesced caller sees the same source
    #[error("Operation for key {key} failed: {source}")]
    OperationFailed {
        key: String,
        #[source]
        source: Arc<Error>,
    },

    /// The batch processor failed for the batch containing this item
    #[error("Batch processing failed: {0}")]
    BatchFailed(#[source] Arc<Error>),

    /// The batch processor returned no result for an item
    #[error("No result for batch item at index {index}")]
    MissingResult { index: usize },

    /// Item was still queued when the processor was cleared
    #[error("Batch processor cleared")]
    ProcessorCleared,

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML configuration parse error
    #[error("Failed to parse configuration: {0}")]
    ConfigParse(#[from] serde_yaml::Error),

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True when the error came from a tier running out of space, however
    /// it reached the caller
    pub fn is_capacity(&self) -> bool {
        matches!(self.root(), Error::Capacity { .. })
    }

    /// Unwraps shared wrappers down to the error that actually occurred
    pub fn root(&self) -> &Error {
        match self {
            Error::OperationFailed { source, .. } => source.root(),
            Error::BatchFailed(source) => source.root(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_root_unwraps_shared_errors() {
        let inner = Arc::new(Error::Internal("upstream timeout".into()));
        let err = Error::OperationFailed {
            key: "eth_blockNumber".into(),
            source: Arc::new(Error::BatchFailed(inner)),
        };

        assert_matches!(err.root(), Error::Internal(msg) if msg == "upstream timeout");
    }

    #[test]
    fn test_capacity_display() {
        let err = Error::Capacity {
            tier: TierName::Fast,
            reason: "value of 10 bytes exceeds limit of 4".into(),
        };
        assert!(err.is_capacity());
        assert_eq!(
            err.to_string(),
            "Tier fast is out of capacity: value of 10 bytes exceeds limit of 4"
        );
    }

    #[test]
    fn test_capacity_seen_through_shared_wrappers() {
        let full = Arc::new(Error::Capacity {
            tier: TierName::Slow,
            reason: "quota".into(),
        });
        let batched = Error::OperationFailed {
            key: "k".into(),
            source: full,
        };

        assert!(batched.is_capacity());
        assert!(!Error::Internal("x".into()).is_capacity());
    }
}
