//! Payload Compression
//!
//! LZ4 block compression for the slow tier, with a size threshold below which
//! payloads are stored as-is.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{CompressionAlgorithm, CompressionManager};
//!
//! let manager = CompressionManager::new();
//! let data = "0xdeadbeef".repeat(200);
//!
//! let (compressed, algorithm) = manager.compress(data.as_bytes());
//! assert_eq!(algorithm, CompressionAlgorithm::Lz4);
//!
//! let restored = manager.decompress(&compressed, algorithm).unwrap();
//! assert_eq!(restored.as_ref(), data.as_bytes());
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Stored as-is
    None,
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }

    /// One-byte tag used in stored records
    pub fn tag(&self) -> u8 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Lz4 => 1,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionAlgorithm::None),
            1 => Some(CompressionAlgorithm::Lz4),
            _ => None,
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Compression Configuration
// =============================================================================

/// Compression settings for a persistent tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Compress payloads at all
    pub enabled: bool,
    /// Payloads smaller than this are stored uncompressed
    pub min_size_bytes: u64,
    /// LZ4 high-compression level
    pub level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_size_bytes: 1024,
            level: 4,
        }
    }
}

impl CompressionConfig {
    /// Never compress
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressionAlgorithm;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block codec; the uncompressed size is prepended by `lz4` itself
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::with_level(4)
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Compression Manager
// =============================================================================

/// Applies the configured policy: threshold, enabled flag, and fallback to
/// the raw payload when compression fails or does not shrink it
pub struct CompressionManager {
    config: CompressionConfig,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl CompressionManager {
    pub fn new() -> Self {
        Self::with_config(CompressionConfig::default())
    }

    pub fn with_config(config: CompressionConfig) -> Self {
        Self {
            lz4: Lz4Compressor::with_level(config.level),
            noop: NoopCompressor,
            config,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Returns (payload, algorithm actually used)
    pub fn compress(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if !self.config.enabled || (data.len() as u64) < self.config.min_size_bytes {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.lz4.compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), CompressionAlgorithm::Lz4)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!(error = %e, "Compression failed, storing uncompressed");
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    pub fn decompress(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        if algorithm == CompressionAlgorithm::None {
            return Ok(Bytes::copy_from_slice(data));
        }
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }

    pub fn config(&self) -> &CompressionConfig {
        &self.config
    }
}

impl Default for CompressionManager {
    fn default() -> Self {
        Self::new()
    }
}
