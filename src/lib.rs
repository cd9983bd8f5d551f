//! tiercache - Tiered Caching for Metered RPC
//!
//! A multi-tier cache that sits in front of expensive, rate-limited or
//! metered remote calls (blockchain JSON-RPC being the motivating case) and
//! cuts redundant work through tiered storage, promotion, request coalescing
//! and request batching, while accounting for what the cache saved.
//!
//! # Architecture
//!
//! ```text
//!              ┌──────────────────────── CacheManager ────────────────────────┐
//!  get/set ──► │ TierSelector ─► Deduplicator ─► BatchProcessor ─► CacheTier │
//!              │                                                  fast/medium/slow
//!              │ SyncHub (events)          CostTracker (spend / savings)      │
//!              └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`cache`] - Tier contract, reference tiers and the [`CacheManager`]
//! - [`dedup`] - Per-key single flight with a short result window
//! - [`batch`] - Size/time bounded request batching
//! - [`cost`] - Per-method RPC cost and savings accounting
//! - [`config`] - YAML configuration
//! - [`metrics`] - Prometheus exposition
//! - [`error`] - Error types

pub mod batch;
pub mod cache;
pub mod config;
pub mod cost;
pub mod dedup;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use batch::{BatchConfig, BatchProcessor, ResultMapper};
pub use cache::{CacheManager, CacheStats, CacheTier, GetOptions, SetOptions, Strategy, TierName};
pub use config::CacheConfig;
pub use cost::CostTracker;
pub use dedup::{Deduplicator, DeduplicatorGroup};
pub use error::{Error, Result};
pub use metrics::MetricsExporter;
