//! Request Batching
//!
//! Groups individually submitted items into batches bounded by size and wait
//! time, runs them through one processor call each under a concurrency cap,
//! and hands every caller its own result.
//!
//! # Lifecycle
//!
//! ```text
//!   add() ──► open batch ──(max_batch_size | max_wait_time)──► closed
//!                                                                │
//!                                   semaphore (concurrency) ◄────┘
//!                                              │
//!                                          processor(items)
//!                                              │
//!                              ResultMapper ──► per-item Result<R>
//! ```
//!
//! A processor error rejects every item of that batch and nothing else.

mod mapper;
mod processor;

pub use mapper::ResultMapper;
pub use processor::BatchProcessor;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Batch formation and dispatch limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Items per processor call
    pub max_batch_size: usize,
    /// Longest an item waits for its batch to fill
    #[serde(with = "crate::config::duration_ms")]
    pub max_wait_time: Duration,
    /// Simultaneous processor calls
    pub concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait_time: Duration::from_millis(50),
            concurrency: 5,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::Config("batch max_batch_size must be at least 1".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("batch concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// Processor counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchStats {
    /// Items handed to the processor
    pub total_items: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    /// Failed processor calls
    pub errors: u64,
    /// errors / total_batches
    pub error_rate: f64,
    /// Queued, not yet dispatched
    pub pending_items: usize,
    /// Processor calls running now
    pub active_jobs: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = BatchConfig::default();
        assert_eq!(config.max_batch_size, 100);
        assert_eq!(config.max_wait_time, Duration::from_millis(50));
        assert_eq!(config.concurrency, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let config = BatchConfig {
            concurrency: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }
}
