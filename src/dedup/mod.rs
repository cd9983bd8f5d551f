//! Request Deduplication
//!
//! Per-key single flight with a short post-completion result window.
//!
//! # Guarantees
//!
//! - At most one invocation of an operation is in flight per key; callers
//!   arriving meanwhile share its outcome, value or error.
//! - A successful outcome is kept for `ttl`; callers inside the window get it
//!   without invoking anything. Failures are never kept.
//! - The pending and completed maps sit behind one mutex. Lookup plus
//!   registration is one critical section, as is settlement (remove pending,
//!   then insert or skip the completed result).
//!
//! # Example
//!
//! ```
//! # tokio_test::block_on(async {
//! use std::time::Duration;
//! use tiercache::dedup::Deduplicator;
//!
//! let dedup: Deduplicator<u64> = Deduplicator::new();
//! let block = dedup
//!     .execute("eth_blockNumber", || async { Ok(19_000_000) }, Some(Duration::from_secs(1)))
//!     .await
//!     .unwrap();
//! assert_eq!(block, 19_000_000);
//! # });
//! ```

mod group;

pub use group::DeduplicatorGroup;

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Default window a successful result is reused for
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);

/// Completed-store size that triggers a sweep
pub const DEFAULT_CLEANUP_THRESHOLD: usize = 1_000;

/// Deduplicator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatorConfig {
    /// Result window when `execute` gets no TTL
    #[serde(with = "crate::config::duration_ms")]
    pub default_ttl: Duration,
    /// Sweep once the completed store grows past this
    pub cleanup_threshold: usize,
    /// Hard cap on retained results after a sweep
    pub max_results: usize,
}

impl Default for DeduplicatorConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_RESULT_TTL,
            cleanup_threshold: DEFAULT_CLEANUP_THRESHOLD,
            max_results: DEFAULT_CLEANUP_THRESHOLD,
        }
    }
}

/// Deduplicator counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeduplicatorStats {
    pub total_requests: u64,
    /// Callers that joined an in-flight operation
    pub deduplicated_requests: u64,
    /// Callers served from the completed store
    pub cache_hits: u64,
    /// Callers that started a fresh operation
    pub cache_misses: u64,
    pub deduplication_ratio: f64,
    pub cache_hit_ratio: f64,
    pub pending_requests: usize,
    pub cached_results: usize,
}

type Outcome<T> = std::result::Result<T, Arc<Error>>;
type SharedOutcome<T> = Shared<BoxFuture<'static, Outcome<T>>>;

struct Pending<T: Clone> {
    id: u64,
    future: SharedOutcome<T>,
}

struct Completed<T> {
    value: T,
    expires_at: Instant,
}

struct State<T: Clone> {
    pending: HashMap<String, Pending<T>>,
    completed: HashMap<String, Completed<T>>,
    next_id: u64,
}

#[derive(Default)]
struct Counters {
    total_requests: AtomicU64,
    deduplicated_requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

type DedupHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Inner<T: Clone> {
    config: DeduplicatorConfig,
    state: Mutex<State<T>>,
    counters: Counters,
    on_deduplicated: Option<DedupHook>,
}

/// Single-flight executor, cheap to clone
pub struct Deduplicator<T: Clone> {
    inner: Arc<Inner<T>>,
}

impl<T: Clone> Clone for Deduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

enum Lookup<T: Clone> {
    Hit(T),
    Wait(SharedOutcome<T>),
}

impl<T> Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::with_config(DeduplicatorConfig::default())
    }

    pub fn with_config(config: DeduplicatorConfig) -> Self {
        Self::build(config, None)
    }

    /// Invoke `hook(key)` whenever a caller joins an in-flight operation
    pub fn with_on_deduplicated<F>(config: DeduplicatorConfig, hook: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self::build(config, Some(Arc::new(hook)))
    }

    fn build(config: DeduplicatorConfig, on_deduplicated: Option<DedupHook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(State {
                    pending: HashMap::new(),
                    completed: HashMap::new(),
                    next_id: 0,
                }),
                counters: Counters::default(),
                on_deduplicated,
            }),
        }
    }

    pub fn config(&self) -> &DeduplicatorConfig {
        &self.inner.config
    }

    /// Run `operation` unless an identical one is in flight or recently
    /// completed under `key`.
    ///
    /// `ttl` of `None` uses the configured default; `Some(Duration::ZERO)`
    /// coalesces in-flight callers only. Failures surface as
    /// [`Error::OperationFailed`] sharing one source across all callers.
    pub async fn execute<F, Fut>(&self, key: &str, operation: F, ttl: Option<Duration>) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let ttl = ttl.unwrap_or(self.inner.config.default_ttl);

        let future = match self.lookup_or_register(key, operation, ttl) {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Wait(future) => future,
        };

        future.await.map_err(|source| Error::OperationFailed {
            key: key.to_string(),
            source,
        })
    }

    fn lookup_or_register<F, Fut>(&self, key: &str, operation: F, ttl: Duration) -> Lookup<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let counters = &self.inner.counters;
        let mut state = self.inner.state.lock();
        counters.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(future) = state.pending.get(key).map(|p| p.future.clone()) {
            counters.deduplicated_requests.fetch_add(1, Ordering::Relaxed);
            drop(state);
            trace!(key, "Joined in-flight operation");
            if let Some(hook) = &self.inner.on_deduplicated {
                hook(key);
            }
            return Lookup::Wait(future);
        }

        if let Some(done) = state.completed.get(key) {
            if done.expires_at > Instant::now() {
                counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Hit(done.value.clone());
            }
        }
        state.completed.remove(key);

        counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let id = state.next_id;
        state.next_id += 1;

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let owned_key = key.to_string();
        let future = async move {
            let outcome = operation().await.map_err(Arc::new);
            if let Some(inner) = weak.upgrade() {
                inner.settle(&owned_key, id, &outcome, ttl);
            }
            outcome
        }
        .boxed()
        .shared();

        state.pending.insert(
            key.to_string(),
            Pending {
                id,
                future: future.clone(),
            },
        );
        Lookup::Wait(future)
    }

    /// Forget all pending and completed state
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        state.pending.clear();
        state.completed.clear();
    }

    /// Forget pending and completed state for one key
    pub fn clear_key(&self, key: &str) {
        let mut state = self.inner.state.lock();
        state.pending.remove(key);
        state.completed.remove(key);
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    pub fn stats(&self) -> DeduplicatorStats {
        let c = &self.inner.counters;
        let (pending_requests, cached_results) = {
            let state = self.inner.state.lock();
            (state.pending.len(), state.completed.len())
        };

        let total_requests = c.total_requests.load(Ordering::Relaxed);
        let deduplicated_requests = c.deduplicated_requests.load(Ordering::Relaxed);
        let cache_hits = c.cache_hits.load(Ordering::Relaxed);
        let denominator = total_requests.max(1) as f64;

        DeduplicatorStats {
            total_requests,
            deduplicated_requests,
            cache_hits,
            cache_misses: c.cache_misses.load(Ordering::Relaxed),
            deduplication_ratio: deduplicated_requests as f64 / denominator,
            cache_hit_ratio: cache_hits as f64 / denominator,
            pending_requests,
            cached_results,
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.inner.counters;
        c.total_requests.store(0, Ordering::Relaxed);
        c.deduplicated_requests.store(0, Ordering::Relaxed);
        c.cache_hits.store(0, Ordering::Relaxed);
        c.cache_misses.store(0, Ordering::Relaxed);
    }
}

impl<T> Default for Deduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> Inner<T> {
    fn settle(&self, key: &str, id: u64, outcome: &Outcome<T>, ttl: Duration) {
        let mut state = self.state.lock();

        // A clear() while in flight orphans this operation: nothing to cache
        if state.pending.get(key).map(|p| p.id) != Some(id) {
            return;
        }
        state.pending.remove(key);

        if let Ok(value) = outcome {
            if !ttl.is_zero() {
                state.completed.insert(
                    key.to_string(),
                    Completed {
                        value: value.clone(),
                        expires_at: Instant::now() + ttl,
                    },
                );
                if state.completed.len() > self.config.cleanup_threshold {
                    Self::sweep(&mut state, self.config.max_results);
                }
            }
        }
    }

    fn sweep(state: &mut State<T>, max_results: usize) {
        let before = state.completed.len();
        let now = Instant::now();
        state.completed.retain(|_, c| c.expires_at > now);

        if state.completed.len() > max_results {
            let mut by_expiry: Vec<(Instant, String)> = state
                .completed
                .iter()
                .map(|(k, c)| (c.expires_at, k.clone()))
                .collect();
            by_expiry.sort();
            let excess = state.completed.len() - max_results;
            for (_, key) in by_expiry.into_iter().take(excess) {
                state.completed.remove(&key);
            }
        }

        debug!(
            removed = before - state.completed.len(),
            remaining = state.completed.len(),
            "Swept completed results"
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
