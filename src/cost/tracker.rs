//! Per-method call accounting

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

use super::methods::{default_methods, MethodCategory, RpcMethod};
use super::{CostMetrics, CostSummary, MethodCost, RoiEstimate};

const HOURS_PER_MONTH: f64 = 24.0 * 30.0;
const TOP_METHODS: usize = 5;

struct Ledger {
    metrics: HashMap<String, CostMetrics>,
    total_cost: f64,
    total_savings: f64,
    session_start: Instant,
}

impl Ledger {
    fn new() -> Self {
        Self {
            metrics: HashMap::new(),
            total_cost: 0.0,
            total_savings: 0.0,
            session_start: Instant::now(),
        }
    }
}

/// Tracks real and avoided spend per RPC method.
///
/// Safe to share; every method takes `&self`.
pub struct CostTracker {
    methods: Mutex<HashMap<String, RpcMethod>>,
    ledger: Mutex<Ledger>,
}

impl Default for CostTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CostTracker {
    /// Tracker preloaded with [`default_methods`]
    pub fn new() -> Self {
        Self::with_methods(default_methods())
    }

    pub fn with_methods(methods: impl IntoIterator<Item = RpcMethod>) -> Self {
        Self {
            methods: Mutex::new(methods.into_iter().map(|m| (m.name.clone(), m)).collect()),
            ledger: Mutex::new(Ledger::new()),
        }
    }

    /// Add or reprice a method
    pub fn register_method(&self, method: RpcMethod) {
        self.methods.lock().insert(method.name.clone(), method);
    }

    pub fn method(&self, name: &str) -> Option<RpcMethod> {
        self.methods.lock().get(name).cloned()
    }

    /// Record one call. `response_time_ms` of zero leaves the average alone.
    pub fn track_call(&self, method: &str, cached: bool, response_time_ms: f64) {
        let Some(price) = self.methods.lock().get(method).map(|m| m.dollar_cost) else {
            warn!(method, "Unknown RPC method, call not tracked");
            return;
        };

        let mut ledger = self.ledger.lock();
        let metric = ledger
            .metrics
            .entry(method.to_string())
            .or_insert_with(|| CostMetrics::new(method));

        metric.calls += 1;
        if cached {
            metric.cached_calls += 1;
            metric.saved_cost += price;
        } else {
            metric.total_cost += price;
        }

        if response_time_ms > 0.0 {
            let n = metric.calls as f64;
            metric.avg_response_time = (metric.avg_response_time * (n - 1.0) + response_time_ms) / n;
        }
        metric.cache_hit_rate = metric.cached_calls as f64 / metric.calls as f64;

        if cached {
            ledger.total_savings += price;
        } else {
            ledger.total_cost += price;
        }
    }

    /// Record `count` calls of which the first `cached_count` were served
    /// from cache
    pub fn track_batch(&self, method: &str, count: u64, cached_count: u64, avg_response_time_ms: f64) {
        for i in 0..count {
            self.track_call(method, i < cached_count, avg_response_time_ms);
        }
    }

    pub fn method_metrics(&self, method: &str) -> Option<CostMetrics> {
        self.ledger.lock().metrics.get(method).cloned()
    }

    /// Every tracked method, sorted by name
    pub fn all_metrics(&self) -> Vec<CostMetrics> {
        let mut all: Vec<_> = self.ledger.lock().metrics.values().cloned().collect();
        all.sort_by(|a, b| a.method.cmp(&b.method));
        all
    }

    pub fn total_savings(&self) -> f64 {
        self.ledger.lock().total_savings
    }

    pub fn summary(&self) -> CostSummary {
        let elapsed = self.ledger.lock().session_start.elapsed();
        self.summary_over(elapsed)
    }

    fn summary_over(&self, session_duration: Duration) -> CostSummary {
        let categories: HashMap<String, MethodCategory> = self
            .methods
            .lock()
            .values()
            .map(|m| (m.name.clone(), m.category))
            .collect();
        let ledger = self.ledger.lock();

        let mut total_calls = 0;
        let mut cached_calls = 0;
        let mut cost_by_category: BTreeMap<MethodCategory, f64> = BTreeMap::new();
        for metric in ledger.metrics.values() {
            total_calls += metric.calls;
            cached_calls += metric.cached_calls;
            if let Some(category) = categories.get(&metric.method) {
                *cost_by_category.entry(*category).or_default() += metric.total_cost;
            }
        }

        let mut top_methods: Vec<MethodCost> = ledger
            .metrics
            .values()
            .map(|m| MethodCost {
                method: m.method.clone(),
                calls: m.calls,
                cost: m.total_cost + m.saved_cost,
            })
            .collect();
        top_methods.sort_by(|a, b| b.cost.total_cmp(&a.cost).then_with(|| a.method.cmp(&b.method)));
        top_methods.truncate(TOP_METHODS);

        let spent = ledger.total_cost + ledger.total_savings;
        let hours = session_duration.as_secs_f64() / 3600.0;
        let savings_per_hour = if hours > 0.0 {
            ledger.total_savings / hours
        } else {
            0.0
        };

        CostSummary {
            session_duration,
            total_calls,
            cached_calls,
            cache_hit_rate: if total_calls > 0 {
                cached_calls as f64 / total_calls as f64
            } else {
                0.0
            },
            total_cost: ledger.total_cost,
            total_savings: ledger.total_savings,
            savings_percentage: if spent > 0.0 {
                ledger.total_savings / spent * 100.0
            } else {
                0.0
            },
            top_methods,
            cost_by_category,
            projected_monthly_savings: savings_per_hour * HOURS_PER_MONTH,
        }
    }

    /// Per-method metrics as CSV, one row per method sorted by name
    pub fn export_csv(&self) -> String {
        let mut out = String::from(
            "Method,Total Calls,Cached Calls,Cache Hit Rate,Total Cost ($),Saved Cost ($),Avg Response Time (ms)",
        );
        for m in self.all_metrics() {
            let _ = write!(
                out,
                "\n{},{},{},{:.2}%,{:.6},{:.6},{:.2}",
                m.method,
                m.calls,
                m.cached_calls,
                m.cache_hit_rate * 100.0,
                m.total_cost,
                m.saved_cost,
                m.avg_response_time
            );
        }
        out
    }

    /// Drop all metrics and restart the session clock; the method table stays
    pub fn reset(&self) {
        *self.ledger.lock() = Ledger::new();
    }

    /// Payback of a one-off `implementation_cost` at the current savings rate
    pub fn calculate_roi(&self, implementation_cost: f64) -> RoiEstimate {
        RoiEstimate::from_monthly_savings(self.summary().projected_monthly_savings, implementation_cost)
    }
}

// =============================================================================
// Tests
// =============================================================================
