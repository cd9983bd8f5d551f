//! RPC Cost Accounting
//!
//! Counts calls per method, splits them into real spend and spend avoided by
//! a cache hit, and projects savings forward.
//!
//! ```text
//!   track_call(method, cached, ms)
//!         │
//!         ├─ method table ──► dollar_cost, category
//!         │
//!         └─ CostMetrics[method] ── calls, cached_calls, total_cost,
//!                                   saved_cost, avg_response_time
//! ```

mod methods;
mod tracker;

pub use methods::{default_methods, MethodCategory, RpcMethod};
pub use tracker::CostTracker;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Running totals for one method
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    pub method: String,
    pub calls: u64,
    pub cached_calls: u64,
    /// USD actually spent
    pub total_cost: f64,
    /// USD avoided through cache hits
    pub saved_cost: f64,
    /// Milliseconds
    pub avg_response_time: f64,
    pub cache_hit_rate: f64,
}

impl CostMetrics {
    fn new(method: &str) -> Self {
        Self {
            method: method.to_string(),
            calls: 0,
            cached_calls: 0,
            total_cost: 0.0,
            saved_cost: 0.0,
            avg_response_time: 0.0,
            cache_hit_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodCost {
    pub method: String,
    pub calls: u64,
    /// Spent plus saved
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub session_duration: Duration,
    pub total_calls: u64,
    pub cached_calls: u64,
    pub cache_hit_rate: f64,
    pub total_cost: f64,
    pub total_savings: f64,
    pub savings_percentage: f64,
    /// Five most expensive methods by spent plus saved
    pub top_methods: Vec<MethodCost>,
    /// Real spend per category
    pub cost_by_category: BTreeMap<MethodCategory, f64>,
    /// Savings per hour so far, over a 30 day month
    pub projected_monthly_savings: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RoiEstimate {
    /// `f64::INFINITY` when nothing has been saved yet
    pub break_even_days: f64,
    pub monthly_roi: f64,
    pub yearly_roi: f64,
}

impl RoiEstimate {
    pub fn from_monthly_savings(monthly_savings: f64, implementation_cost: f64) -> Self {
        let daily = monthly_savings / 30.0;
        Self {
            break_even_days: if daily > 0.0 {
                implementation_cost / daily
            } else {
                f64::INFINITY
            },
            monthly_roi: monthly_savings - implementation_cost / 12.0,
            yearly_roi: monthly_savings * 12.0 - implementation_cost,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roi() {
        let roi = RoiEstimate::from_monthly_savings(300.0, 1200.0);
        assert_eq!(roi.break_even_days, 120.0);
        assert_eq!(roi.monthly_roi, 200.0);
        assert_eq!(roi.yearly_roi, 2400.0);
    }
}
