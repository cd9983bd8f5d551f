//! Prometheus exposition
//!
//! Snapshots manager, tier, deduplicator, batch and cost figures into a
//! private registry on every [`MetricsExporter::render`] call.

use prometheus::{Encoder, Gauge, GaugeVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::CacheManager;
use crate::error::{Error, Result};

const NAMESPACE: &str = "tiercache";

pub struct MetricsExporter {
    registry: Registry,
    requests: IntGaugeVec,
    hit_ratio: Gauge,
    tier_counts: IntGaugeVec,
    tier_bytes: IntGaugeVec,
    tier_latency: GaugeVec,
    dedup: IntGaugeVec,
    batch: GaugeVec,
    cost: GaugeVec,
    method_calls: IntGaugeVec,
}

fn register<M>(registry: &Registry, metric: M) -> Result<M>
where
    M: prometheus::core::Collector + Clone + 'static,
{
    registry
        .register(Box::new(metric.clone()))
        .map_err(|e| Error::Internal(format!("Failed to register metric: {}", e)))?;
    Ok(metric)
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn metric_error(e: prometheus::Error) -> Error {
    Error::Internal(format!("Failed to create metric: {}", e))
}

impl MetricsExporter {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        Ok(Self {
            requests: register(
                &registry,
                IntGaugeVec::new(opts("requests", "Manager reads by outcome"), &["outcome"]).map_err(metric_error)?,
            )?,
            hit_ratio: register(
                &registry,
                Gauge::with_opts(opts("hit_ratio", "Blended hit ratio across tiers")).map_err(metric_error)?,
            )?,
            tier_counts: register(
                &registry,
                IntGaugeVec::new(
                    opts("tier_events", "Per-tier hits, misses and evictions"),
                    &["tier", "event"],
                )
                .map_err(metric_error)?,
            )?,
            tier_bytes: register(
                &registry,
                IntGaugeVec::new(opts("tier_occupancy", "Per-tier stored bytes and items"), &["tier", "unit"])
                    .map_err(metric_error)?,
            )?,
            tier_latency: register(
                &registry,
                GaugeVec::new(
                    opts("tier_latency_ms", "Per-tier running average latency"),
                    &["tier", "outcome"],
                )
                .map_err(metric_error)?,
            )?,
            dedup: register(
                &registry,
                IntGaugeVec::new(opts("dedup", "Deduplicator counters"), &["dedup", "counter"])
                    .map_err(metric_error)?,
            )?,
            batch: register(
                &registry,
                GaugeVec::new(opts("write_batch", "Write batch processor figures"), &["figure"])
                    .map_err(metric_error)?,
            )?,
            cost: register(
                &registry,
                GaugeVec::new(opts("cost_dollars", "RPC spend and savings"), &["kind"]).map_err(metric_error)?,
            )?,
            method_calls: register(
                &registry,
                IntGaugeVec::new(opts("method_calls", "Tracked RPC calls per method"), &["method", "cached"])
                    .map_err(metric_error)?,
            )?,
            registry,
        })
    }

    /// Copy the manager's current figures into the gauges
    pub fn update(&self, cache: &CacheManager) {
        let stats = cache.stats();
        self.requests.with_label_values(&["hit"]).set(stats.requests.hits as i64);
        self.requests.with_label_values(&["miss"]).set(stats.requests.misses as i64);
        self.hit_ratio.set(stats.hit_ratio);

        for (tier, t) in &stats.tiers {
            let tier = tier.as_str();
            self.tier_counts.with_label_values(&[tier, "hit"]).set(t.hits as i64);
            self.tier_counts.with_label_values(&[tier, "miss"]).set(t.misses as i64);
            self.tier_counts.with_label_values(&[tier, "eviction"]).set(t.evictions as i64);
            self.tier_bytes.with_label_values(&[tier, "bytes"]).set(t.total_size as i64);
            self.tier_bytes.with_label_values(&[tier, "items"]).set(t.item_count as i64);
            self.tier_latency.with_label_values(&[tier, "hit"]).set(t.avg_hit_time);
            self.tier_latency.with_label_values(&[tier, "miss"]).set(t.avg_miss_time);
        }

        for (name, d) in cache.dedup_stats() {
            self.dedup.with_label_values(&[name, "total"]).set(d.total_requests as i64);
            self.dedup.with_label_values(&[name, "joined"]).set(d.deduplicated_requests as i64);
            self.dedup.with_label_values(&[name, "reused"]).set(d.cache_hits as i64);
            self.dedup.with_label_values(&[name, "pending"]).set(d.pending_requests as i64);
        }

        if let Some(b) = cache.batch_stats() {
            self.batch.with_label_values(&["items"]).set(b.total_items as f64);
            self.batch.with_label_values(&["batches"]).set(b.total_batches as f64);
            self.batch.with_label_values(&["avg_size"]).set(b.avg_batch_size);
            self.batch.with_label_values(&["error_rate"]).set(b.error_rate);
            self.batch.with_label_values(&["pending"]).set(b.pending_items as f64);
        }

        if let Some(tracker) = cache.cost_tracker() {
            let summary = tracker.summary();
            self.cost.with_label_values(&["spent"]).set(summary.total_cost);
            self.cost.with_label_values(&["saved"]).set(summary.total_savings);
            self.cost
                .with_label_values(&["projected_monthly_savings"])
                .set(summary.projected_monthly_savings);

            for m in tracker.all_metrics() {
                self.method_calls
                    .with_label_values(&[m.method.as_str(), "true"])
                    .set(m.cached_calls as i64);
                self.method_calls
                    .with_label_values(&[m.method.as_str(), "false"])
                    .set((m.calls - m.cached_calls) as i64);
            }
        }
    }

    /// Text exposition of the registry
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| Error::Internal(format!("Failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(format!("Metrics are not UTF-8: {}", e)))
    }

    pub fn content_type(&self) -> &'static str {
        prometheus::TEXT_FORMAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{GetOptions, SetOptions};
    use crate::config::CacheConfig;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_render_after_traffic() {
        let cache = CacheManager::new(CacheConfig::default()).unwrap();
        cache
            .set("block", Bytes::from_static(b"0x10"), SetOptions::default().billable("eth_blockNumber"))
            .await
            .unwrap();
        cache.get("block", GetOptions::default()).await.unwrap();
        cache.get("nope", GetOptions::default()).await.unwrap();

        let exporter = MetricsExporter::new().unwrap();
        exporter.update(&cache);
        let text = exporter.render().unwrap();

        assert!(text.contains("tiercache_requests{outcome=\"hit\"} 1"));
        assert!(text.contains("tiercache_requests{outcome=\"miss\"} 1"));
        assert!(text.contains("tiercache_tier_occupancy{tier=\"fast\",unit=\"items\"} 1"));
        assert!(text.contains("tiercache_method_calls{cached=\"true\",method=\"eth_blockNumber\"} 1"));
    }

    #[test]
    fn test_exporters_are_independent() {
        // Private registries: two exporters never collide
        assert!(MetricsExporter::new().is_ok());
        assert!(MetricsExporter::new().is_ok());
    }
}
