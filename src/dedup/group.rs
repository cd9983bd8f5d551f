//! Namespaced deduplicators
//!
//! One independent [`Deduplicator`] per namespace (chain id, resource type,
//! ...), created on first use.

use std::collections::HashMap;

use dashmap::DashMap;

use super::{Deduplicator, DeduplicatorConfig, DeduplicatorStats};

pub struct DeduplicatorGroup<T: Clone> {
    config: DeduplicatorConfig,
    members: DashMap<String, Deduplicator<T>>,
}

impl<T> DeduplicatorGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DeduplicatorConfig) -> Self {
        Self {
            config,
            members: DashMap::new(),
        }
    }

    /// Deduplicator for `namespace`, created lazily
    pub fn get(&self, namespace: &str) -> Deduplicator<T> {
        if let Some(existing) = self.members.get(namespace) {
            return existing.clone();
        }
        self.members
            .entry(namespace.to_string())
            .or_insert_with(|| Deduplicator::with_config(self.config.clone()))
            .clone()
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.members.iter().map(|m| m.key().clone()).collect()
    }

    /// Clear every member's pending and completed state
    pub fn clear_all(&self) {
        for member in self.members.iter() {
            member.value().clear();
        }
    }

    pub fn stats(&self) -> HashMap<String, DeduplicatorStats> {
        self.members
            .iter()
            .map(|m| (m.key().clone(), m.value().stats()))
            .collect()
    }
}

impl<T> Default for DeduplicatorGroup<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(DeduplicatorConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_namespaces_are_independent() {
        let group: DeduplicatorGroup<String> = DeduplicatorGroup::default();
        let calls = Arc::new(AtomicUsize::new(0));

        for chain in ["eth:1", "eth:137"] {
            let calls = Arc::clone(&calls);
            let value = group
                .get(chain)
                .execute(
                    "eth_blockNumber",
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(format!("{}-head", chain))
                    },
                    None,
                )
                .await
                .unwrap();
            assert_eq!(value, format!("{}-head", chain));
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let mut names = group.namespaces();
        names.sort();
        assert_eq!(names, vec!["eth:1", "eth:137"]);
    }

    #[tokio::test]
    async fn test_same_namespace_shares_state() {
        let group: DeduplicatorGroup<u32> = DeduplicatorGroup::default();
        group.get("ipfs").execute("cid", || async { Ok(1) }, None).await.unwrap();

        let reused = group.get("ipfs").execute("cid", || async { Ok(2) }, None).await.unwrap();
        assert_eq!(reused, 1);
        assert_eq!(group.stats()["ipfs"].cache_hits, 1);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let group: DeduplicatorGroup<u32> = DeduplicatorGroup::default();
        group.get("a").execute("k", || async { Ok(1) }, None).await.unwrap();
        group.get("b").execute("k", || async { Ok(1) }, None).await.unwrap();

        group.clear_all();
        assert!(group.stats().values().all(|s| s.cached_results == 0));
    }
}
