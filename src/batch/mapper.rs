//! Pairing processor results back to batch items

use std::collections::HashMap;
use std::sync::Arc;

type KeyFn<V> = Arc<dyn Fn(&V) -> String + Send + Sync>;
type CustomFn<T, R> = Arc<dyn Fn(&[T], Vec<R>) -> Vec<Option<R>> + Send + Sync>;

/// How `results` from one processor call map onto `items`.
///
/// Every item gets `Some(result)` or `None`; `None` becomes
/// [`Error::MissingResult`](crate::error::Error::MissingResult) for that item.
pub enum ResultMapper<T, R> {
    /// `results[i]` belongs to `items[i]`
    Positional,
    /// Match on a key derived from both sides
    ByKey {
        key_extractor: KeyFn<T>,
        result_key: KeyFn<R>,
    },
    Custom(CustomFn<T, R>),
}

impl<T, R> Clone for ResultMapper<T, R> {
    fn clone(&self) -> Self {
        match self {
            ResultMapper::Positional => ResultMapper::Positional,
            ResultMapper::ByKey {
                key_extractor,
                result_key,
            } => ResultMapper::ByKey {
                key_extractor: Arc::clone(key_extractor),
                result_key: Arc::clone(result_key),
            },
            ResultMapper::Custom(f) => ResultMapper::Custom(Arc::clone(f)),
        }
    }
}

impl<T, R> Default for ResultMapper<T, R> {
    fn default() -> Self {
        ResultMapper::Positional
    }
}

impl<T, R> std::fmt::Debug for ResultMapper<T, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            ResultMapper::Positional => "Positional",
            ResultMapper::ByKey { .. } => "ByKey",
            ResultMapper::Custom(_) => "Custom",
        };
        f.write_str(kind)
    }
}

impl<T, R> ResultMapper<T, R> {
    pub fn by_key<K, Q>(key_extractor: K, result_key: Q) -> Self
    where
        K: Fn(&T) -> String + Send + Sync + 'static,
        Q: Fn(&R) -> String + Send + Sync + 'static,
    {
        ResultMapper::ByKey {
            key_extractor: Arc::new(key_extractor),
            result_key: Arc::new(result_key),
        }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&[T], Vec<R>) -> Vec<Option<R>> + Send + Sync + 'static,
    {
        ResultMapper::Custom(Arc::new(f))
    }

    /// One slot per item, in item order
    pub fn map(&self, items: &[T], results: Vec<R>) -> Vec<Option<R>>
    where
        R: Clone,
    {
        let mut mapped = match self {
            ResultMapper::Positional => {
                let mut results: Vec<Option<R>> = results.into_iter().map(Some).collect();
                results.truncate(items.len());
                results
            }
            ResultMapper::ByKey {
                key_extractor,
                result_key,
            } => {
                let by_key: HashMap<String, R> =
                    results.into_iter().map(|r| (result_key(&r), r)).collect();
                // Items sharing a key share the result
                items
                    .iter()
                    .map(|item| by_key.get(&key_extractor(item)).cloned())
                    .collect()
            }
            ResultMapper::Custom(f) => f(items, results),
        };
        mapped.resize_with(items.len(), || None);
        mapped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positional_pads_missing() {
        let mapper: ResultMapper<u32, u32> = ResultMapper::default();
        assert_eq!(mapper.map(&[1, 2, 3], vec![10, 20]), vec![Some(10), Some(20), None]);
        assert_eq!(mapper.map(&[1], vec![10, 20]), vec![Some(10)]);
    }

    #[test]
    fn test_by_key_reorders() {
        let mapper: ResultMapper<String, (String, u64)> =
            ResultMapper::by_key(|addr: &String| addr.clone(), |(addr, _): &(String, u64)| addr.clone());

        let items = vec!["0xa".to_string(), "0xb".to_string(), "0xc".to_string()];
        let results = vec![("0xc".to_string(), 3), ("0xa".to_string(), 1)];

        let mapped = mapper.map(&items, results);
        assert_eq!(mapped[0], Some(("0xa".to_string(), 1)));
        assert_eq!(mapped[1], None);
        assert_eq!(mapped[2], Some(("0xc".to_string(), 3)));
    }

    #[test]
    fn test_custom_is_normalized_to_item_count() {
        let mapper: ResultMapper<u32, u32> = ResultMapper::custom(|_, results| vec![results.first().copied()]);
        assert_eq!(mapper.map(&[1, 2], vec![5]), vec![Some(5), None]);
    }
}
