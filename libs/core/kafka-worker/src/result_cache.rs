//! TTL-keyed store for consumed results, handed out once by the pull API.

use crate::cache::KeyValueCache;
use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct ResultCache {
    cache: Arc<dyn KeyValueCache>,
}

impl ResultCache {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self { cache }
    }

    pub async fn set<T: Serialize + Sync>(
        &self,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_string(value)?;
        self.cache.set(key, &encoded, ttl).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.cache.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Remove `key`. `false` means it was already gone, e.g. taken by a concurrent reader.
    pub async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.cache.delete(key).await
    }

    /// Atomically read and remove `key`
    pub async fn take<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        match self.cache.take(key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCache;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Outcome {
        id: String,
        passed: u32,
    }

    #[tokio::test]
    async fn test_set_get_delete() {
        let cache = ResultCache::new(Arc::new(InMemoryCache::new()));
        let outcome = Outcome {
            id: "sub-1".into(),
            passed: 4,
        };

        cache
            .set("submission:normal:sub-1", &outcome, Duration::from_secs(300))
            .await
            .unwrap();

        let fetched: Option<Outcome> = cache.get("submission:normal:sub-1").await.unwrap();
        assert_eq!(fetched, Some(outcome));

        assert!(cache.delete("submission:normal:sub-1").await.unwrap());
        let gone: Option<Outcome> = cache.get("submission:normal:sub-1").await.unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn test_take_hands_value_out_once() {
        let cache = ResultCache::new(Arc::new(InMemoryCache::new()));
        let outcome = Outcome {
            id: "t-1".into(),
            passed: 1,
        };
        cache
            .set("custom:normal:t-1", &outcome, Duration::from_secs(300))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            cache.take::<Outcome>("custom:normal:t-1"),
            cache.take::<Outcome>("custom:normal:t-1"),
        );
        let taken: Vec<Outcome> = [first.unwrap(), second.unwrap()]
            .into_iter()
            .flatten()
            .collect();
        assert_eq!(taken, vec![outcome]);
        assert!(!cache.delete("custom:normal:t-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_an_error() {
        let raw = Arc::new(InMemoryCache::new());
        raw.set("k", "not json", Duration::from_secs(5)).await.unwrap();

        let cache = ResultCache::new(raw);
        let result: Result<Option<Outcome>, _> = cache.get("k").await;
        assert!(matches!(result, Err(StoreError::Serialization(_))));
    }
}
