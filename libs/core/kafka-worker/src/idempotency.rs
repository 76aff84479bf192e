//! Advisory "already handled?" guard for consumer handlers.
//!
//! Check and mark are separate calls, so two concurrent redeliveries of the
//! same id may both pass the check. Handlers keep their side effects safe to
//! apply twice; the guard only saves redundant work and duplicate outward
//! notifications.

use crate::cache::KeyValueCache;
use crate::error::StoreError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const DEFAULT_PREFIX: &str = "processed";
const MARKER: &str = "1";

/// Business id qualified by the operation that handled it, so different
/// consumer types never collide on the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    namespace: String,
    id: String,
}

impl IdempotencyKey {
    pub fn new(namespace: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            id: id.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn id(&self) -> &str {
        &self.id
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.id)
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    cache: Arc<dyn KeyValueCache>,
    prefix: String,
}

impl IdempotencyGuard {
    pub fn new(cache: Arc<dyn KeyValueCache>) -> Self {
        Self {
            cache,
            prefix: DEFAULT_PREFIX.to_string(),
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Storage key, `processed:{namespace}:{id}`
    pub fn storage_key(&self, key: &IdempotencyKey) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn is_processed(&self, key: &IdempotencyKey) -> Result<bool, StoreError> {
        let processed = self.cache.exists(&self.storage_key(key)).await?;
        if processed {
            debug!(key = %key, "Already processed");
        }
        Ok(processed)
    }

    /// `ttl` should outlive the window in which this message class can be redelivered or retried
    pub async fn mark_processed(
        &self,
        key: &IdempotencyKey,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.cache.set(&self.storage_key(key), MARKER, ttl).await
    }
}
