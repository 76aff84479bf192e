//! Durable, time-ordered retry store
//!
//! A sorted set of `(score, member)` pairs. Both mutating primitives run as
//! single Lua scripts so concurrent consumers and dispatchers never observe
//! a half-applied state:
//! - `push_bounded` checks cardinality and adds in one step, so the cap holds
//!   under concurrent pushes
//! - `pop_due` reads and removes due members in one step, so a member is
//!   returned by at most one pop

use crate::error::StoreError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

/// Result of a capacity-bounded push
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Stored { size: u64 },
    AtCapacity { size: u64 },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RetryStore: Send + Sync {
    /// Add a member unconditionally
    async fn push(&self, score: i64, member: &str) -> Result<(), StoreError>;

    /// Add a member only while the store holds fewer than `capacity` members
    async fn push_bounded(
        &self,
        score: i64,
        member: &str,
        capacity: u64,
    ) -> Result<PushOutcome, StoreError>;

    /// Remove and return up to `limit` members with `score <= max_score`, lowest score first
    async fn pop_due(&self, max_score: i64, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Current cardinality
    async fn len(&self) -> Result<u64, StoreError>;

    /// Identifier used in logs and metrics labels
    fn name(&self) -> &str;
}

const PUSH_BOUNDED_SCRIPT: &str = r#"
local size = redis.call('ZCARD', KEYS[1])
if size >= tonumber(ARGV[3]) then
    return {0, size}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[2])
return {1, size + 1}
"#;

const POP_DUE_SCRIPT: &str = r#"
local items = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
if #items > 0 then
    redis.call('ZREM', KEYS[1], unpack(items))
end
return items
"#;

/// Redis sorted-set retry store.
#[derive(Clone)]
pub struct RedisRetryStore {
    redis: ConnectionManager,
    key: String,
}

impl RedisRetryStore {
    pub fn new(redis: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            redis,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

#[async_trait]
impl RetryStore for RedisRetryStore {
    async fn push(&self, score: i64, member: &str) -> Result<(), StoreError> {
        let mut conn = self.redis.clone();
        let _: i64 = conn.zadd(&self.key, member, score).await?;
        Ok(())
    }

    async fn push_bounded(
        &self,
        score: i64,
        member: &str,
        capacity: u64,
    ) -> Result<PushOutcome, StoreError> {
        let mut conn = self.redis.clone();

        let (stored, size): (i64, u64) = redis::Script::new(PUSH_BOUNDED_SCRIPT)
            .key(&self.key)
            .arg(score)
            .arg(member)
            .arg(capacity)
            .invoke_async(&mut conn)
            .await?;

        debug!(key = %self.key, stored = stored == 1, size, "Bounded push");

        Ok(if stored == 1 {
            PushOutcome::Stored { size }
        } else {
            PushOutcome::AtCapacity { size }
        })
    }

    async fn pop_due(&self, max_score: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.redis.clone();
        let members: Vec<String> = redis::Script::new(POP_DUE_SCRIPT)
            .key(&self.key)
            .arg(max_score)
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        Ok(members)
    }

    async fn len(&self) -> Result<u64, StoreError> {
        let mut conn = self.redis.clone();
        let size: u64 = conn.zcard(&self.key).await?;
        Ok(size)
    }

    fn name(&self) -> &str {
        &self.key
    }
}
