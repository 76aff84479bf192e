//! In-memory doubles for the delivery core's seams
//!
//! Used by this crate's tests and by services that want to exercise handlers
//! end to end without a broker or Redis:
//! - `InMemoryBroker`: publisher and consumer connector over per-topic logs with group offsets
//! - `InMemoryRetryStore`: atomic sorted-set store with an outage switch
//! - `InMemoryCache`: TTL cache driven by the tokio clock
//! - `InMemoryAdmin`: topic registry

use crate::admin::{BrokerAdmin, TopicProvision};
use crate::cache::KeyValueCache;
use crate::consumer::{MessageSource, SourceConnector};
use crate::error::{AdminError, ConsumerError, DeliveryError, StoreError};
use crate::message::{InboundMessage, OutboundMessage, RetryEnvelope};
use crate::producer::MessagePublisher;
use crate::retry_store::{PushOutcome, RetryStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

#[derive(Default)]
struct BrokerState {
    logs: HashMap<String, Vec<InboundMessage>>,
    committed: HashMap<(String, String), i64>,
    failing: HashSet<String>,
    /// Commits still to reject
    failing_commits: usize,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    appended: Notify,
}

/// Single-partition broker. Offsets are positions in the topic log.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything published to `topic`, in order
    pub async fn messages(&self, topic: &str) -> Vec<InboundMessage> {
        let state = self.inner.state.lock().await;
        state.logs.get(topic).cloned().unwrap_or_default()
    }

    /// Next offset the group will read, if it ever committed
    pub async fn committed_offset(&self, group_id: &str, topic: &str) -> Option<i64> {
        let state = self.inner.state.lock().await;
        state
            .committed
            .get(&(group_id.to_string(), topic.to_string()))
            .copied()
    }

    /// Reject every publish to `topic` until healed
    pub async fn fail_topic(&self, topic: &str) {
        self.inner.state.lock().await.failing.insert(topic.to_string());
    }

    pub async fn heal_topic(&self, topic: &str) {
        self.inner.state.lock().await.failing.remove(topic);
    }

    /// Reject the next `count` offset commits from any group
    pub async fn fail_next_commits(&self, count: usize) {
        self.inner.state.lock().await.failing_commits = count;
    }

    fn append(state: &mut BrokerState, topic: &str, message: OutboundMessage) {
        let log = state.logs.entry(topic.to_string()).or_default();
        log.push(InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: log.len() as i64,
            key: message.key,
            payload: Some(message.payload),
            headers: message.headers,
        });
    }

    fn rejected(topic: &str) -> DeliveryError {
        DeliveryError::Rejected {
            topic: topic.to_string(),
            reason: "topic marked as failing".to_string(),
        }
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), DeliveryError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.failing.contains(topic) {
                return Err(Self::rejected(topic));
            }
            Self::append(&mut state, topic, message);
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<(), DeliveryError> {
        {
            let mut state = self.inner.state.lock().await;
            if state.failing.contains(topic) {
                return Err(DeliveryError::BatchFailed {
                    topic: topic.to_string(),
                    failed: messages.len(),
                    total: messages.len(),
                    reason: "topic marked as failing".to_string(),
                });
            }
            for message in messages {
                Self::append(&mut state, topic, message);
            }
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl SourceConnector for InMemoryBroker {
    async fn connect(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Box<dyn MessageSource>, ConsumerError> {
        let position = self.committed_offset(group_id, topic).await.unwrap_or(0);
        Ok(Box::new(InMemorySource {
            broker: self.clone(),
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            position,
        }))
    }
}

struct InMemorySource {
    broker: InMemoryBroker,
    group_id: String,
    topic: String,
    position: i64,
}

#[async_trait]
impl MessageSource for InMemorySource {
    async fn recv(&mut self) -> Result<InboundMessage, ConsumerError> {
        loop {
            let appended = self.broker.inner.appended.notified();
            {
                let state = self.broker.inner.state.lock().await;
                let next = state
                    .logs
                    .get(&self.topic)
                    .and_then(|log| log.get(self.position as usize));
                if let Some(message) = next {
                    self.position += 1;
                    return Ok(message.clone());
                }
            }
            appended.await;
        }
    }

    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumerError> {
        let mut state = self.broker.inner.state.lock().await;
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(ConsumerError::Commit("commit rejected by broker".to_string()));
        }
        state.committed.insert(
            (self.group_id.clone(), message.topic.clone()),
            message.next_offset(),
        );
        Ok(())
    }
}

#[derive(Default)]
struct RetryState {
    /// member -> score
    members: HashMap<String, i64>,
    failing: bool,
}

/// Sorted-set retry store; every operation holds one lock, so each is atomic
pub struct InMemoryRetryStore {
    name: String,
    state: Mutex<RetryState>,
}

impl InMemoryRetryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(RetryState::default()),
        }
    }

    /// Simulate the store being unreachable
    pub async fn set_failing(&self, failing: bool) {
        self.state.lock().await.failing = failing;
    }

    /// Stored envelopes, lowest score first. Members that are not envelopes are skipped.
    pub async fn envelopes(&self) -> Vec<RetryEnvelope> {
        let state = self.state.lock().await;
        let mut entries: Vec<(&i64, &String)> =
            state.members.iter().map(|(m, s)| (s, m)).collect();
        entries.sort();
        entries
            .into_iter()
            .filter_map(|(_, member)| RetryEnvelope::decode(member).ok())
            .collect()
    }

    fn check(state: &RetryState) -> Result<(), StoreError> {
        if state.failing {
            return Err(StoreError::Unavailable("retry store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RetryStore for InMemoryRetryStore {
    async fn push(&self, score: i64, member: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;
        state.members.insert(member.to_string(), score);
        Ok(())
    }

    async fn push_bounded(
        &self,
        score: i64,
        member: &str,
        capacity: u64,
    ) -> Result<PushOutcome, StoreError> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;

        let size = state.members.len() as u64;
        if size >= capacity {
            return Ok(PushOutcome::AtCapacity { size });
        }
        state.members.insert(member.to_string(), score);
        Ok(PushOutcome::Stored {
            size: state.members.len() as u64,
        })
    }

    async fn pop_due(&self, max_score: i64, limit: usize) -> Result<Vec<String>, StoreError> {
        let mut state = self.state.lock().await;
        Self::check(&state)?;

        let mut due: Vec<(i64, String)> = state
            .members
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(member, score)| (*score, member.clone()))
            .collect();
        due.sort();
        due.truncate(limit);

        for (_, member) in &due {
            state.members.remove(member);
        }
        Ok(due.into_iter().map(|(_, member)| member).collect())
    }

    async fn len(&self) -> Result<u64, StoreError> {
        let state = self.state.lock().await;
        Self::check(&state)?;
        Ok(state.members.len() as u64)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// TTL cache; expiry follows `tokio::time`, so paused-clock tests can advance it
#[derive(Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
    writes: Mutex<usize>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `set` calls so far
    pub async fn writes(&self) -> usize {
        *self.writes.lock().await
    }
}

#[async_trait]
impl KeyValueCache for InMemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        let expired = matches!(entries.get(key), Some((_, at)) if *at <= Instant::now());
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|(value, _)| value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = Instant::now() + Duration::from_secs(crate::cache::ttl_secs(ttl));
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), expires_at));
        *self.writes.lock().await += 1;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.entries.lock().await.remove(key);
        Ok(matches!(removed, Some((_, expires_at)) if expires_at > Instant::now()))
    }

    async fn take(&self, key: &str) -> Result<Option<String>, StoreError> {
        let removed = self.entries.lock().await.remove(key);
        Ok(removed
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(value, _)| value))
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.get(key).await?.is_some())
    }
}

/// Topic registry with broker-like "already exists" behavior
#[derive(Default)]
pub struct InMemoryAdmin {
    topics: Mutex<HashMap<String, (i32, i32)>>,
}

impl InMemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisioned topics as `(name, partitions, replication_factor)`, sorted by name
    pub async fn topics(&self) -> Vec<(String, i32, i32)> {
        let topics = self.topics.lock().await;
        let mut all: Vec<_> = topics
            .iter()
            .map(|(name, (p, rf))| (name.clone(), *p, *rf))
            .collect();
        all.sort();
        all
    }
}

#[async_trait]
impl BrokerAdmin for InMemoryAdmin {
    async fn ensure_topic(
        &self,
        name: &str,
        partitions: i32,
        replication_factor: i32,
    ) -> Result<TopicProvision, AdminError> {
        if partitions < 1 || replication_factor < 1 {
            return Err(AdminError::CreateTopic {
                topic: name.to_string(),
                reason: "invalid partition count or replication factor".to_string(),
            });
        }

        let mut topics = self.topics.lock().await;
        if topics.contains_key(name) {
            return Ok(TopicProvision::AlreadyExists);
        }
        topics.insert(name.to_string(), (partitions, replication_factor));
        Ok(TopicProvision::Created)
    }
}
