//! End-to-end delivery scenarios over the in-memory broker and stores

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use kafka_worker::testing::{InMemoryBroker, InMemoryCache, InMemoryRetryStore};
use kafka_worker::{
    ConsumerConfig, ConsumerManager, DlqReason, HandlerError, IdempotencyGuard, IdempotencyKey,
    InboundMessage, KeyValueCache, MessageHandler, MessageHeaders, MessagePublisher,
    OutboundMessage, ResultCache, RetryConfig, RetryDispatcher, RetryEnvelope, RetryOutcome,
    RetryScheduler, RetryStore,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_utils::assertions::{assert_some, assert_within};

const DLQ: &str = "dlq-queue";
const TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmissionJob {
    submission_id: String,
}

/// Fails the first `failures` attempts, then marks the submission processed
struct FlakyJobHandler {
    failures: usize,
    attempts: Arc<AtomicUsize>,
    guard: IdempotencyGuard,
}

#[async_trait]
impl MessageHandler for FlakyJobHandler {
    type Payload = SubmissionJob;

    fn name(&self) -> &'static str {
        "flaky-job"
    }

    async fn handle(&self, job: SubmissionJob, _: &InboundMessage) -> Result<(), HandlerError> {
        let key = IdempotencyKey::new("submission", &job.submission_id);
        if self.guard.is_processed(&key).await? {
            return Ok(());
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.failures {
            return Err(HandlerError::new(format!("attempt {attempt} failed")));
        }

        self.guard.mark_processed(&key, TTL).await?;
        Ok(())
    }
}

async fn wait_for_commit(broker: &InMemoryBroker, group_id: &str, topic: &str, offset: i64) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while broker.committed_offset(group_id, topic).await != Some(offset) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("offset was not committed in time");
}

fn failed_message(topic: &str, key: &str) -> InboundMessage {
    InboundMessage {
        topic: topic.to_string(),
        partition: 0,
        offset: 0,
        key: Some(key.to_string()),
        payload: Some(format!(r#"{{"submissionId":"{key}"}}"#).into_bytes()),
        headers: MessageHeaders::default(),
    }
}

#[tokio::test]
async fn test_fails_twice_then_succeeds_through_retry_store() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
    let cache = Arc::new(InMemoryCache::new());
    let attempts = Arc::new(AtomicUsize::new(0));

    let config = RetryConfig::default();
    let manager = ConsumerManager::new(
        store.clone(),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        &config,
        ConsumerConfig::default().with_restart_backoff(Duration::from_millis(10)),
    );
    let handler = FlakyJobHandler {
        failures: 2,
        attempts: attempts.clone(),
        guard: IdempotencyGuard::new(cache.clone()),
    };
    manager
        .create_consumer("cm-submission-jobs", "submission.jobs", handler, DLQ)
        .await;

    broker
        .publish(
            "submission.jobs",
            OutboundMessage::json(&SubmissionJob {
                submission_id: "sub-1".into(),
            })
            .unwrap()
            .with_key("sub-1"),
        )
        .await
        .unwrap();

    let dispatcher = manager.dispatcher();
    for committed in 1..=2 {
        // the envelope is stored before the offset is committed
        wait_for_commit(&broker, "cm-submission-jobs", "submission.jobs", committed).await;
        assert_eq!(store.len().await.unwrap(), 1);

        let report = dispatcher.tick_at(i64::MAX).await.unwrap().unwrap();
        assert_eq!(report.republished, 1);
    }

    wait_for_commit(&broker, "cm-submission-jobs", "submission.jobs", 3).await;
    manager.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert!(cache.exists("processed:submission:sub-1").await.unwrap());
    assert_eq!(cache.writes().await, 1);
    assert!(broker.messages(DLQ).await.is_empty());
    assert_eq!(store.len().await.unwrap(), 0);

    let deliveries = broker.messages("submission.jobs").await;
    let counts: Vec<Option<u32>> = deliveries.iter().map(|m| m.headers.retry_count).collect();
    assert_eq!(counts, vec![None, Some(1), Some(2)]);
    assert!(deliveries.iter().all(|m| m.key.as_deref() == Some("sub-1")));
    assert_eq!(deliveries[1].headers.first_seen, deliveries[2].headers.first_seen);
}

#[tokio::test]
async fn test_retry_store_cap_holds_under_simultaneous_failures() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
    let scheduler = RetryScheduler::new(
        store.clone(),
        Arc::new(broker.clone()),
        &RetryConfig::default().with_queue_capacity(2),
    );

    let messages: Vec<InboundMessage> = (1..=3)
        .map(|i| failed_message("submission.results", &format!("sub-{i}")))
        .collect();
    let outcomes = join_all(
        messages
            .iter()
            .map(|m| scheduler.schedule_retry(m, DLQ)),
    )
    .await;

    let shed = outcomes
        .iter()
        .filter(|o| matches!(o, Ok(RetryOutcome::Shed { .. })))
        .count();
    assert_eq!(shed, 1);
    assert_eq!(store.len().await.unwrap(), 2);

    let dead = broker.messages(DLQ).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers.error, Some(DlqReason::RetryQueueCapacity));
}

#[tokio::test]
async fn test_next_retry_at_within_backoff_window() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
    let config = RetryConfig::default();
    let scheduler = RetryScheduler::new(store.clone(), Arc::new(broker), &config);
    let policy = config.backoff_policy();

    for retry_count in 0..3u32 {
        let mut message = failed_message("run.results", "t-1");
        message.headers = message.headers.with_retry_count(retry_count);

        let before = Utc::now().timestamp();
        scheduler.schedule_retry(&message, DLQ).await.unwrap();
        let after = Utc::now().timestamp();

        let envelope = assert_some(
            store
                .envelopes()
                .await
                .into_iter()
                .find(|e| e.headers.retry_count == Some(retry_count + 1)),
            "envelope for this attempt",
        );
        let base = policy.base_delay(retry_count).as_secs() as i64;
        let jitter = policy.max_jitter(retry_count).as_secs_f64().ceil() as i64;

        assert_within(
            envelope.next_retry_at,
            before + base,
            after + base + jitter,
            "next_retry_at",
        );
    }
}

#[tokio::test]
async fn test_exhausted_message_is_not_enqueued() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
    let scheduler = RetryScheduler::new(
        store.clone(),
        Arc::new(broker.clone()),
        &RetryConfig::default(),
    );

    let mut message = failed_message("custom.results", "t-4");
    message.headers = message.headers.with_retry_count(3).with_first_seen(17);

    let outcome = scheduler.schedule_retry(&message, DLQ).await.unwrap();

    assert_eq!(outcome, RetryOutcome::Exhausted { retry_count: 3 });
    assert_eq!(store.len().await.unwrap(), 0);
    let dead = broker.messages(DLQ).await;
    assert_eq!(dead[0].headers.error, Some(DlqReason::RetriesExhausted));
    assert_eq!(dead[0].headers.retry_count, Some(3));
    assert_eq!(dead[0].headers.first_seen, Some(17));
}

#[tokio::test]
async fn test_concurrent_dispatchers_redeliver_each_envelope_once() {
    let broker = InMemoryBroker::new();
    let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
    for i in 0..60 {
        let envelope = RetryEnvelope::new(
            &failed_message("run.results", &format!("t-{i}")),
            MessageHeaders::new().with_retry_count(1),
            i,
        );
        store.push(i, &envelope.encode().unwrap()).await.unwrap();
    }

    let config = RetryConfig::default().with_batch_size(7);
    let dispatchers: Vec<Arc<RetryDispatcher>> = (0..2)
        .map(|_| {
            Arc::new(RetryDispatcher::new(
                store.clone(),
                Arc::new(broker.clone()),
                &config,
            ))
        })
        .collect();

    let runs = dispatchers.iter().cloned().map(|dispatcher| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut republished = 0;
            while store.len().await.unwrap() > 0 {
                if let Some(report) = dispatcher.tick_at(1_000).await.unwrap() {
                    republished += report.republished;
                }
                tokio::task::yield_now().await;
            }
            republished
        })
    });
    let total: usize = join_all(runs).await.into_iter().map(|r| r.unwrap()).sum();

    let delivered = broker.messages("run.results").await;
    let keys: HashSet<_> = delivered.iter().filter_map(|m| m.key.clone()).collect();
    assert_eq!(total, 60);
    assert_eq!(delivered.len(), 60);
    assert_eq!(keys.len(), 60);
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunResult {
    temp_id: String,
    status: String,
}

struct CachingHandler {
    guard: IdempotencyGuard,
    results: ResultCache,
    notified: Arc<AtomicUsize>,
}

#[async_trait]
impl MessageHandler for CachingHandler {
    type Payload = RunResult;

    fn name(&self) -> &'static str {
        "caching"
    }

    async fn handle(&self, result: RunResult, _: &InboundMessage) -> Result<(), HandlerError> {
        let key = IdempotencyKey::new("run", &result.temp_id);
        if self.guard.is_processed(&key).await? {
            return Ok(());
        }
        self.results
            .set(&format!("run:normal:{}", result.temp_id), &result, TTL)
            .await?;
        self.notified.fetch_add(1, Ordering::SeqCst);
        self.guard.mark_processed(&key, TTL).await?;
        Ok(())
    }
}

#[tokio::test]
async fn test_duplicate_delivery_is_short_circuited() {
    let broker = InMemoryBroker::new();
    let cache = Arc::new(InMemoryCache::new());
    let notified = Arc::new(AtomicUsize::new(0));
    let manager = ConsumerManager::new(
        Arc::new(InMemoryRetryStore::new("retry-queue")),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        &RetryConfig::default(),
        ConsumerConfig::default(),
    );
    manager
        .create_consumer(
            "cm-run-results",
            "run.results",
            CachingHandler {
                guard: IdempotencyGuard::new(cache.clone()),
                results: ResultCache::new(cache.clone()),
                notified: notified.clone(),
            },
            DLQ,
        )
        .await;

    let result = RunResult {
        temp_id: "t-1".into(),
        status: "Success".into(),
    };
    for _ in 0..2 {
        broker
            .publish("run.results", OutboundMessage::json(&result).unwrap())
            .await
            .unwrap();
    }

    wait_for_commit(&broker, "cm-run-results", "run.results", 2).await;
    manager.shutdown(Duration::from_secs(1)).await.unwrap();

    // one result write plus one processed marker
    assert_eq!(cache.writes().await, 2);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_resent_batch_is_absorbed_by_idempotent_consumer() {
    let broker = InMemoryBroker::new();
    let cache = Arc::new(InMemoryCache::new());
    let notified = Arc::new(AtomicUsize::new(0));
    let manager = ConsumerManager::new(
        Arc::new(InMemoryRetryStore::new("retry-queue")),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        &RetryConfig::default(),
        ConsumerConfig::default(),
    );
    manager
        .create_consumer(
            "cm-run-results",
            "run.results",
            CachingHandler {
                guard: IdempotencyGuard::new(cache.clone()),
                results: ResultCache::new(cache.clone()),
                notified: notified.clone(),
            },
            DLQ,
        )
        .await;

    let batch = || {
        ["t-1", "t-2"]
            .into_iter()
            .map(|id| {
                OutboundMessage::json(&RunResult {
                    temp_id: id.into(),
                    status: "Success".into(),
                })
                .unwrap()
                .with_key(id)
            })
            .collect::<Vec<_>>()
    };
    // a batch reported as failed is resent whole, including what already landed
    broker.publish_batch("run.results", batch()).await.unwrap();
    broker.publish_batch("run.results", batch()).await.unwrap();

    wait_for_commit(&broker, "cm-run-results", "run.results", 4).await;
    manager.shutdown(Duration::from_secs(1)).await.unwrap();

    assert_eq!(notified.load(Ordering::SeqCst), 2);
    assert_eq!(cache.writes().await, 4);
}

#[tokio::test]
async fn test_parse_failure_advances_offset_by_one() {
    let broker = InMemoryBroker::new();
    let manager = ConsumerManager::new(
        Arc::new(InMemoryRetryStore::new("retry-queue")),
        Arc::new(broker.clone()),
        Arc::new(broker.clone()),
        &RetryConfig::default(),
        ConsumerConfig::default(),
    );
    manager
        .create_consumer(
            "cm-submission-jobs",
            "submission.jobs",
            FlakyJobHandler {
                failures: 0,
                attempts: Arc::new(AtomicUsize::new(0)),
                guard: IdempotencyGuard::new(Arc::new(InMemoryCache::new())),
            },
            DLQ,
        )
        .await;

    broker
        .publish("submission.jobs", OutboundMessage::new("{\"submission"))
        .await
        .unwrap();

    wait_for_commit(&broker, "cm-submission-jobs", "submission.jobs", 1).await;
    manager.shutdown(Duration::from_secs(1)).await.unwrap();

    let dead = broker.messages(DLQ).await;
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].headers.error, Some(DlqReason::ParseFailure));
    assert_eq!(dead[0].payload.as_deref(), Some(&b"{\"submission"[..]));
}
