//! Retry dispatcher
//!
//! Background poller that moves due envelopes out of the retry store and back
//! onto their original topic. Each tick:
//!
//! 1. is skipped if the previous tick is still draining (non-reentrant flag)
//! 2. atomically pops up to `batch_size` envelopes with `score <= now`
//! 3. republishes each envelope verbatim to its `original_topic`
//!
//! An envelope that cannot be decoded or republished goes to the DLQ with
//! `x-error=retry-worker-failed`. If even that publish fails, the raw member
//! is pushed back with `score = now`, so no popped envelope disappears
//! untracked. Redelivery is at-most-once per envelope; a failure downstream
//! creates a fresh envelope through the consumer's scheduler.
//!
//! Several dispatcher processes may share one store: the atomic pop hands each
//! envelope to exactly one of them.

use crate::config::RetryConfig;
use crate::error::StoreError;
use crate::headers::{DlqReason, MessageHeaders};
use crate::message::{OutboundMessage, RetryEnvelope};
use crate::metrics::{self, DeliveryMetrics};
use crate::producer::MessagePublisher;
use crate::retry_store::RetryStore;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What a single tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub popped: usize,
    pub republished: usize,
    pub dead_lettered: usize,
    /// Envelopes pushed back because neither the republish nor the DLQ publish succeeded
    pub requeued: usize,
}

pub struct RetryDispatcher {
    store: Arc<dyn RetryStore>,
    publisher: Arc<dyn MessagePublisher>,
    dlq_topic: String,
    batch_size: usize,
    poll_interval: Duration,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when the tick ends, including on early return
struct TickGuard<'a>(&'a AtomicBool);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RetryDispatcher {
    pub fn new(
        store: Arc<dyn RetryStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: &RetryConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            dlq_topic: config.dlq_topic.clone(),
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
            in_flight: AtomicBool::new(false),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Run one tick at the current time. `None` means the tick was skipped.
    pub async fn try_tick(&self) -> Result<Option<TickReport>, StoreError> {
        self.tick_at(Utc::now().timestamp()).await
    }

    /// Run one tick treating `now` (epoch seconds) as the current time
    pub async fn tick_at(&self, now: i64) -> Result<Option<TickReport>, StoreError> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            metrics::retry_tick_skipped();
            debug!(queue = %self.store.name(), "Previous retry tick still running, skipping");
            return Ok(None);
        }
        let _guard = TickGuard(&self.in_flight);

        let members = self.store.pop_due(now, self.batch_size).await?;
        let mut report = TickReport {
            popped: members.len(),
            ..Default::default()
        };

        for member in members {
            self.dispatch_one(&member, now, &mut report).await;
        }

        if report.popped > 0 {
            info!(
                queue = %self.store.name(),
                popped = report.popped,
                republished = report.republished,
                dead_lettered = report.dead_lettered,
                requeued = report.requeued,
                "Retry tick complete"
            );
        }

        if let Ok(size) = self.store.len().await {
            metrics::retry_queue_size(self.store.name(), size);
        }

        Ok(Some(report))
    }

    async fn dispatch_one(&self, member: &str, now: i64, report: &mut TickReport) {
        let envelope = match RetryEnvelope::decode(member) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(queue = %self.store.name(), error = %e, "Undecodable retry envelope");
                let dead = OutboundMessage::dead_letter(
                    None,
                    member.as_bytes().to_vec(),
                    MessageHeaders::default(),
                    DlqReason::RetryWorkerFailed,
                );
                self.dead_letter_or_requeue(self.store.name(), dead, member, now, report)
                    .await;
                return;
            }
        };

        let topic = envelope.original_topic.as_str();
        match self.publisher.publish(topic, envelope.to_outbound()).await {
            Ok(()) => {
                DeliveryMetrics::new(topic).retry_dispatched();
                report.republished += 1;
                debug!(
                    topic = %topic,
                    key = ?envelope.key,
                    retry_count = envelope.headers.retry_count(),
                    "Redelivered retry envelope"
                );
            }
            Err(e) => {
                warn!(topic = %topic, key = ?envelope.key, error = %e, "Republish failed");
                let dead = OutboundMessage::dead_letter(
                    envelope.key.clone(),
                    envelope.value.clone(),
                    envelope.headers.clone(),
                    DlqReason::RetryWorkerFailed,
                );
                self.dead_letter_or_requeue(topic, dead, member, now, report)
                    .await;
            }
        }
    }

    async fn dead_letter_or_requeue(
        &self,
        source_topic: &str,
        dead: OutboundMessage,
        member: &str,
        now: i64,
        report: &mut TickReport,
    ) {
        match self.publisher.publish(&self.dlq_topic, dead).await {
            Ok(()) => {
                DeliveryMetrics::new(source_topic).dead_lettered(DlqReason::RetryWorkerFailed);
                report.dead_lettered += 1;
            }
            Err(dlq_err) => match self.store.push(now, member).await {
                Ok(()) => {
                    report.requeued += 1;
                    warn!(error = %dlq_err, "DLQ publish failed, envelope requeued");
                }
                Err(store_err) => {
                    error!(
                        dlq_error = %dlq_err,
                        store_error = %store_err,
                        envelope = %member,
                        "Retry envelope could not be republished, dead-lettered or requeued"
                    );
                }
            },
        }
    }

    /// Tick on `poll_interval` until `shutdown` flips to `true`.
    ///
    /// Overlapping ticks cannot happen inside one loop; the in-flight flag also
    /// covers callers that drive [`try_tick`](Self::try_tick) concurrently.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            queue = %self.store.name(),
            dlq = %self.dlq_topic,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            batch_size = self.batch_size,
            "Starting retry dispatcher"
        );

        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.try_tick().await {
                        error!(queue = %self.store.name(), error = %e, "Retry tick failed");
                    }
                }
            }
        }

        info!(queue = %self.store.name(), "Retry dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::InboundMessage;
    use crate::testing::{InMemoryBroker, InMemoryRetryStore};

    const DLQ: &str = "dlq-queue";

    fn envelope(topic: &str, key: &str, due: i64) -> RetryEnvelope {
        let message = InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 3,
            key: Some(key.to_string()),
            payload: Some(format!(r#"{{"id":"{key}"}}"#).into_bytes()),
            headers: MessageHeaders::default(),
        };
        RetryEnvelope::new(
            &message,
            MessageHeaders::new().with_retry_count(1).with_first_seen(0),
            due,
        )
    }

    async fn seeded(store: &InMemoryRetryStore, envelopes: &[RetryEnvelope]) {
        for e in envelopes {
            store.push(e.next_retry_at, &e.encode().unwrap()).await.unwrap();
        }
    }

    fn dispatcher(store: Arc<InMemoryRetryStore>, broker: &InMemoryBroker) -> RetryDispatcher {
        RetryDispatcher::new(store, Arc::new(broker.clone()), &RetryConfig::default())
    }

    #[tokio::test]
    async fn test_republishes_only_due_envelopes_verbatim() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        let due = envelope("run.results", "t-1", 100);
        let later = envelope("run.results", "t-2", 200);
        seeded(&store, &[due.clone(), later]).await;

        let report = dispatcher(store.clone(), &broker)
            .tick_at(150)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.popped, 1);
        assert_eq!(report.republished, 1);
        assert_eq!(store.len().await.unwrap(), 1);

        let delivered = broker.messages("run.results").await;
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].key.as_deref(), Some("t-1"));
        assert_eq!(delivered[0].payload, Some(due.value));
        assert_eq!(delivered[0].headers, due.headers);
    }

    #[tokio::test]
    async fn test_republish_failure_dead_letters() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        broker.fail_topic("custom.results").await;
        seeded(&store, &[envelope("custom.results", "t-9", 10)]).await;

        let report = dispatcher(store.clone(), &broker)
            .tick_at(10)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.dead_lettered, 1);
        let dead = broker.messages(DLQ).await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].headers.error, Some(DlqReason::RetryWorkerFailed));
        assert_eq!(dead[0].headers.retry_count, Some(1));
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_member_dead_letters_raw_bytes() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        store.push(1, "{not an envelope").await.unwrap();

        let report = dispatcher(store, &broker).tick_at(5).await.unwrap().unwrap();

        assert_eq!(report.dead_lettered, 1);
        let dead = broker.messages(DLQ).await;
        assert_eq!(dead[0].payload.as_deref(), Some(&b"{not an envelope"[..]));
    }

    #[tokio::test]
    async fn test_requeues_when_dlq_is_down_too() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        broker.fail_topic("submission.results").await;
        broker.fail_topic(DLQ).await;
        let original = envelope("submission.results", "sub-1", 10);
        seeded(&store, &[original.clone()]).await;

        let report = dispatcher(store.clone(), &broker)
            .tick_at(20)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(report.requeued, 1);
        let remaining = store.envelopes().await;
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, original.id);
    }

    #[tokio::test]
    async fn test_overlapping_tick_is_skipped() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        seeded(&store, &[envelope("run.results", "t-1", 0)]).await;
        let dispatcher = dispatcher(store.clone(), &broker);

        dispatcher.in_flight.store(true, Ordering::Release);
        assert_eq!(dispatcher.tick_at(10).await.unwrap(), None);
        assert_eq!(store.len().await.unwrap(), 1);

        dispatcher.in_flight.store(false, Ordering::Release);
        assert!(dispatcher.tick_at(10).await.unwrap().is_some());
        assert!(!dispatcher.in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_pop_failure_releases_flag() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        let dispatcher = dispatcher(store.clone(), &broker);

        store.set_failing(true).await;
        assert!(dispatcher.tick_at(10).await.is_err());
        assert!(!dispatcher.in_flight.load(Ordering::Acquire));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        let dispatcher = Arc::new(RetryDispatcher::new(
            store,
            Arc::new(broker),
            &RetryConfig::default().with_poll_interval(Duration::from_millis(10)),
        ));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
