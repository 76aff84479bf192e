//! Per-message state machine
//!
//! ```text
//! RECEIVED -> DECODE -+-> ok ----> HANDLE -+-> ok -------------------------> COMMIT
//!                     |                    +-> err -> SCHEDULE_RETRY -+-> ok -> COMMIT
//!                     |                                               +-> err -> no commit
//!                     +-> err -> DLQ (parse-failure) -> COMMIT
//! ```
//!
//! `MessagePipeline::process` returns `Ok` exactly when the message reached a
//! terminal state and its offset may be committed.

use crate::error::{ConsumerError, DecodeError, HandlerError};
use crate::headers::DlqReason;
use crate::message::{InboundMessage, OutboundMessage};
use crate::metrics::DeliveryMetrics;
use crate::producer::MessagePublisher;
use crate::scheduler::{RetryOutcome, RetryScheduler};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Business logic for one consumer.
///
/// The payload is decoded from JSON before `handle` runs. Returning an error
/// hands the message to the retry scheduler; handlers should be safe to run
/// twice for the same message because delivery is at-least-once.
///
/// # Example
///
/// ```rust,ignore
/// struct RunResultHandler { cache: ResultCache, guard: IdempotencyGuard }
///
/// #[async_trait]
/// impl MessageHandler for RunResultHandler {
///     type Payload = RunResult;
///
///     fn name(&self) -> &'static str {
///         "run-result"
///     }
///
///     async fn handle(&self, result: RunResult, _: &InboundMessage) -> Result<(), HandlerError> {
///         let key = IdempotencyKey::new("run", &result.temp_id);
///         if self.guard.is_processed(&key).await? {
///             return Ok(());
///         }
///         self.cache.set(&format!("run:normal:{}", result.temp_id), &result, ttl).await?;
///         self.guard.mark_processed(&key, ttl).await?;
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    type Payload: DeserializeOwned + Send + 'static;

    /// Handler name for logging
    fn name(&self) -> &'static str;

    async fn handle(
        &self,
        payload: Self::Payload,
        message: &InboundMessage,
    ) -> Result<(), HandlerError>;
}

/// Decode a JSON payload. A missing or empty payload is a decode failure.
pub fn decode_json<T: DeserializeOwned>(payload: Option<&[u8]>) -> Result<T, DecodeError> {
    match payload {
        None | Some([]) => Err(DecodeError::EmptyPayload),
        Some(bytes) => serde_json::from_slice(bytes).map_err(|source| DecodeError::Json {
            expected: std::any::type_name::<T>(),
            source,
        }),
    }
}

pub(crate) enum HandleFailure {
    Decode(DecodeError),
    Handler(HandlerError),
}

/// Handler with its payload type erased, so runners for different payloads share one type
#[async_trait]
pub(crate) trait RawHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle_raw(&self, message: &InboundMessage) -> Result<(), HandleFailure>;
}

#[async_trait]
impl<H: MessageHandler> RawHandler for H {
    fn name(&self) -> &'static str {
        MessageHandler::name(self)
    }

    async fn handle_raw(&self, message: &InboundMessage) -> Result<(), HandleFailure> {
        let payload = decode_json::<H::Payload>(message.payload.as_deref())
            .map_err(HandleFailure::Decode)?;
        self.handle(payload, message)
            .await
            .map_err(HandleFailure::Handler)
    }
}

/// Terminal state reached by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Processed,
    /// Undecodable payload routed to the DLQ
    DeadLettered,
    /// Handler failed; the scheduler took ownership
    Retry(RetryOutcome),
}

#[derive(Clone)]
pub struct MessagePipeline {
    dlq_topic: String,
    handler: Arc<dyn RawHandler>,
    scheduler: RetryScheduler,
    publisher: Arc<dyn MessagePublisher>,
}

impl MessagePipeline {
    pub fn new<H: MessageHandler>(
        handler: H,
        dlq_topic: impl Into<String>,
        scheduler: RetryScheduler,
        publisher: Arc<dyn MessagePublisher>,
    ) -> Self {
        Self {
            dlq_topic: dlq_topic.into(),
            handler: Arc::new(handler),
            scheduler,
            publisher,
        }
    }

    pub fn handler_name(&self) -> &'static str {
        self.handler.name()
    }

    pub fn dlq_topic(&self) -> &str {
        &self.dlq_topic
    }

    /// Drive one message to a terminal state.
    ///
    /// `Err` means nothing durable happened and the offset must stay where it is.
    pub async fn process(&self, message: &InboundMessage) -> Result<Disposition, ConsumerError> {
        let started = Instant::now();
        let metrics = DeliveryMetrics::new(&message.topic);

        match self.handler.handle_raw(message).await {
            Ok(()) => {
                metrics.message_consumed("processed", started.elapsed());
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    handler = self.handler.name(),
                    "Message processed"
                );
                Ok(Disposition::Processed)
            }
            Err(HandleFailure::Decode(e)) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Undecodable message, routing to DLQ"
                );
                let dead = OutboundMessage::dead_letter(
                    message.key.clone(),
                    message.payload_bytes().to_vec(),
                    message.headers.clone(),
                    DlqReason::ParseFailure,
                );
                self.publisher
                    .publish(&self.dlq_topic, dead)
                    .await
                    .map_err(ConsumerError::DeadLetter)?;

                metrics.dead_lettered(DlqReason::ParseFailure);
                metrics.message_consumed("dead_lettered", started.elapsed());
                Ok(Disposition::DeadLettered)
            }
            Err(HandleFailure::Handler(e)) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    handler = self.handler.name(),
                    retry_count = message.headers.retry_count(),
                    error = %e,
                    "Handler failed"
                );
                let outcome = self
                    .scheduler
                    .schedule_retry(message, &self.dlq_topic)
                    .await?;

                let status = match outcome {
                    RetryOutcome::Scheduled { .. } => "retry_scheduled",
                    RetryOutcome::Exhausted { .. } | RetryOutcome::Shed { .. } => "dead_lettered",
                };
                metrics.message_consumed(status, started.elapsed());
                Ok(Disposition::Retry(outcome))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::headers::MessageHeaders;
    use crate::retry_store::RetryStore;
    use crate::testing::{InMemoryBroker, InMemoryRetryStore};
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct SubmissionResult {
        submission_id: String,
    }

    struct Flaky {
        fail: bool,
        seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        type Payload = SubmissionResult;

        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(
            &self,
            payload: SubmissionResult,
            _message: &InboundMessage,
        ) -> Result<(), HandlerError> {
            assert_eq!(payload.submission_id, "sub-1");
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(HandlerError::new("problem service unavailable"))
            } else {
                Ok(())
            }
        }
    }

    fn message(payload: &[u8]) -> InboundMessage {
        InboundMessage {
            topic: "submission.results".into(),
            partition: 0,
            offset: 12,
            key: Some("sub-1".into()),
            payload: Some(payload.to_vec()),
            headers: MessageHeaders::default(),
        }
    }

    fn pipeline(fail: bool, store: Arc<InMemoryRetryStore>, broker: &InMemoryBroker) -> MessagePipeline {
        let publisher: Arc<dyn MessagePublisher> = Arc::new(broker.clone());
        let scheduler = RetryScheduler::new(store, publisher.clone(), &RetryConfig::default());
        MessagePipeline::new(
            Flaky {
                fail,
                seen: Arc::new(AtomicUsize::new(0)),
            },
            "dlq-queue",
            scheduler,
            publisher,
        )
    }

    #[test]
    fn test_decode_json_rejects_empty() {
        assert!(matches!(
            decode_json::<serde_json::Value>(None),
            Err(DecodeError::EmptyPayload)
        ));
        assert!(matches!(
            decode_json::<serde_json::Value>(Some(b"")),
            Err(DecodeError::EmptyPayload)
        ));
        assert!(matches!(
            decode_json::<serde_json::Value>(Some(b"{oops")),
            Err(DecodeError::Json { .. })
        ));
    }

    #[tokio::test]
    async fn test_success_is_processed() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();

        let disposition = pipeline(false, store.clone(), &broker)
            .process(&message(br#"{"submissionId":"sub-1"}"#))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Processed);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_goes_to_dlq_once() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();

        let disposition = pipeline(false, store.clone(), &broker)
            .process(&message(b"not json"))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::DeadLettered);
        let dead = broker.messages("dlq-queue").await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].headers.error, Some(DlqReason::ParseFailure));
        assert_eq!(dead[0].payload.as_deref(), Some(&b"not json"[..]));
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_parse_failure_with_dlq_down_is_an_error() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();
        broker.fail_topic("dlq-queue").await;

        let err = pipeline(false, store, &broker)
            .process(&message(b"not json"))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::DeadLetter(_)));
    }

    #[tokio::test]
    async fn test_handler_failure_schedules_retry() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        let broker = InMemoryBroker::new();

        let disposition = pipeline(true, store.clone(), &broker)
            .process(&message(br#"{"submissionId":"sub-1"}"#))
            .await
            .unwrap();

        assert!(matches!(
            disposition,
            Disposition::Retry(RetryOutcome::Scheduled { retry_count: 1, .. })
        ));
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schedule_failure_is_an_error() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        store.set_failing(true).await;
        let broker = InMemoryBroker::new();

        let err = pipeline(true, store, &broker)
            .process(&message(br#"{"submissionId":"sub-1"}"#))
            .await
            .unwrap_err();

        assert!(matches!(err, ConsumerError::Schedule(_)));
        assert!(broker.messages("dlq-queue").await.is_empty());
    }
}
