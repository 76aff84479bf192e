//! Retry scheduling for failed messages
//!
//! Decides between three fates for a message whose handler failed:
//! - retries exhausted: dead-letter with `retries-exhausted` and the final count
//! - retry store full: dead-letter with `retry-queue-capacity` (load shedding)
//! - otherwise: durable retry envelope scored by `now + delay`
//!
//! Every failure to make the outcome durable is returned to the caller, which
//! must not commit the message's offset.

use crate::backoff::BackoffPolicy;
use crate::config::RetryConfig;
use crate::error::ScheduleError;
use crate::headers::DlqReason;
use crate::message::{InboundMessage, OutboundMessage, RetryEnvelope};
use crate::metrics::{self, DeliveryMetrics};
use crate::producer::MessagePublisher;
use crate::retry_store::{PushOutcome, RetryStore};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Envelope stored; `retry_count` is the value carried by the redelivery
    Scheduled { retry_count: u32, next_retry_at: i64 },
    /// Dead-lettered after `retry_count` retries
    Exhausted { retry_count: u32 },
    /// Dead-lettered because the retry store was full
    Shed { queue_size: u64 },
}

#[derive(Clone)]
pub struct RetryScheduler {
    store: Arc<dyn RetryStore>,
    publisher: Arc<dyn MessagePublisher>,
    policy: BackoffPolicy,
    max_retries: u32,
    capacity: u64,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn RetryStore>,
        publisher: Arc<dyn MessagePublisher>,
        config: &RetryConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            policy: config.backoff_policy(),
            max_retries: config.max_retries,
            capacity: config.queue_capacity,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub async fn schedule_retry(
        &self,
        message: &InboundMessage,
        dlq_topic: &str,
    ) -> Result<RetryOutcome, ScheduleError> {
        self.schedule_retry_at(message, dlq_topic, Utc::now().timestamp())
            .await
    }

    /// Same as [`schedule_retry`](Self::schedule_retry) with an explicit clock, in epoch seconds
    pub async fn schedule_retry_at(
        &self,
        message: &InboundMessage,
        dlq_topic: &str,
        now: i64,
    ) -> Result<RetryOutcome, ScheduleError> {
        let metrics = DeliveryMetrics::new(&message.topic);
        let retry_count = message.headers.retry_count();

        if retry_count >= self.max_retries {
            let headers = message.headers.clone().with_retry_count(retry_count);
            self.dead_letter(message, dlq_topic, headers, DlqReason::RetriesExhausted)
                .await?;

            warn!(
                topic = %message.topic,
                key = ?message.key,
                retry_count,
                "Retries exhausted, moved to DLQ"
            );
            return Ok(RetryOutcome::Exhausted { retry_count });
        }

        let next_count = retry_count + 1;
        let next_retry_at = now + self.policy.delay_secs(retry_count) as i64;
        let headers = message
            .headers
            .clone()
            .with_retry_count(next_count)
            .with_first_seen(message.headers.first_seen.unwrap_or(now));

        let envelope = RetryEnvelope::new(message, headers, next_retry_at);
        let member = envelope.encode()?;

        match self
            .store
            .push_bounded(next_retry_at, &member, self.capacity)
            .await?
        {
            PushOutcome::Stored { size } => {
                metrics.retry_scheduled();
                metrics::retry_queue_size(self.store.name(), size);
                info!(
                    topic = %message.topic,
                    key = ?message.key,
                    retry_count = next_count,
                    next_retry_at,
                    "Scheduled retry"
                );
                Ok(RetryOutcome::Scheduled {
                    retry_count: next_count,
                    next_retry_at,
                })
            }
            PushOutcome::AtCapacity { size } => {
                self.dead_letter(
                    message,
                    dlq_topic,
                    message.headers.clone(),
                    DlqReason::RetryQueueCapacity,
                )
                .await?;

                warn!(
                    topic = %message.topic,
                    key = ?message.key,
                    queue_size = size,
                    capacity = self.capacity,
                    "Retry queue at capacity, shed to DLQ"
                );
                Ok(RetryOutcome::Shed { queue_size: size })
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        dlq_topic: &str,
        headers: crate::headers::MessageHeaders,
        reason: DlqReason,
    ) -> Result<(), ScheduleError> {
        let dead = OutboundMessage::dead_letter(
            message.key.clone(),
            message.payload_bytes().to_vec(),
            headers,
            reason,
        );
        self.publisher.publish(dlq_topic, dead).await?;
        DeliveryMetrics::new(&message.topic).dead_lettered(reason);
        Ok(())
    }
}
