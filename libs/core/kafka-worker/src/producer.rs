//! Message producer
//!
//! `KafkaProducer` runs librdkafka's idempotent producer (`enable.idempotence`,
//! `acks=all`), so client-level transport retries never duplicate a single
//! logical send. Every publish awaits the broker acknowledgment.
//!
//! # Example
//!
//! ```rust,ignore
//! use kafka_worker::{KafkaProducer, MessagePublisher, OutboundMessage};
//!
//! let producer = KafkaProducer::new(&kafka_config)?;
//! let message = OutboundMessage::json(&job)?.with_key(&job.submission_id);
//! producer.publish("submission.jobs", message).await?;
//! ```

use crate::error::DeliveryError;
use crate::headers::MessageHeaders;
use crate::message::OutboundMessage;
use crate::metrics::DeliveryMetrics;
use async_trait::async_trait;
use core_config::kafka::KafkaConfig;
use futures::future::join_all;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, warn};

/// Publishing seam shared by services, the retry scheduler and the dispatcher.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish one message and wait for the acknowledgment
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), DeliveryError>;

    /// Publish a batch. Any error means the whole batch must be treated as
    /// undelivered and retried as a unit; partial success is never reported.
    ///
    /// Messages are sent individually, so a failed batch may already be partly
    /// on the topic. Resending it duplicates those messages, which idempotent
    /// consumers absorb.
    async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<(), DeliveryError>;

    /// Wait for in-flight messages to be acknowledged
    async fn flush(&self, _timeout: Duration) -> Result<(), DeliveryError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self, KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.bootstrap_servers())
            .set("client.id", &config.client_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .create()?;

        Ok(Self {
            producer,
            send_timeout: Duration::from_secs(30),
        })
    }

    /// How long a send may wait for queue space before failing
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = timeout;
        self
    }

    async fn send_one(&self, topic: &str, message: &OutboundMessage) -> Result<(), String> {
        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(&message.payload[..])
            .headers(to_kafka_headers(&message.headers));

        if let Some(key) = message.key.as_deref() {
            record = record.key(key);
        }

        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.to_string())
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn publish(&self, topic: &str, message: OutboundMessage) -> Result<(), DeliveryError> {
        let metrics = DeliveryMetrics::new(topic);

        match self.send_one(topic, &message).await {
            Ok(()) => {
                metrics.message_produced(1);
                debug!(topic = %topic, key = ?message.key, "Published message");
                Ok(())
            }
            Err(reason) => {
                metrics.produce_failed(1);
                warn!(topic = %topic, key = ?message.key, error = %reason, "Publish rejected");
                Err(DeliveryError::Rejected {
                    topic: topic.to_string(),
                    reason,
                })
            }
        }
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: Vec<OutboundMessage>,
    ) -> Result<(), DeliveryError> {
        if messages.is_empty() {
            return Ok(());
        }

        let metrics = DeliveryMetrics::new(topic);
        let total = messages.len();

        // Enqueued together so librdkafka packs them into as few produce requests as it can;
        // still separate sends, the error below does not undo the ones that landed
        let results = join_all(messages.iter().map(|m| self.send_one(topic, m))).await;
        let errors: Vec<String> = results.into_iter().filter_map(Result::err).collect();

        if let Some(first) = errors.first() {
            metrics.produce_failed(errors.len() as u64);
            warn!(topic = %topic, failed = errors.len(), total, "Batch publish failed");
            return Err(DeliveryError::BatchFailed {
                topic: topic.to_string(),
                failed: errors.len(),
                total,
                reason: first.clone(),
            });
        }

        metrics.message_produced(total as u64);
        debug!(topic = %topic, count = total, "Published batch");
        Ok(())
    }

    async fn flush(&self, timeout: Duration) -> Result<(), DeliveryError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| DeliveryError::Flush(e.to_string()))?
            .map_err(|e| DeliveryError::Flush(e.to_string()))
    }
}

fn to_kafka_headers(headers: &MessageHeaders) -> OwnedHeaders {
    headers
        .to_pairs()
        .iter()
        .fold(OwnedHeaders::new(), |acc, (key, value)| {
            acc.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            })
        })
}
