//! Consumer loop with manual offset control
//!
//! One `ConsumerRunner` per (group, topic). Auto-commit is off; the runner
//! commits `offset + 1` only after the pipeline reports a terminal state.
//! When the pipeline or the broker fails, the fetch loop aborts, the source is
//! dropped and a fresh one is opened after `restart_backoff`. The new
//! subscription resumes from the group's last committed offset, so the failed
//! message is delivered again.

use crate::config::ConsumerConfig;
use crate::error::{ConsumerError, ErrorCategory};
use crate::headers::MessageHeaders;
use crate::message::InboundMessage;
use crate::metrics::DeliveryMetrics;
use crate::pipeline::MessagePipeline;
use async_trait::async_trait;
use core_config::kafka::KafkaConfig;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// An open subscription
#[async_trait]
pub trait MessageSource: Send {
    /// Wait for the next message
    async fn recv(&mut self) -> Result<InboundMessage, ConsumerError>;

    /// Commit `message.offset + 1` for the message's partition
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumerError>;
}

/// Opens subscriptions. Each call starts from the group's committed offset.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    async fn connect(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Box<dyn MessageSource>, ConsumerError>;
}

pub struct ConsumerRunner {
    group_id: String,
    topic: String,
    pipeline: MessagePipeline,
    connector: Arc<dyn SourceConnector>,
    restart_backoff: Duration,
}

impl ConsumerRunner {
    pub fn new(
        group_id: impl Into<String>,
        topic: impl Into<String>,
        pipeline: MessagePipeline,
        connector: Arc<dyn SourceConnector>,
    ) -> Self {
        Self {
            group_id: group_id.into(),
            topic: topic.into(),
            pipeline,
            connector,
            restart_backoff: ConsumerConfig::default().restart_backoff,
        }
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Consume until `shutdown` flips to `true`.
    ///
    /// A message being processed when shutdown arrives is finished and
    /// committed first. Only permanent errors end the loop early.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        info!(
            group = %self.group_id,
            topic = %self.topic,
            handler = self.pipeline.handler_name(),
            dlq = %self.pipeline.dlq_topic(),
            "Starting consumer"
        );

        let metrics = DeliveryMetrics::new(&self.topic);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let result = match self.connector.connect(&self.group_id, &self.topic).await {
                Ok(mut source) => self.consume(source.as_mut(), &mut shutdown).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => break,
                Err(e) if e.category() == ErrorCategory::Permanent => {
                    error!(group = %self.group_id, topic = %self.topic, error = %e, "Consumer stopped");
                    return Err(e);
                }
                Err(e) => {
                    metrics.consumer_restarted();
                    error!(
                        group = %self.group_id,
                        topic = %self.topic,
                        error = %e,
                        backoff_ms = self.restart_backoff.as_millis() as u64,
                        "Consumer loop aborted, reconnecting from last committed offset"
                    );

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(self.restart_backoff) => {}
                    }
                }
            }
        }

        info!(group = %self.group_id, topic = %self.topic, "Consumer stopped");
        Ok(())
    }

    /// Fetch loop for one subscription. `Ok` only on shutdown.
    async fn consume(
        &self,
        source: &mut dyn MessageSource,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        loop {
            let message = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return Ok(());
                    }
                    continue;
                }
                message = source.recv() => message?,
            };

            let disposition = self.pipeline.process(&message).await?;
            source.commit(&message).await?;

            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                ?disposition,
                "Committed"
            );
        }
    }
}

/// librdkafka-backed connector; one `StreamConsumer` per subscription
#[derive(Clone)]
pub struct KafkaConnector {
    kafka: KafkaConfig,
    consumer: ConsumerConfig,
}

impl KafkaConnector {
    pub fn new(kafka: KafkaConfig, consumer: ConsumerConfig) -> Self {
        Self { kafka, consumer }
    }
}

#[async_trait]
impl SourceConnector for KafkaConnector {
    async fn connect(
        &self,
        group_id: &str,
        topic: &str,
    ) -> Result<Box<dyn MessageSource>, ConsumerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", self.kafka.bootstrap_servers())
            .set("client.id", &self.kafka.client_id)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.consumer.auto_offset_reset)
            .set(
                "session.timeout.ms",
                self.consumer.session_timeout.as_millis().to_string(),
            )
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[topic])?;
        debug!(group = %group_id, topic = %topic, "Subscribed");

        Ok(Box::new(KafkaSource {
            consumer: Arc::new(consumer),
        }))
    }
}

struct KafkaSource {
    consumer: Arc<StreamConsumer>,
}

#[async_trait]
impl MessageSource for KafkaSource {
    async fn recv(&mut self) -> Result<InboundMessage, ConsumerError> {
        let message = self.consumer.recv().await?.detach();

        let headers = message
            .headers()
            .map(|h| MessageHeaders::from_pairs(h.iter().map(|h| (h.key, h.value))))
            .unwrap_or_default();

        Ok(InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|k| String::from_utf8_lossy(k).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
        })
    }

    /// Synchronous commit on the blocking pool: `Ok` means the broker stored
    /// the offset, and a rejected commit surfaces as `ConsumerError::Commit`.
    async fn commit(&mut self, message: &InboundMessage) -> Result<(), ConsumerError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            &message.topic,
            message.partition,
            Offset::Offset(message.next_offset()),
        )?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&offsets, CommitMode::Sync))
            .await
            .map_err(|e| ConsumerError::Commit(e.to_string()))?
            .map_err(|e| {
                warn!(topic = %message.topic, offset = message.offset, error = %e, "Commit failed");
                ConsumerError::Commit(e.to_string())
            })
    }
}
