//! Consumer lifecycle owner
//!
//! One `ConsumerManager` is built by the service's composition root and shared
//! by reference. It owns the consumer tasks and the retry dispatcher task, but
//! not the retry store or the producer: those are handed in so the scheduler
//! and the dispatcher share the same store handle.
//!
//! Shutdown order: consumers stop pulling and finish their in-flight message,
//! then the producer is flushed, then the dispatcher timer stops.

use crate::config::{ConsumerConfig, RetryConfig};
use crate::consumer::{ConsumerRunner, SourceConnector};
use crate::dispatcher::RetryDispatcher;
use crate::error::{ConsumerError, DeliveryError};
use crate::pipeline::{MessageHandler, MessagePipeline};
use crate::producer::MessagePublisher;
use crate::retry_store::RetryStore;
use crate::scheduler::RetryScheduler;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// A registered consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerHandle {
    pub group_id: String,
    pub topic: String,
    /// `false` when the group was already registered and the existing consumer was returned
    pub created: bool,
}

struct ConsumerEntry {
    topic: String,
    task: JoinHandle<Result<(), ConsumerError>>,
}

pub struct ConsumerManager {
    publisher: Arc<dyn MessagePublisher>,
    scheduler: RetryScheduler,
    connector: Arc<dyn SourceConnector>,
    consumer_config: ConsumerConfig,
    dispatcher: Arc<RetryDispatcher>,
    consumers: Mutex<HashMap<String, ConsumerEntry>>,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    consumer_shutdown: watch::Sender<bool>,
    dispatcher_shutdown: watch::Sender<bool>,
}

impl ConsumerManager {
    pub fn new(
        store: Arc<dyn RetryStore>,
        publisher: Arc<dyn MessagePublisher>,
        connector: Arc<dyn SourceConnector>,
        retry: &RetryConfig,
        consumer_config: ConsumerConfig,
    ) -> Self {
        let scheduler = RetryScheduler::new(store.clone(), publisher.clone(), retry);
        let dispatcher = Arc::new(RetryDispatcher::new(store, publisher.clone(), retry));

        Self {
            publisher,
            scheduler,
            connector,
            consumer_config,
            dispatcher,
            consumers: Mutex::new(HashMap::new()),
            dispatcher_task: Mutex::new(None),
            consumer_shutdown: watch::channel(false).0,
            dispatcher_shutdown: watch::channel(false).0,
        }
    }

    pub fn scheduler(&self) -> &RetryScheduler {
        &self.scheduler
    }

    pub fn dispatcher(&self) -> Arc<RetryDispatcher> {
        self.dispatcher.clone()
    }

    /// Start consuming `topic` as `group_id`.
    ///
    /// Registration is idempotent per group: a second call for a known group
    /// returns the existing consumer and ignores the new handler.
    pub async fn create_consumer<H: MessageHandler>(
        &self,
        group_id: &str,
        topic: &str,
        handler: H,
        dlq_topic: &str,
    ) -> ConsumerHandle {
        let mut consumers = self.consumers.lock().await;

        if let Some(existing) = consumers.get(group_id) {
            if existing.topic != topic {
                warn!(
                    group = %group_id,
                    registered_topic = %existing.topic,
                    requested_topic = %topic,
                    "Consumer group already registered for another topic"
                );
            }
            return ConsumerHandle {
                group_id: group_id.to_string(),
                topic: existing.topic.clone(),
                created: false,
            };
        }

        let pipeline = MessagePipeline::new(
            handler,
            dlq_topic,
            self.scheduler.clone(),
            self.publisher.clone(),
        );
        let runner = ConsumerRunner::new(group_id, topic, pipeline, self.connector.clone())
            .with_restart_backoff(self.consumer_config.restart_backoff);

        let shutdown = self.consumer_shutdown.subscribe();
        let task = tokio::spawn(async move { runner.run(shutdown).await });

        consumers.insert(
            group_id.to_string(),
            ConsumerEntry {
                topic: topic.to_string(),
                task,
            },
        );
        info!(group = %group_id, topic = %topic, "Registered consumer");

        ConsumerHandle {
            group_id: group_id.to_string(),
            topic: topic.to_string(),
            created: true,
        }
    }

    /// Registered groups, sorted
    pub async fn consumer_groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.consumers.lock().await.keys().cloned().collect();
        groups.sort();
        groups
    }

    /// Spawn the retry dispatcher. Returns `false` if it is already running.
    pub async fn start_retry_dispatcher(&self) -> bool {
        let mut task = self.dispatcher_task.lock().await;
        if task.is_some() {
            return false;
        }

        let dispatcher = self.dispatcher.clone();
        let shutdown = self.dispatcher_shutdown.subscribe();
        *task = Some(tokio::spawn(async move { dispatcher.run(shutdown).await }));
        true
    }

    /// Stop consumers, flush the producer, then stop the dispatcher.
    ///
    /// Every step runs even if an earlier one failed; the flush error, if any, is returned.
    pub async fn shutdown(&self, flush_timeout: Duration) -> Result<(), DeliveryError> {
        info!("Shutting down consumers");
        self.consumer_shutdown.send_replace(true);

        let consumers: Vec<(String, ConsumerEntry)> =
            self.consumers.lock().await.drain().collect();
        for (group_id, entry) in consumers {
            match entry.task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(group = %group_id, error = %e, "Consumer ended with error"),
                Err(e) => error!(group = %group_id, error = %e, "Consumer task panicked"),
            }
        }

        info!("Flushing producer");
        let flushed = self.publisher.flush(flush_timeout).await;
        if let Err(e) = &flushed {
            error!(error = %e, "Producer flush failed");
        }

        self.dispatcher_shutdown.send_replace(true);
        if let Some(task) = self.dispatcher_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Retry dispatcher task panicked");
            }
        }

        info!("Delivery core stopped");
        flushed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::message::{InboundMessage, OutboundMessage};
    use crate::testing::{InMemoryBroker, InMemoryRetryStore};
    use async_trait::async_trait;
    use serde_json::Value;

    struct Noop;

    #[async_trait]
    impl MessageHandler for Noop {
        type Payload = Value;

        fn name(&self) -> &'static str {
            "noop"
        }

        async fn handle(&self, _: Value, _: &InboundMessage) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    fn manager(broker: &InMemoryBroker) -> ConsumerManager {
        ConsumerManager::new(
            Arc::new(InMemoryRetryStore::new("retry-queue")),
            Arc::new(broker.clone()),
            Arc::new(broker.clone()),
            &RetryConfig::default().with_poll_interval(Duration::from_millis(10)),
            ConsumerConfig::default().with_restart_backoff(Duration::from_millis(10)),
        )
    }

    #[tokio::test]
    async fn test_create_consumer_is_idempotent_per_group() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let first = manager
            .create_consumer("cm-run-results", "run.results", Noop, "dlq-queue")
            .await;
        let second = manager
            .create_consumer("cm-run-results", "custom.results", Noop, "dlq-queue")
            .await;

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(second.topic, "run.results");
        assert_eq!(manager.consumer_groups().await, vec!["cm-run-results"]);

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_retry_dispatcher_once() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        assert!(manager.start_retry_dispatcher().await);
        assert!(!manager.start_retry_dispatcher().await);

        manager.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_drains_consumers() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager
            .create_consumer("cm-custom-results", "custom.results", Noop, "dlq-queue")
            .await;
        manager.start_retry_dispatcher().await;

        broker
            .publish("custom.results", OutboundMessage::new("{}"))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker
                .committed_offset("cm-custom-results", "custom.results")
                .await
                .is_none()
            {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        tokio::time::timeout(Duration::from_secs(2), manager.shutdown(Duration::from_secs(1)))
            .await
            .unwrap()
            .unwrap();
        assert!(manager.consumer_groups().await.is_empty());
    }
}
