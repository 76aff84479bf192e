//! Kafka Worker Framework
//!
//! At-least-once message delivery on top of Kafka with manual offset control,
//! Redis-backed retry scheduling and dead-letter routing.
//!
//! ## Features
//!
//! - **Idempotent producer**: `KafkaProducer` with batches that fail as a whole
//! - **Manual commits**: `offset + 1` is committed only after a terminal state
//! - **Retry scheduling**: exponential backoff with jitter, durable envelopes in a sorted set
//! - **Load shedding**: a full retry store routes failures to the DLQ instead of growing
//! - **Retry dispatcher**: atomic pop of due envelopes, verbatim redelivery
//! - **Idempotency guard**: namespaced processed markers with TTL
//! - **Prometheus metrics** and K8s-ready health endpoints
//!
//! ## Architecture
//!
//! ```text
//!   producer ──► job topic ──► external worker ──► result topic
//!                                                       │
//!                                                       ▼
//!                                              ConsumerRunner (group, topic)
//!                                                       │ decode
//!                                   ┌───────────────────┼──────────────────┐
//!                                   ▼                   ▼                  ▼
//!                            DLQ parse-failure     handler ok        handler err
//!                                   │                   │                  │
//!                                   └──── commit ◄──────┘          RetryScheduler
//!                                                                    │    │     │
//!                                            retries-exhausted DLQ ◄─┘    │     └─► DLQ retry-queue-capacity
//!                                                                         ▼
//!                                                                    RetryStore
//!                                                                         │ pop_due
//!                                                                         ▼
//!                                                     RetryDispatcher ──► original topic
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use kafka_worker::{ConsumerManager, KafkaConnector, KafkaProducer, RedisRetryStore, RetryConfig};
//!
//! let redis = connect_redis_with_retry(&redis_config.url, 5).await?;
//! let store = Arc::new(RedisRetryStore::new(redis.clone(), &retry_config.queue_key));
//! let producer = Arc::new(KafkaProducer::new(&kafka_config)?);
//! let connector = Arc::new(KafkaConnector::new(kafka_config, ConsumerConfig::default()));
//!
//! let manager = ConsumerManager::new(store, producer, connector, &retry_config, ConsumerConfig::default());
//! manager.create_consumer("cm-run-results", "run.results", handler, &retry_config.dlq_topic).await;
//! manager.start_retry_dispatcher().await;
//! // ...
//! manager.shutdown(Duration::from_secs(10)).await?;
//! ```

mod admin;
mod backoff;
mod cache;
mod config;
mod connect;
mod consumer;
mod dispatcher;
mod error;
mod headers;
mod health;
mod idempotency;
mod manager;
mod message;
pub mod metrics;
mod pipeline;
mod producer;
mod result_cache;
mod retry_store;
mod scheduler;
mod shutdown;
pub mod testing;

// Re-export main types
pub use admin::{ensure_topics, BrokerAdmin, KafkaAdmin, TopicProvision, TopicSpec};
pub use backoff::{BackoffPolicy, DEFAULT_JITTER_RATIO};
pub use cache::{KeyValueCache, RedisCache};
pub use config::{ConsumerConfig, RetryConfig};
pub use connect::{connect_redis, connect_redis_with_retry, retry_with_backoff};
pub use consumer::{ConsumerRunner, KafkaConnector, MessageSource, SourceConnector};
pub use dispatcher::{RetryDispatcher, TickReport};
pub use error::{
    AdminError, ConsumerError, DecodeError, DeliveryError, ErrorCategory, HandlerError,
    ScheduleError, StoreError,
};
pub use headers::{
    DlqReason, MessageHeaders, ERROR_HEADER, FIRST_SEEN_HEADER, RETRY_COUNT_HEADER,
};
pub use health::{health_router, HealthState};
pub use idempotency::{IdempotencyGuard, IdempotencyKey};
pub use manager::{ConsumerHandle, ConsumerManager};
pub use message::{InboundMessage, OutboundMessage, RetryEnvelope};
pub use self::metrics::{init_metrics, DeliveryMetrics};
pub use pipeline::{decode_json, Disposition, MessageHandler, MessagePipeline};
pub use producer::{KafkaProducer, MessagePublisher};
pub use result_cache::ResultCache;
pub use retry_store::{PushOutcome, RedisRetryStore, RetryStore};
pub use scheduler::{RetryOutcome, RetryScheduler};
pub use shutdown::{shutdown_channel, shutdown_signal};
