//! Retry Worker Service
//!
//! Runs the retry dispatcher on its own, for deployments where the consuming
//! services should not carry the redelivery timer themselves.
//!
//! ## Architecture
//!
//! ```text
//! Redis sorted set (KAFKA_RETRY_QUEUE_KEY)
//!   ↓ pop_due (atomic, every KAFKA_RETRY_POLL_INTERVAL_MS)
//! RetryDispatcher
//!   ↓ verbatim republish            ↓ republish failed / corrupt member
//! original topic                   DLQ (x-error=retry-worker-failed)
//! ```
//!
//! Health endpoints are served on `HEALTH_PORT` (default 8083).

pub mod config;

use crate::config::WorkerConfig;
use axum::Router;
use core_config::{app_info, kafka::KafkaConfig, redis::RedisConfig, Environment, FromEnv};
use eyre::{Result, WrapErr};
use kafka_worker::{
    connect_redis_with_retry, ensure_topics, health_router, init_metrics, shutdown_channel,
    DeliveryError, HealthState, KafkaAdmin, KafkaProducer, MessagePublisher, RedisRetryStore,
    RetryConfig, RetryDispatcher, RetryStore, TopicSpec,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const REDIS_CONNECT_ATTEMPTS: u32 = 5;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

async fn start_health_server(app: Router, port: u16) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")
}

/// Tick the dispatcher until `shutdown` flips, then flush whatever it published
pub async fn drain(
    dispatcher: &RetryDispatcher,
    publisher: &dyn MessagePublisher,
    shutdown: watch::Receiver<bool>,
    flush_timeout: Duration,
) -> Result<(), DeliveryError> {
    dispatcher.run(shutdown).await;

    info!("Flushing producer");
    publisher.flush(flush_timeout).await
}

/// Run the retry worker
///
/// 1. Sets up tracing and Prometheus metrics
/// 2. Connects to Redis and makes sure the DLQ topic exists
/// 3. Serves health endpoints in the background
/// 4. Drains the retry store until SIGINT/SIGTERM, then flushes the producer
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting retry worker");

    let worker_config = WorkerConfig::from_env().wrap_err("Failed to load worker configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let kafka_config = KafkaConfig::from_env().wrap_err("Failed to load Kafka configuration")?;
    let retry_config = RetryConfig::from_env().wrap_err("Failed to load retry configuration")?;

    info!("Connecting to Redis...");
    let redis = connect_redis_with_retry(&redis_config.url, REDIS_CONNECT_ATTEMPTS)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let admin = KafkaAdmin::new(&kafka_config).wrap_err("Failed to create Kafka admin client")?;
    ensure_topics(
        &admin,
        &[TopicSpec::new(
            &retry_config.dlq_topic,
            worker_config.dlq_partitions,
            worker_config.dlq_replication_factor,
        )],
    )
    .await
    .wrap_err("Failed to provision DLQ topic")?;

    let producer =
        Arc::new(KafkaProducer::new(&kafka_config).wrap_err("Failed to create producer")?);
    let store: Arc<dyn RetryStore> =
        Arc::new(RedisRetryStore::new(redis.clone(), &retry_config.queue_key));
    let dispatcher = RetryDispatcher::new(store.clone(), producer.clone(), &retry_config);

    let health = health_router(HealthState::new(redis, app_info, store));
    let health_port = worker_config.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    drain(&dispatcher, producer.as_ref(), shutdown_channel(), FLUSH_TIMEOUT)
        .await
        .wrap_err("Producer flush failed during shutdown")?;

    info!("Retry worker stopped");
    Ok(())
}
