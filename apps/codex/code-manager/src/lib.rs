//! Code Manager Service
//!
//! Accepts code execution requests, dispatches them as jobs to external
//! executors, and collects their results for clients to pull.
//!
//! ## Architecture
//!
//! ```text
//! HTTP  POST /submissions | /runs | /custom
//!   ↓ sanitize, load problem (cache-aside), populate wrapper template
//! KafkaProducer ──► submission.jobs | run.jobs | custom.jobs ──► executors
//!                                                                   │
//!   submission.results | run.results | custom.results ◄─────────────┘
//!   ↓ ConsumerManager (cm-*-results groups, retries, DLQ)
//! Result handlers ──► ResultCache (Redis) ──► GET .../result (read once)
//! ```
//!
//! ## Endpoints
//!
//! - API on `HTTP_PORT` (default 8080)
//! - `/health`, `/ready`, `/retry/info`, `/metrics` on `METRICS_PORT` (default 9102)

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handlers;
pub mod http;
pub mod keys;
pub mod models;
pub mod problem_client;
pub mod results;
pub mod sanitizer;
pub mod template;

use crate::config::ServiceConfig;
use crate::dispatch::DispatchService;
use crate::handlers::{register_result_consumers, ResultTtls};
use crate::http::AppState;
use crate::problem_client::HttpProblemClient;
use crate::results::ExecutionResultService;
use crate::sanitizer::PatternSanitizer;
use axum::Router;
use core_config::{app_info, kafka::KafkaConfig, redis::RedisConfig, Environment, FromEnv};
use eyre::{Result, WrapErr};
use kafka_worker::{
    connect_redis_with_retry, ensure_topics, health_router, init_metrics, shutdown_channel,
    ConsumerConfig, ConsumerManager, HealthState, IdempotencyGuard, KafkaAdmin, KafkaConnector,
    KafkaProducer, KeyValueCache, RedisCache, RedisRetryStore, ResultCache, RetryConfig,
    RetryStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

const REDIS_CONNECT_ATTEMPTS: u32 = 5;
const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

async fn serve(
    name: &'static str,
    port: u16,
    app: Router,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind {} server to {}", name, addr))?;

    info!(port = %port, "{} server listening", name);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        })
        .await
        .wrap_err_with(|| format!("{} server failed", name))
}

/// Run the code manager
///
/// 1. Sets up tracing and Prometheus metrics
/// 2. Connects to Redis and ensures the Kafka topics exist
/// 3. Registers the result consumers and starts the retry dispatcher
/// 4. Serves the API and health endpoints until SIGINT/SIGTERM
/// 5. Stops consumers, flushes the producer, stops the dispatcher
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let app_info = app_info!();
    info!(name = %app_info.name, version = %app_info.version, "Starting code manager");

    let service_config =
        ServiceConfig::from_env().wrap_err("Failed to load service configuration")?;
    let redis_config = RedisConfig::from_env().wrap_err("Failed to load Redis configuration")?;
    let kafka_config = KafkaConfig::from_env().wrap_err("Failed to load Kafka configuration")?;
    let retry_config = RetryConfig::from_env().wrap_err("Failed to load retry configuration")?;
    let consumer_config = ConsumerConfig::default();

    info!("Connecting to Redis...");
    let redis = connect_redis_with_retry(&redis_config.url, REDIS_CONNECT_ATTEMPTS)
        .await
        .wrap_err("Failed to connect to Redis")?;

    let admin = KafkaAdmin::new(&kafka_config).wrap_err("Failed to create Kafka admin client")?;
    ensure_topics(&admin, &service_config.topic_specs(&retry_config.dlq_topic))
        .await
        .wrap_err("Failed to provision topics")?;
    info!(brokers = %kafka_config.bootstrap_servers(), "Topics ready");

    let producer =
        Arc::new(KafkaProducer::new(&kafka_config).wrap_err("Failed to create producer")?);
    let store: Arc<dyn RetryStore> =
        Arc::new(RedisRetryStore::new(redis.clone(), &retry_config.queue_key));
    let cache: Arc<dyn KeyValueCache> = Arc::new(RedisCache::new(redis.clone()));
    let results = ResultCache::new(cache.clone());
    let guard = IdempotencyGuard::new(cache);
    let problems = Arc::new(
        HttpProblemClient::new(
            &service_config.problem_service_url,
            service_config.problem_service_timeout,
        )
        .wrap_err("Failed to build problem service client")?,
    );

    let connector = Arc::new(KafkaConnector::new(kafka_config.clone(), consumer_config.clone()));
    let manager = ConsumerManager::new(
        store.clone(),
        producer.clone(),
        connector,
        &retry_config,
        consumer_config,
    );

    let ttls = ResultTtls {
        submission: service_config.submission_result_ttl,
        run: service_config.run_result_ttl,
        idempotency: service_config.idempotency_ttl,
    };
    let consumers = register_result_consumers(
        &manager,
        &service_config.topics,
        results.clone(),
        guard,
        problems.clone(),
        ttls,
        &retry_config.dlq_topic,
    )
    .await;
    info!(count = consumers.len(), "Result consumers registered");

    manager.start_retry_dispatcher().await;

    let dispatch = DispatchService::new(
        Arc::new(PatternSanitizer::new()),
        problems,
        results.clone(),
        producer,
        service_config.topics.clone(),
        service_config.problem_details_ttl,
    );
    let api = http::router(AppState {
        dispatch,
        results: ExecutionResultService::new(results),
    });
    let health = health_router(HealthState::new(redis, app_info, store));

    let shutdown = shutdown_channel();
    let served = tokio::try_join!(
        serve("API", service_config.http_port, api, shutdown.clone()),
        serve("Health", service_config.metrics_port, health, shutdown),
    );
    if let Err(e) = &served {
        error!(error = %e, "Server stopped unexpectedly");
    }

    manager
        .shutdown(FLUSH_TIMEOUT)
        .await
        .wrap_err("Producer flush failed during shutdown")?;

    info!("Code manager stopped");
    served.map(|_| ())
}
