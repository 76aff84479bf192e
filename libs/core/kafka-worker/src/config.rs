//! Retry and consumer configuration
//!
//! `RetryConfig` is shared by the scheduler (producer side of the retry store)
//! and the dispatcher (consumer side), so both halves agree on key and DLQ topic.

use crate::backoff::BackoffPolicy;
use core_config::{env_or_default, env_parse_or, ConfigError, FromEnv};
use std::time::Duration;

/// Retry scheduling and dispatching settings
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Retries allowed before a message is dead-lettered
    pub max_retries: u32,

    /// Delay before the first retry
    pub base_delay: Duration,

    /// Upper bound for the exponential delay (before jitter)
    pub max_delay: Duration,

    /// Maximum number of envelopes held by the retry store
    pub queue_capacity: u64,

    /// Retry store key
    pub queue_key: String,

    /// Dead-letter topic
    pub dlq_topic: String,

    /// Dispatcher tick interval
    pub poll_interval: Duration,

    /// Maximum envelopes popped per tick
    pub batch_size: usize,
}

impl RetryConfig {
    /// Set the maximum retry count
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the base and maximum delays
    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay = base;
        self.max_delay = max;
        self
    }

    /// Set the retry store capacity
    pub fn with_queue_capacity(mut self, capacity: u64) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the retry store key
    pub fn with_queue_key(mut self, key: impl Into<String>) -> Self {
        self.queue_key = key.into();
        self
    }

    /// Set the dead-letter topic
    pub fn with_dlq_topic(mut self, topic: impl Into<String>) -> Self {
        self.dlq_topic = topic.into();
        self
    }

    /// Set the dispatcher tick interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the dispatcher batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_delay, self.max_delay)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            queue_capacity: 10_000,
            queue_key: "retry-queue".to_string(),
            dlq_topic: "dlq-queue".to_string(),
            poll_interval: Duration::from_millis(5000),
            batch_size: 100,
        }
    }
}

impl FromEnv for RetryConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        Ok(Self {
            max_retries: env_parse_or("KAFKA_MAX_RETRIES", defaults.max_retries)?,
            base_delay: Duration::from_secs(env_parse_or(
                "KAFKA_RETRY_BASE_DELAY_SECS",
                defaults.base_delay.as_secs(),
            )?),
            max_delay: Duration::from_secs(env_parse_or(
                "KAFKA_RETRY_MAX_DELAY_SECS",
                defaults.max_delay.as_secs(),
            )?),
            queue_capacity: env_parse_or("KAFKA_RETRY_QUEUE_CAPACITY", defaults.queue_capacity)?,
            queue_key: env_or_default("KAFKA_RETRY_QUEUE_KEY", &defaults.queue_key),
            dlq_topic: env_or_default("KAFKA_DLQ_TOPIC", &defaults.dlq_topic),
            poll_interval: Duration::from_millis(env_parse_or(
                "KAFKA_RETRY_POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )?),
            batch_size: env_parse_or::<usize>("KAFKA_RETRY_BATCH_SIZE", defaults.batch_size)?
                .max(1),
        })
    }
}

/// Consumer loop settings
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerConfig {
    /// Wait before rebuilding a consumer whose fetch loop aborted
    pub restart_backoff: Duration,

    /// Group session timeout handed to the broker client
    pub session_timeout: Duration,

    /// Where a new group starts reading (`earliest` or `latest`)
    pub auto_offset_reset: String,
}

impl ConsumerConfig {
    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.restart_backoff = backoff;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            restart_backoff: Duration::from_secs(1),
            session_timeout: Duration::from_secs(30),
            auto_offset_reset: "earliest".to_string(),
        }
    }
}
