//! Error types for the delivery core
//!
//! Errors are categorized to decide what the consumer loop does next:
//! - **Permanent**: deterministic given the input (undecodable payload), never retried
//! - **Transient**: infrastructure or handler failures worth another attempt

use thiserror::Error;

/// Category of error for determining retry behavior
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary failure, retried by the scheduler or by reconnecting
    Transient,
    /// Unrecoverable, routed to the DLQ immediately
    Permanent,
}

/// Producer-side failure, surfaced synchronously to the caller of `publish`.
///
/// The producer never retries on its own; the caller decides.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Broker rejected or did not acknowledge the message
    #[error("broker rejected message for topic '{topic}': {reason}")]
    Rejected { topic: String, reason: String },

    /// At least one message of a batch was not acknowledged; treat the whole batch as undelivered
    #[error("batch for topic '{topic}' failed: {failed} of {total} messages not acknowledged ({reason})")]
    BatchFailed {
        topic: String,
        failed: usize,
        total: usize,
        reason: String,
    },

    /// Value could not be turned into bytes
    #[error("failed to serialize payload for topic '{topic}': {source}")]
    Serialization {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// Flushing outstanding messages failed or timed out
    #[error("producer flush failed: {0}")]
    Flush(String),
}

/// Failure talking to a shared store (retry store, cache, idempotency guard).
#[derive(Error, Debug)]
pub enum StoreError {
    /// Redis connection or command error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Store rejected the operation (used by in-memory doubles to simulate outages)
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Payload could not be turned into the handler's input type.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("payload is not valid {expected}: {source}")]
    Json {
        expected: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Failure reported by a message handler. Always retried through the scheduler.
#[derive(Error, Debug)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an underlying error, keeping it as the source
    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        HandlerError::with_source("store operation failed", err)
    }
}

/// Topic provisioning failure
#[derive(Error, Debug)]
pub enum AdminError {
    #[error("failed to create topic '{topic}': {reason}")]
    CreateTopic { topic: String, reason: String },

    #[error("Kafka admin error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// Failure while deciding or recording the fate of a failed message.
///
/// Every variant means the message's future was NOT made durable, so the
/// offset must not be committed.
#[derive(Error, Debug)]
pub enum ScheduleError {
    /// Durable write of the retry envelope failed
    #[error("retry store write failed: {0}")]
    RetryStoreWrite(#[from] StoreError),

    /// Dead-letter publish for an exhausted or shed message failed
    #[error("dead-letter publish failed: {0}")]
    DeadLetter(#[from] DeliveryError),

    #[error("failed to encode retry envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors that abort the current consumer fetch loop without committing.
#[derive(Error, Debug)]
pub enum ConsumerError {
    /// Retry could not be scheduled; the broker will redeliver from the last commit
    #[error("retry scheduling failed, offset not committed: {0}")]
    Schedule(#[from] ScheduleError),

    /// Undecodable message could not be routed to the DLQ
    #[error("failed to dead-letter undecodable message: {0}")]
    DeadLetter(#[source] DeliveryError),

    #[error("offset commit failed: {0}")]
    Commit(String),

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ConsumerError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            ConsumerError::Config(_) => ErrorCategory::Permanent,
            _ => ErrorCategory::Transient,
        }
    }
}
