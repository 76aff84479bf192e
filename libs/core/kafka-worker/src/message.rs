//! Message types flowing through the producer, consumer and retry store

use crate::headers::{DlqReason, MessageHeaders};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message to be published. The topic is chosen at publish time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Partition key
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: MessageHeaders,
}

impl OutboundMessage {
    /// Raw bytes or an already-encoded string, sent as is
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            key: None,
            payload: payload.into(),
            headers: MessageHeaders::default(),
        }
    }

    /// Serialize a value as the JSON payload
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_headers(mut self, headers: MessageHeaders) -> Self {
        self.headers = headers;
        self
    }

    /// Original payload and key, tagged with the reason it was dead-lettered.
    pub fn dead_letter(
        key: Option<String>,
        payload: Vec<u8>,
        headers: MessageHeaders,
        reason: DlqReason,
    ) -> Self {
        Self {
            key,
            payload,
            headers: headers.with_error(reason),
        }
    }
}

/// A message received from a topic, detached from the client's buffers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Option<Vec<u8>>,
    pub headers: MessageHeaders,
}

impl InboundMessage {
    /// Offset to commit once this message has reached a terminal state
    pub fn next_offset(&self) -> i64 {
        self.offset + 1
    }

    pub fn payload_bytes(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or_default()
    }
}

/// Durable record of a failed message and when it may be redelivered.
///
/// Stored in the retry store as JSON, scored by `next_retry_at`. The `id`
/// keeps two identical failed payloads from collapsing into one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEnvelope {
    pub id: Uuid,
    pub original_topic: String,
    pub key: Option<String>,
    pub value: Vec<u8>,
    pub headers: MessageHeaders,
    /// Epoch seconds
    pub next_retry_at: i64,
}

impl RetryEnvelope {
    pub fn new(message: &InboundMessage, headers: MessageHeaders, next_retry_at: i64) -> Self {
        Self {
            id: Uuid::now_v7(),
            original_topic: message.topic.clone(),
            key: message.key.clone(),
            value: message.payload_bytes().to_vec(),
            headers,
            next_retry_at,
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// The message to republish, verbatim, on the original topic
    pub fn to_outbound(&self) -> OutboundMessage {
        OutboundMessage {
            key: self.key.clone(),
            payload: self.value.clone(),
            headers: self.headers.clone(),
        }
    }
}
