//! Typed message headers
//!
//! Headers are the only metadata channel on the wire. Three names are
//! reserved for the retry/DLQ contract and parsed into typed fields; any
//! other header travels untouched in `extra`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::warn;

pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
pub const FIRST_SEEN_HEADER: &str = "x-first-seen";
pub const ERROR_HEADER: &str = "x-error";

/// Why a message ended up on the dead-letter topic
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum DlqReason {
    ParseFailure,
    RetriesExhausted,
    RetryQueueCapacity,
    RetryWorkerFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHeaders {
    /// Number of retries already scheduled for this logical message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,

    /// Epoch seconds of the first failure; set once, never overwritten
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<DlqReason>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl MessageHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry count, absent meaning zero
    pub fn retry_count(&self) -> u32 {
        self.retry_count.unwrap_or(0)
    }

    pub fn with_retry_count(mut self, count: u32) -> Self {
        self.retry_count = Some(count);
        self
    }

    pub fn with_first_seen(mut self, epoch_secs: i64) -> Self {
        self.first_seen = Some(epoch_secs);
        self
    }

    pub fn with_error(mut self, reason: DlqReason) -> Self {
        self.error = Some(reason);
        self
    }

    /// Add a non-reserved header. Reserved names are ignored here; use the typed setters.
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        if !is_reserved(&key) {
            self.extra.insert(key, value.into());
        }
        self
    }

    /// Build from raw wire pairs. Values are byte strings; non-UTF-8 bytes are replaced.
    ///
    /// A reserved header whose value does not parse is dropped with a warning,
    /// so a corrupt `x-retry-count` counts as zero rather than poisoning the message.
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, Option<&'a [u8]>)>,
    {
        let mut headers = Self::default();

        for (key, value) in pairs {
            let value = value
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .unwrap_or_default();

            match key {
                RETRY_COUNT_HEADER => headers.retry_count = parse_reserved(key, &value),
                FIRST_SEEN_HEADER => headers.first_seen = parse_reserved(key, &value),
                ERROR_HEADER => headers.error = parse_reserved(key, &value),
                _ => {
                    headers.extra.insert(key.to_string(), value);
                }
            }
        }

        headers
    }

    /// Flatten into wire pairs, reserved headers first.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::with_capacity(self.extra.len() + 3);

        if let Some(count) = self.retry_count {
            pairs.push((RETRY_COUNT_HEADER.to_string(), count.to_string()));
        }
        if let Some(first_seen) = self.first_seen {
            pairs.push((FIRST_SEEN_HEADER.to_string(), first_seen.to_string()));
        }
        if let Some(reason) = self.error {
            pairs.push((ERROR_HEADER.to_string(), reason.to_string()));
        }

        pairs.extend(self.extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs
    }
}

fn is_reserved(key: &str) -> bool {
    matches!(key, RETRY_COUNT_HEADER | FIRST_SEEN_HEADER | ERROR_HEADER)
}

fn parse_reserved<T: FromStr>(key: &str, value: &str) -> Option<T> {
    match value.trim().parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(header = %key, value = %value, "Ignoring unparseable reserved header");
            None
        }
    }
}
