//! Prometheus metrics for the delivery core
//!
//! Provides observability into publish, consume, retry and DLQ traffic.

use crate::headers::DlqReason;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use std::time::Duration;
use tracing::info;

static PROMETHEUS_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialize Prometheus metrics
///
/// Call this once at startup. Subsequent calls are no-ops.
pub fn init_metrics() -> Result<(), BuildError> {
    PROMETHEUS_HANDLE.get_or_try_init(|| -> Result<PrometheusHandle, BuildError> {
        let handle = PrometheusBuilder::new().install_recorder()?;
        info!("Prometheus metrics initialized");
        Ok(handle)
    })?;
    Ok(())
}

/// Get the Prometheus handle for rendering metrics
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Render metrics in Prometheus format
pub fn render_metrics() -> String {
    prometheus_handle().map(|h| h.render()).unwrap_or_default()
}

/// Per-topic metrics helper
#[derive(Clone)]
pub struct DeliveryMetrics {
    topic: String,
}

impl DeliveryMetrics {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
        }
    }

    pub fn message_produced(&self, count: u64) {
        counter!(
            "kafka_messages_produced_total",
            "topic" => self.topic.clone(),
            "status" => "success"
        )
        .increment(count);
    }

    pub fn produce_failed(&self, count: u64) {
        counter!(
            "kafka_messages_produced_total",
            "topic" => self.topic.clone(),
            "status" => "failed"
        )
        .increment(count);
    }

    /// Record a message reaching a terminal state; `status` is `processed`,
    /// `retry_scheduled` or `dead_lettered`
    pub fn message_consumed(&self, status: &'static str, duration: Duration) {
        counter!(
            "kafka_messages_consumed_total",
            "topic" => self.topic.clone(),
            "status" => status
        )
        .increment(1);

        histogram!(
            "kafka_handler_duration_seconds",
            "topic" => self.topic.clone()
        )
        .record(duration.as_secs_f64());
    }

    pub fn retry_scheduled(&self) {
        counter!(
            "kafka_retries_scheduled_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn dead_lettered(&self, reason: DlqReason) {
        counter!(
            "kafka_dlq_messages_total",
            "topic" => self.topic.clone(),
            "reason" => reason.as_ref().to_string()
        )
        .increment(1);
    }

    pub fn retry_dispatched(&self) {
        counter!(
            "kafka_retry_dispatched_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }

    pub fn consumer_restarted(&self) {
        counter!(
            "kafka_consumer_restarts_total",
            "topic" => self.topic.clone()
        )
        .increment(1);
    }
}

/// Retry queue depth gauge
pub fn retry_queue_size(queue: &str, size: u64) {
    gauge!("kafka_retry_queue_size", "queue" => queue.to_string()).set(size as f64);
}

/// A dispatcher tick skipped because the previous one was still draining
pub fn retry_tick_skipped() {
    counter!("kafka_retry_ticks_skipped_total").increment(1);
}
