//! Health check handlers for delivery services.
//!
//! - Liveness probes (`/health`, `/healthz`)
//! - Readiness probes (`/ready`, `/readyz`): Redis `PING`
//! - Retry store depth (`/retry/info`)
//! - Prometheus metrics (`/metrics`)

use crate::metrics;
use crate::retry_store::RetryStore;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use core_config::AppInfo;
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Shared state for health endpoints.
#[derive(Clone)]
pub struct HealthState {
    /// Redis connection for readiness checks; `None` skips the check
    pub redis: Option<ConnectionManager>,
    pub app: AppInfo,
    pub retry_store: Arc<dyn RetryStore>,
}

impl HealthState {
    pub fn new(redis: ConnectionManager, app: AppInfo, retry_store: Arc<dyn RetryStore>) -> Self {
        Self {
            redis: Some(redis),
            app,
            retry_store,
        }
    }

    /// State without a Redis readiness check
    pub fn without_redis(app: AppInfo, retry_store: Arc<dyn RetryStore>) -> Self {
        Self {
            redis: None,
            app,
            retry_store,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub name: String,
    pub version: String,
}

/// Liveness probe. Always OK while the process serves requests.
pub async fn health_handler(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        name: state.app.name.to_string(),
        version: state.app.version.to_string(),
    })
}

/// Readiness probe.
pub async fn ready_handler(
    State(state): State<HealthState>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let Some(mut conn) = state.redis.clone() else {
        return Ok((StatusCode::OK, Json(json!({ "status": "ready", "checks": {} }))));
    };

    let result: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;

    match result {
        Ok(response) if response == "PONG" => Ok((
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "checks": { "redis": "ok" }
            })),
        )),
        Ok(response) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("unexpected response: {}", response) }
            })),
        )),
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "checks": { "redis": format!("error: {}", e) }
            })),
        )),
    }
}

/// Retry store depth
pub async fn retry_info_handler(
    State(state): State<HealthState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.retry_store.len().await {
        Ok(size) => {
            metrics::retry_queue_size(state.retry_store.name(), size);
            Ok(Json(json!({
                "queue": state.retry_store.name(),
                "size": size,
            })))
        }
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": format!("Failed to read retry store: {}", e) })),
        )),
    }
}

/// Prometheus scrape endpoint.
pub async fn metrics_handler() -> impl IntoResponse {
    match metrics::prometheus_handle() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            "Metrics not initialized. Call metrics::init_metrics() at startup.".to_string(),
        )
            .into_response(),
    }
}

pub fn health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/readyz", get(ready_handler))
        .route("/retry/info", get(retry_info_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryRetryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    fn state(store: Arc<InMemoryRetryStore>) -> HealthState {
        HealthState::without_redis(core_config::app_info!(), store)
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_liveness_reports_app() {
        let router = health_router(state(Arc::new(InMemoryRetryStore::new("retry-queue"))));
        let (status, body) = get_json(router, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["name"], "kafka-worker");
    }

    #[tokio::test]
    async fn test_retry_info() {
        let store = Arc::new(InMemoryRetryStore::new("retry-queue"));
        store.push(1, "a").await.unwrap();
        store.push(2, "b").await.unwrap();

        let (status, body) = get_json(health_router(state(store.clone())), "/retry/info").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queue"], "retry-queue");
        assert_eq!(body["size"], 2);

        store.set_failing(true).await;
        let (status, _) = get_json(health_router(state(store)), "/retry/info").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_ready_without_redis() {
        let router = health_router(state(Arc::new(InMemoryRetryStore::new("retry-queue"))));
        let (status, body) = get_json(router, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
    }
}
