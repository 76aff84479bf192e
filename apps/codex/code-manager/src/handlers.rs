//! Result consumers
//!
//! Each handler follows the same steps: skip if the business id is already
//! marked processed, cache the result for the pull API, apply any upstream
//! side effect, then mark processed. Any error goes back to the consumer
//! runner, which schedules a retry.

use crate::config::TopicNames;
use crate::keys;
use crate::models::{CustomResult, RunResult, SubmissionResult};
use crate::problem_client::ProblemClient;
use async_trait::async_trait;
use kafka_worker::{
    ConsumerHandle, ConsumerManager, HandlerError, IdempotencyGuard, IdempotencyKey,
    InboundMessage, MessageHandler, ResultCache,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Cache and marker lifetimes shared by the result handlers
#[derive(Debug, Clone, Copy)]
pub struct ResultTtls {
    pub submission: Duration,
    pub run: Duration,
    pub idempotency: Duration,
}

async fn already_processed(
    guard: &IdempotencyGuard,
    key: &IdempotencyKey,
) -> Result<bool, HandlerError> {
    let processed = guard.is_processed(key).await?;
    if processed {
        debug!(key = %key, "Result already processed, skipping");
    }
    Ok(processed)
}

pub struct SubmissionResultHandler {
    results: ResultCache,
    guard: IdempotencyGuard,
    problems: Arc<dyn ProblemClient>,
    ttls: ResultTtls,
}

impl SubmissionResultHandler {
    pub fn new(
        results: ResultCache,
        guard: IdempotencyGuard,
        problems: Arc<dyn ProblemClient>,
        ttls: ResultTtls,
    ) -> Self {
        Self {
            results,
            guard,
            problems,
            ttls,
        }
    }
}

#[async_trait]
impl MessageHandler for SubmissionResultHandler {
    type Payload = SubmissionResult;

    fn name(&self) -> &'static str {
        "submission-result"
    }

    #[instrument(skip_all, fields(submission_id = %result.submission_id))]
    async fn handle(
        &self,
        result: SubmissionResult,
        _message: &InboundMessage,
    ) -> Result<(), HandlerError> {
        let marker = IdempotencyKey::new(keys::SUBMISSION_NAMESPACE, &result.submission_id);
        if already_processed(&self.guard, &marker).await? {
            return Ok(());
        }

        self.results
            .set(
                &keys::submission_result(&result.submission_id),
                &result,
                self.ttls.submission,
            )
            .await?;

        self.problems
            .update_submission(&result)
            .await
            .map_err(|e| HandlerError::with_source("submission status update failed", e))?;

        self.guard
            .mark_processed(&marker, self.ttls.idempotency)
            .await?;
        info!(status = %result.status, "Submission result stored");
        Ok(())
    }
}

pub struct RunResultHandler {
    results: ResultCache,
    guard: IdempotencyGuard,
    ttls: ResultTtls,
}

impl RunResultHandler {
    pub fn new(results: ResultCache, guard: IdempotencyGuard, ttls: ResultTtls) -> Self {
        Self {
            results,
            guard,
            ttls,
        }
    }
}

#[async_trait]
impl MessageHandler for RunResultHandler {
    type Payload = RunResult;

    fn name(&self) -> &'static str {
        "run-result"
    }

    #[instrument(skip_all, fields(temp_id = %result.temp_id))]
    async fn handle(&self, result: RunResult, _message: &InboundMessage) -> Result<(), HandlerError> {
        let marker = IdempotencyKey::new(keys::RUN_NAMESPACE, &result.temp_id);
        if already_processed(&self.guard, &marker).await? {
            return Ok(());
        }

        self.results
            .set(&keys::run_result(&result.temp_id), &result, self.ttls.run)
            .await?;
        self.guard
            .mark_processed(&marker, self.ttls.idempotency)
            .await?;

        debug!("Run result stored");
        Ok(())
    }
}

pub struct CustomResultHandler {
    results: ResultCache,
    guard: IdempotencyGuard,
    ttls: ResultTtls,
}

impl CustomResultHandler {
    pub fn new(results: ResultCache, guard: IdempotencyGuard, ttls: ResultTtls) -> Self {
        Self {
            results,
            guard,
            ttls,
        }
    }
}

#[async_trait]
impl MessageHandler for CustomResultHandler {
    type Payload = CustomResult;

    fn name(&self) -> &'static str {
        "custom-result"
    }

    #[instrument(skip_all, fields(temp_id = %result.temp_id))]
    async fn handle(
        &self,
        result: CustomResult,
        _message: &InboundMessage,
    ) -> Result<(), HandlerError> {
        let marker = IdempotencyKey::new(keys::CUSTOM_NAMESPACE, &result.temp_id);
        if already_processed(&self.guard, &marker).await? {
            return Ok(());
        }

        self.results
            .set(&keys::custom_result(&result.temp_id), &result, self.ttls.run)
            .await?;
        self.guard
            .mark_processed(&marker, self.ttls.idempotency)
            .await?;

        debug!("Custom result stored");
        Ok(())
    }
}

/// Register the three result consumers on `manager`
pub async fn register_result_consumers(
    manager: &ConsumerManager,
    topics: &TopicNames,
    results: ResultCache,
    guard: IdempotencyGuard,
    problems: Arc<dyn ProblemClient>,
    ttls: ResultTtls,
    dlq_topic: &str,
) -> Vec<ConsumerHandle> {
    vec![
        manager
            .create_consumer(
                keys::SUBMISSION_RESULTS_GROUP,
                &topics.submission_results,
                SubmissionResultHandler::new(results.clone(), guard.clone(), problems, ttls),
                dlq_topic,
            )
            .await,
        manager
            .create_consumer(
                keys::RUN_RESULTS_GROUP,
                &topics.run_results,
                RunResultHandler::new(results.clone(), guard.clone(), ttls),
                dlq_topic,
            )
            .await,
        manager
            .create_consumer(
                keys::CUSTOM_RESULTS_GROUP,
                &topics.custom_results,
                CustomResultHandler::new(results, guard, ttls),
                dlq_topic,
            )
            .await,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExecutionResult;
    use crate::problem_client::{MockProblemClient, UpstreamError};
    use kafka_worker::testing::InMemoryCache;
    use kafka_worker::{KeyValueCache, MessageHeaders};

    fn ttls() -> ResultTtls {
        ResultTtls {
            submission: Duration::from_secs(300),
            run: Duration::from_secs(300),
            idempotency: Duration::from_secs(86_400),
        }
    }

    fn inbound(topic: &str) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            partition: 0,
            offset: 0,
            key: None,
            payload: None,
            headers: MessageHeaders::default(),
        }
    }

    fn submission_result() -> SubmissionResult {
        SubmissionResult {
            problem_id: "p-1".into(),
            submission_id: "sub-1".into(),
            user_id: "u-1".into(),
            execution_result: ExecutionResult::default(),
            execution_time: 10.0,
            memory_usage: 2.0,
            status: "Accepted".into(),
            score: Some(100.0),
        }
    }

    fn stores(cache: &Arc<InMemoryCache>) -> (ResultCache, IdempotencyGuard) {
        (
            ResultCache::new(cache.clone()),
            IdempotencyGuard::new(cache.clone()),
        )
    }

    #[tokio::test]
    async fn test_submission_result_is_cached_updated_and_marked() {
        let cache = Arc::new(InMemoryCache::new());
        let (results, guard) = stores(&cache);
        let mut problems = MockProblemClient::new();
        problems
            .expect_update_submission()
            .withf(|r| r.submission_id == "sub-1")
            .times(1)
            .returning(|_| Ok(()));

        let handler = SubmissionResultHandler::new(results.clone(), guard.clone(), Arc::new(problems), ttls());
        handler
            .handle(submission_result(), &inbound("submission.results"))
            .await
            .unwrap();

        let cached: Option<SubmissionResult> = results.get("submission:normal:sub-1").await.unwrap();
        assert_eq!(cached.unwrap().status, "Accepted");
        assert!(guard
            .is_processed(&IdempotencyKey::new("submission", "sub-1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_processed_submission_is_skipped() {
        let cache = Arc::new(InMemoryCache::new());
        let (results, guard) = stores(&cache);
        guard
            .mark_processed(&IdempotencyKey::new("submission", "sub-1"), Duration::from_secs(60))
            .await
            .unwrap();

        let mut problems = MockProblemClient::new();
        problems.expect_update_submission().never();

        let handler = SubmissionResultHandler::new(results, guard, Arc::new(problems), ttls());
        handler
            .handle(submission_result(), &inbound("submission.results"))
            .await
            .unwrap();

        assert!(!cache.exists("submission:normal:sub-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_upstream_failure_leaves_marker_unset() {
        let cache = Arc::new(InMemoryCache::new());
        let (results, guard) = stores(&cache);
        let mut problems = MockProblemClient::new();
        problems.expect_update_submission().returning(|_| {
            Err(UpstreamError::Status {
                status: 503,
                message: "down".into(),
            })
        });

        let handler = SubmissionResultHandler::new(results, guard.clone(), Arc::new(problems), ttls());
        let err = handler
            .handle(submission_result(), &inbound("submission.results"))
            .await
            .unwrap_err();

        assert_eq!(err.message(), "submission status update failed");
        assert!(!guard
            .is_processed(&IdempotencyKey::new("submission", "sub-1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_run_and_custom_use_their_own_namespaces() {
        let cache = Arc::new(InMemoryCache::new());
        let (results, guard) = stores(&cache);

        let run = RunResultHandler::new(results.clone(), guard.clone(), ttls());
        run.handle(
            RunResult {
                problem_id: "p-1".into(),
                temp_id: "same-id".into(),
                user_id: "u-1".into(),
                std_out: None,
                status: "Accepted".into(),
                execution_time: 1.0,
                memory_usage: 1.0,
                execution_result: ExecutionResult::default(),
            },
            &inbound("run.results"),
        )
        .await
        .unwrap();

        let custom = CustomResultHandler::new(results, guard.clone(), ttls());
        custom
            .handle(
                CustomResult {
                    temp_id: "same-id".into(),
                    std_out: "hi".into(),
                    status: "Accepted".into(),
                    execution_time: 1.0,
                    memory_usage: 1.0,
                    execution_result: ExecutionResult::default(),
                },
                &inbound("custom.results"),
            )
            .await
            .unwrap();

        assert!(cache.exists("run:normal:same-id").await.unwrap());
        assert!(cache.exists("custom:normal:same-id").await.unwrap());
        assert!(guard.is_processed(&IdempotencyKey::new("run", "same-id")).await.unwrap());
        assert!(guard.is_processed(&IdempotencyKey::new("custom", "same-id")).await.unwrap());
    }
}
