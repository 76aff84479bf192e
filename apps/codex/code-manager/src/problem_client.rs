//! Client for the upstream problem service

use crate::models::{CreateSubmission, Problem, Submission, SubmissionResult};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Problem service request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Problem service returned {status}: {message}")]
    Status { status: u16, message: String },
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProblemClient: Send + Sync {
    /// `None` when the problem does not exist
    async fn get_problem(&self, problem_id: &str) -> Result<Option<Problem>, UpstreamError>;

    async fn create_submission(
        &self,
        request: &CreateSubmission,
    ) -> Result<Submission, UpstreamError>;

    /// Record a finished submission. Safe to repeat for the same submission.
    async fn update_submission(&self, result: &SubmissionResult) -> Result<(), UpstreamError>;
}

/// JSON-over-HTTP problem service client
#[derive(Clone)]
pub struct HttpProblemClient {
    client: Client,
    base_url: String,
}

impl HttpProblemClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, UpstreamError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(UpstreamError::Status {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl ProblemClient for HttpProblemClient {
    #[instrument(skip(self))]
    async fn get_problem(&self, problem_id: &str) -> Result<Option<Problem>, UpstreamError> {
        let response = self
            .client
            .get(format!("{}/problems/{}", self.base_url, problem_id))
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Problem not found upstream");
            return Ok(None);
        }

        let problem = Self::check(response).await?.json::<Problem>().await?;
        Ok(Some(problem))
    }

    #[instrument(skip(self, request), fields(problem_id = %request.problem_id, user_id = %request.user_id))]
    async fn create_submission(
        &self,
        request: &CreateSubmission,
    ) -> Result<Submission, UpstreamError> {
        let response = self
            .client
            .post(format!("{}/submissions", self.base_url))
            .json(request)
            .send()
            .await?;

        Ok(Self::check(response).await?.json::<Submission>().await?)
    }

    #[instrument(skip(self, result), fields(submission_id = %result.submission_id))]
    async fn update_submission(&self, result: &SubmissionResult) -> Result<(), UpstreamError> {
        let response = self
            .client
            .put(format!("{}/submissions/{}", self.base_url, result.submission_id))
            .json(result)
            .send()
            .await?;

        Self::check(response).await?;
        Ok(())
    }
}
