//! Pull API over cached execution results
//!
//! A result is handed out once. Owned results are read, checked against the
//! caller, then claimed by deleting the key; only the caller whose delete
//! removed it gets the result. Custom results have no owner and are taken
//! with a single atomic read-and-remove.

use crate::error::{LookupResult, ResultLookupError};
use crate::keys;
use crate::models::{
    CustomResult, CustomResultResponse, RunResult, RunResultResponse, SubmissionResult,
    SubmitResultResponse,
};
use kafka_worker::ResultCache;
use tracing::{instrument, warn};

#[derive(Clone)]
pub struct ExecutionResultService {
    results: ResultCache,
}

impl ExecutionResultService {
    pub fn new(results: ResultCache) -> Self {
        Self { results }
    }

    #[instrument(skip(self))]
    pub async fn submission_result(
        &self,
        user_id: &str,
        submission_id: &str,
    ) -> LookupResult<SubmitResultResponse> {
        let key = keys::submission_result(submission_id);
        let result: SubmissionResult = self
            .results
            .get(&key)
            .await?
            .ok_or(ResultLookupError::SubmitResultNotFound)?;

        if result.user_id != user_id {
            warn!(owner = %result.user_id, "Submission result requested by another user");
            return Err(ResultLookupError::Unauthorized);
        }

        if !self.results.delete(&key).await? {
            return Err(ResultLookupError::SubmitResultNotFound);
        }
        Ok(result.into())
    }

    #[instrument(skip(self))]
    pub async fn run_result(&self, user_id: &str, temp_id: &str) -> LookupResult<RunResultResponse> {
        let key = keys::run_result(temp_id);
        let result: RunResult = self
            .results
            .get(&key)
            .await?
            .ok_or(ResultLookupError::RunResultNotFound)?;

        if result.user_id != user_id {
            warn!(owner = %result.user_id, "Run result requested by another user");
            return Err(ResultLookupError::Unauthorized);
        }

        if !self.results.delete(&key).await? {
            return Err(ResultLookupError::RunResultNotFound);
        }
        Ok(result.into())
    }

    #[instrument(skip(self))]
    pub async fn custom_result(&self, temp_id: &str) -> LookupResult<CustomResultResponse> {
        let key = keys::custom_result(temp_id);
        let result: CustomResult = self
            .results
            .take(&key)
            .await?
            .ok_or(ResultLookupError::CustomResultNotFound)?;

        if result.temp_id != temp_id {
            return Err(ResultLookupError::Unauthorized);
        }

        Ok(result.into())
    }
}
