//! Job dispatch: validate a request, build the job and publish it

use crate::config::TopicNames;
use crate::error::{DispatchError, DispatchResult};
use crate::keys;
use crate::models::{
    CreateSubmission, CustomCodeRequest, CustomJob, ExecutionAccepted, Language, Problem,
    RunCodeRequest, RunJob, SubmissionAccepted, SubmissionJob, SubmitCodeRequest,
};
use crate::problem_client::ProblemClient;
use crate::sanitizer::CodeSanitizer;
use crate::template::{decode_wrapper, populate_template};
use kafka_worker::{DeliveryError, MessagePublisher, OutboundMessage, ResultCache};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};
use uuid::Uuid;

#[derive(Clone)]
pub struct DispatchService {
    sanitizer: Arc<dyn CodeSanitizer>,
    problems: Arc<dyn ProblemClient>,
    problem_cache: ResultCache,
    publisher: Arc<dyn MessagePublisher>,
    topics: TopicNames,
    problem_ttl: Duration,
}

impl DispatchService {
    pub fn new(
        sanitizer: Arc<dyn CodeSanitizer>,
        problems: Arc<dyn ProblemClient>,
        problem_cache: ResultCache,
        publisher: Arc<dyn MessagePublisher>,
        topics: TopicNames,
        problem_ttl: Duration,
    ) -> Self {
        Self {
            sanitizer,
            problems,
            problem_cache,
            publisher,
            topics,
            problem_ttl,
        }
    }

    fn screen(&self, code: &str, language: Language) -> DispatchResult<()> {
        let outcome = self.sanitizer.sanitize(code, language);
        if outcome.valid {
            return Ok(());
        }
        Err(DispatchError::InvalidCode(outcome.error.unwrap_or_else(|| {
            "Syntax Error: Code rejected by sanitizer.".to_string()
        })))
    }

    /// Cache-aside problem lookup
    async fn problem(&self, problem_id: &str) -> DispatchResult<Problem> {
        let key = keys::problem_details(problem_id);

        if let Some(problem) = self.problem_cache.get::<Problem>(&key).await? {
            debug!(problem_id = %problem_id, "Problem details served from cache");
            return Ok(problem);
        }

        let problem = self
            .problems
            .get_problem(problem_id)
            .await?
            .ok_or(DispatchError::ProblemNotFound)?;
        self.problem_cache.set(&key, &problem, self.problem_ttl).await?;

        Ok(problem)
    }

    async fn publish<T: Serialize>(&self, topic: &str, key: &str, job: &T) -> DispatchResult<()> {
        let message = OutboundMessage::json(job)
            .map_err(|source| DeliveryError::Serialization {
                topic: topic.to_string(),
                source,
            })?
            .with_key(key);
        self.publisher.publish(topic, message).await?;
        Ok(())
    }

    /// Create a submission upstream and queue it against the problem's submit test cases
    #[instrument(skip(self, request), fields(problem_id = %request.problem_id, user_id = %request.user_id, language = %request.language))]
    pub async fn submit(&self, request: SubmitCodeRequest) -> DispatchResult<SubmissionAccepted> {
        self.screen(&request.user_code, request.language)?;

        let problem = self.problem(&request.problem_id).await?;
        let test_cases = problem
            .testcase_collection
            .as_ref()
            .map(|c| c.submit.clone())
            .filter(|cases| !cases.is_empty())
            .ok_or(DispatchError::ProblemNotFound)?;

        let submission = self
            .problems
            .create_submission(&CreateSubmission {
                problem_id: request.problem_id.clone(),
                user_id: request.user_id.clone(),
                battle_id: request.battle_id.clone(),
                country: request.country.clone(),
                title: problem.title.clone(),
                language: request.language,
                user_code: request.user_code.clone(),
                difficulty: problem.difficulty,
            })
            .await?;

        let wrapper = problem
            .template_for(request.language)
            .and_then(|t| t.submit_wrapper_code.as_deref())
            .ok_or_else(|| DispatchError::TemplateNotFound(request.language.to_string()))?;
        let executable_code = populate_template(
            request.language,
            &decode_wrapper(wrapper)?,
            &request.user_code,
            &test_cases,
        )?;

        let job = SubmissionJob {
            submission_id: submission.id.clone(),
            executable_code,
            language: request.language,
            user_id: request.user_id,
            test_cases,
        };
        self.publish(&self.topics.submission_jobs, &job.submission_id, &job)
            .await?;

        info!(submission_id = %submission.id, "Submission job dispatched");
        Ok(SubmissionAccepted {
            submission_id: submission.id,
        })
    }

    /// Queue a run against the caller's own test cases
    #[instrument(skip(self, request), fields(problem_id = %request.problem_id, user_id = %request.user_id, language = %request.language))]
    pub async fn run(&self, request: RunCodeRequest) -> DispatchResult<ExecutionAccepted> {
        let temp_id = Uuid::new_v4().to_string();
        self.screen(&request.user_code, request.language)?;

        let problem = self.problem(&request.problem_id).await?;
        let wrapper = problem
            .template_for(request.language)
            .and_then(|t| t.run_wrapper_code.as_deref())
            .ok_or_else(|| DispatchError::TemplateNotFound(request.language.to_string()))?;
        let executable_code = populate_template(
            request.language,
            &decode_wrapper(wrapper)?,
            &request.user_code,
            &request.test_cases,
        )?;

        let job = RunJob {
            problem_id: request.problem_id,
            temp_id: temp_id.clone(),
            user_id: request.user_id,
            language: request.language,
            user_code: request.user_code,
            executable_code,
            test_cases: request.test_cases,
        };
        self.publish(&self.topics.run_jobs, &temp_id, &job).await?;

        info!(temp_id = %temp_id, "Run job dispatched");
        Ok(ExecutionAccepted { temp_id })
    }

    /// Queue free-form code with no problem attached
    #[instrument(skip(self, request), fields(language = %request.language))]
    pub async fn custom(&self, request: CustomCodeRequest) -> DispatchResult<ExecutionAccepted> {
        let temp_id = Uuid::new_v4().to_string();
        self.screen(&request.user_code, request.language)?;

        let job = CustomJob {
            temp_id: temp_id.clone(),
            user_code: request.user_code,
            language: request.language,
        };
        self.publish(&self.topics.custom_jobs, &temp_id, &job).await?;

        info!(temp_id = %temp_id, "Custom job dispatched");
        Ok(ExecutionAccepted { temp_id })
    }
}
