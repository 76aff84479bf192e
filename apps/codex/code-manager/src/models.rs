//! Requests, job payloads and execution results
//!
//! Everything on the wire is camelCase JSON.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Language {
    Javascript,
    Python,
    Go,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Difficulty {
    Easy,
    Medium,
    Hard,
}

/// One input/expected-output pair; both sides are JSON text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub input: String,
    pub output: String,
}

impl TestCase {
    pub fn new(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            id: None,
            input: input.into(),
            output: output.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseCollection {
    #[serde(default)]
    pub run: Vec<TestCase>,
    #[serde(default)]
    pub submit: Vec<TestCase>,
}

/// Wrapper programs for one language. The wrapper text is stored JSON-encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateCode {
    pub language: Language,
    #[serde(default)]
    pub submit_wrapper_code: Option<String>,
    #[serde(default)]
    pub run_wrapper_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Problem {
    pub id: String,
    pub title: String,
    pub difficulty: Difficulty,
    #[serde(default)]
    pub testcase_collection: Option<TestCaseCollection>,
    #[serde(default)]
    pub template_codes: Vec<TemplateCode>,
}

impl Problem {
    pub fn template_for(&self, language: Language) -> Option<&TemplateCode> {
        self.template_codes.iter().find(|t| t.language == language)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub id: String,
}

/// Body sent upstream to create a submission record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubmission {
    pub problem_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    pub title: String,
    pub language: Language,
    pub user_code: String,
    pub difficulty: Difficulty,
}

// Client requests

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitCodeRequest {
    pub problem_id: String,
    pub user_id: String,
    #[serde(default)]
    pub battle_id: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    pub language: Language,
    pub user_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCodeRequest {
    pub problem_id: String,
    pub user_id: String,
    pub language: Language,
    pub user_code: String,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCodeRequest {
    pub language: Language,
    pub user_code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionAccepted {
    pub submission_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionAccepted {
    pub temp_id: String,
}

// Job payloads

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionJob {
    pub submission_id: String,
    pub executable_code: String,
    pub language: Language,
    pub user_id: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunJob {
    pub problem_id: String,
    pub temp_id: String,
    pub user_id: String,
    pub language: Language,
    pub user_code: String,
    pub executable_code: String,
    pub test_cases: Vec<TestCase>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomJob {
    pub temp_id: String,
    pub user_code: String,
    pub language: Language,
}

// Execution results

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionStats {
    pub total_test_case: u32,
    pub passed_test_case: u32,
    pub failed_test_case: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<f64>,
    #[serde(default, rename = "memoryMB", skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTestCase {
    pub index: u32,
    pub input: String,
    /// Error text or the produced value
    pub output: serde_json::Value,
    pub expected_output: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    #[serde(rename = "Id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub index: String,
    pub input: String,
    pub output: serde_json::Value,
    pub expected_output: String,
    pub passed: bool,
    pub execution_time_ms: f64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ExecutionStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_test_case: Option<FailedTestCase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_results: Option<Vec<TestResult>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionResult {
    pub problem_id: String,
    pub submission_id: String,
    pub user_id: String,
    #[serde(default)]
    pub execution_result: ExecutionResult,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub memory_usage: f64,
    pub status: String,
    #[serde(default)]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResult {
    pub problem_id: String,
    pub temp_id: String,
    pub user_id: String,
    #[serde(default)]
    pub std_out: Option<String>,
    pub status: String,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub execution_result: ExecutionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResult {
    pub temp_id: String,
    #[serde(default)]
    pub std_out: String,
    pub status: String,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub memory_usage: f64,
    #[serde(default)]
    pub execution_result: ExecutionResult,
}

// Pull API responses

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResultResponse {
    pub execution_result: ExecutionResult,
    pub execution_time: f64,
    pub memory_usage: f64,
    pub status: String,
}

impl From<SubmissionResult> for SubmitResultResponse {
    fn from(result: SubmissionResult) -> Self {
        Self {
            execution_result: result.execution_result,
            execution_time: result.execution_time,
            memory_usage: result.memory_usage,
            status: result.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunResultResponse {
    pub execution_result: ExecutionResult,
    pub execution_time: f64,
    pub memory_usage: f64,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub std_out: Option<String>,
}

impl From<RunResult> for RunResultResponse {
    fn from(result: RunResult) -> Self {
        Self {
            execution_result: result.execution_result,
            execution_time: result.execution_time,
            memory_usage: result.memory_usage,
            status: result.status,
            std_out: result.std_out.filter(|s| !s.is_empty()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomResultResponse {
    pub std_out: String,
    pub execution_time: f64,
    pub memory_usage: f64,
}

impl From<CustomResult> for CustomResultResponse {
    fn from(result: CustomResult) -> Self {
        Self {
            std_out: result.std_out,
            execution_time: result.execution_time,
            memory_usage: result.memory_usage,
        }
    }
}
