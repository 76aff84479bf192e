//! Cache keys, idempotency namespaces and consumer groups

pub const SUBMISSION_NAMESPACE: &str = "submission";
pub const RUN_NAMESPACE: &str = "run";
pub const CUSTOM_NAMESPACE: &str = "custom";

pub const SUBMISSION_RESULTS_GROUP: &str = "cm-submission-results";
pub const RUN_RESULTS_GROUP: &str = "cm-run-results";
pub const CUSTOM_RESULTS_GROUP: &str = "cm-custom-results";

pub fn problem_details(problem_id: &str) -> String {
    format!("problem:details:{}", problem_id)
}

pub fn submission_result(submission_id: &str) -> String {
    format!("submission:normal:{}", submission_id)
}

pub fn run_result(temp_id: &str) -> String {
    format!("run:normal:{}", temp_id)
}

pub fn custom_result(temp_id: &str) -> String {
    format!("custom:normal:{}", temp_id)
}
