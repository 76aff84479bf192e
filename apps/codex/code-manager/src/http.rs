//! HTTP transport over the dispatch and pull services

use crate::dispatch::DispatchService;
use crate::error::{DispatchError, ResultLookupError};
use crate::models::{
    CustomCodeRequest, CustomResultResponse, ExecutionAccepted, RunCodeRequest,
    RunResultResponse, SubmissionAccepted, SubmitCodeRequest, SubmitResultResponse,
};
use crate::results::ExecutionResultService;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use serde::Deserialize;

#[derive(Clone)]
pub struct AppState {
    pub dispatch: DispatchService,
    pub results: ExecutionResultService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    pub user_id: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/submissions", post(submit_code))
        .route("/runs", post(run_code))
        .route("/custom", post(custom_code))
        .route("/submissions/{submission_id}/result", get(submission_result))
        .route("/runs/{temp_id}/result", get(run_result))
        .route("/custom/{temp_id}/result", get(custom_result))
        .with_state(state)
}

/// Queue a submission against the problem's hidden test cases
pub async fn submit_code(
    State(state): State<AppState>,
    Json(request): Json<SubmitCodeRequest>,
) -> Result<Json<SubmissionAccepted>, DispatchError> {
    Ok(Json(state.dispatch.submit(request).await?))
}

/// Queue a run against caller-supplied test cases
pub async fn run_code(
    State(state): State<AppState>,
    Json(request): Json<RunCodeRequest>,
) -> Result<Json<ExecutionAccepted>, DispatchError> {
    Ok(Json(state.dispatch.run(request).await?))
}

pub async fn custom_code(
    State(state): State<AppState>,
    Json(request): Json<CustomCodeRequest>,
) -> Result<Json<ExecutionAccepted>, DispatchError> {
    Ok(Json(state.dispatch.custom(request).await?))
}

pub async fn submission_result(
    State(state): State<AppState>,
    Path(submission_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<SubmitResultResponse>, ResultLookupError> {
    Ok(Json(
        state
            .results
            .submission_result(&owner.user_id, &submission_id)
            .await?,
    ))
}

pub async fn run_result(
    State(state): State<AppState>,
    Path(temp_id): Path<String>,
    Query(owner): Query<OwnerQuery>,
) -> Result<Json<RunResultResponse>, ResultLookupError> {
    Ok(Json(state.results.run_result(&owner.user_id, &temp_id).await?))
}

pub async fn custom_result(
    State(state): State<AppState>,
    Path(temp_id): Path<String>,
) -> Result<Json<CustomResultResponse>, ResultLookupError> {
    Ok(Json(state.results.custom_result(&temp_id).await?))
}
