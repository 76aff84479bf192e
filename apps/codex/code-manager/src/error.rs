use crate::problem_client::UpstreamError;
use crate::template::TemplateError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use kafka_worker::{DeliveryError, StoreError};
use serde::Serialize;
use thiserror::Error;

/// Failure to accept a submit/run/custom request
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Sanitizer rejection; the message is shown to the user as is
    #[error("{0}")]
    InvalidCode(String),

    #[error("Problem not found")]
    ProblemNotFound,

    #[error("Template not found for {0}")]
    TemplateNotFound(String),

    #[error("Invalid test cases: {0}")]
    Template(#[from] TemplateError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Job could not be published: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Failure to hand out a cached execution result
#[derive(Debug, Error)]
pub enum ResultLookupError {
    #[error("Submit code result not found")]
    SubmitResultNotFound,

    #[error("Run code result not found")]
    RunResultNotFound,

    #[error("Custom code result not found")]
    CustomResultNotFound,

    #[error("Unauthorized access to execution details.")]
    Unauthorized,

    #[error("Cache error: {0}")]
    Cache(#[from] StoreError),
}

pub type LookupResult<T> = Result<T, ResultLookupError>;

/// Error body shared by every route
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub success: bool,
    pub error_message: String,
}

fn error_response(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ErrorBody {
            success: false,
            error_message: message,
        }),
    )
        .into_response()
}

impl DispatchError {
    pub fn status(&self) -> StatusCode {
        match self {
            DispatchError::InvalidCode(_) | DispatchError::Template(_) => StatusCode::BAD_REQUEST,
            DispatchError::ProblemNotFound | DispatchError::TemplateNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            DispatchError::Upstream(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Delivery(_) | DispatchError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Dispatch failed");
        } else {
            tracing::warn!(error = %self, "Dispatch rejected");
        }
        error_response(status, self.to_string())
    }
}

impl ResultLookupError {
    pub fn status(&self) -> StatusCode {
        match self {
            ResultLookupError::SubmitResultNotFound
            | ResultLookupError::RunResultNotFound
            | ResultLookupError::CustomResultNotFound => StatusCode::NOT_FOUND,
            ResultLookupError::Unauthorized => StatusCode::FORBIDDEN,
            ResultLookupError::Cache(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ResultLookupError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ResultLookupError::Cache(ref e) = self {
            tracing::error!(error = %e, "Result lookup failed");
        }
        error_response(status, self.to_string())
    }
}
