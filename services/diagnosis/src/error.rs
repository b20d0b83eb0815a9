use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced at the HTTP boundary.
///
/// The message of each variant is what the caller sees. Underlying causes are
/// logged where the error is raised and never carried into the response.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed upload
    #[error("{0}")]
    Validation(String),

    /// Upload larger than the configured body limit
    #[error("{0}")]
    PayloadTooLarge(String),

    /// Plant, disease, solution or history row absent
    #[error("{0}")]
    NotFound(String),

    /// Store unreachable, storage upload failed or classifier failed
    #[error("{0}")]
    Dependency(String),

    /// Anything unexpected
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Dependency(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
            ApiError::NotFound(_) => "NOT_FOUND",
            ApiError::Dependency(_) => "DEPENDENCY_ERROR",
            ApiError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub status: &'static str,
    pub message: String,
    pub code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            status: "fail",
            message: self.to_string(),
            code: self.code(),
        };

        (self.status(), Json(body)).into_response()
    }
}
