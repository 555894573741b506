//! HTTP error type for kwp-ai

use crate::types::TaggingError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Conflict (409) - batch id already running
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Engine error
    #[error(transparent)]
    Tagging(#[from] TaggingError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg),
            ApiError::Tagging(ref err) => match err {
                TaggingError::Configuration(_) => {
                    (StatusCode::BAD_REQUEST, "CONFIGURATION_ERROR", err.to_string())
                }
                TaggingError::Cancelled(_) => (StatusCode::CONFLICT, "CANCELLED", err.to_string()),
                _ => (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "TAGGING_ERROR",
                    err.to_string(),
                ),
            },
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
