//! Unified error handling for the server.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Carries the `Allow` value for the resource.
    #[error("Method not allowed")]
    MethodNotAllowed(String),
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::MethodNotAllowed(allow) => {
                tracing::debug!(allow = %allow, "Rejected write to read-only collection");
                (
                    StatusCode::METHOD_NOT_ALLOWED,
                    "Method not allowed".to_string(),
                    Some(format!("allowed: {}", allow)),
                )
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
            details,
        });

        match self {
            AppError::MethodNotAllowed(allow) => (status, [(header::ALLOW, allow)], body).into_response(),
            _ => (status, body).into_response(),
        }
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;
