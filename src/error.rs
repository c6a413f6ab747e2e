//! Common error types for the generation server

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::queue::job::JobId;
use crate::queue::result::FinishReason;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image codec error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Generation queue is full ({capacity} pending jobs)")]
    QueueFull { capacity: usize },

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Job {0} was cancelled by the caller")]
    Cancelled(JobId),

    #[error("Execution worker is not running")]
    WorkerUnavailable,

    #[error("Generation produced no image (finish reason: {0})")]
    GenerationFailed(FinishReason),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub message: String,
    pub r#type: String,
    pub code: Option<String>,
}

/// nginx-style "client closed request"
const CLIENT_CLOSED_REQUEST: u16 = 499;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = match &self {
            AppError::Config(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", Some("invalid_json")),
            AppError::Image(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", Some("invalid_image")),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request_error", None),
            AppError::QueueFull { .. } => (StatusCode::SERVICE_UNAVAILABLE, "queue_error", Some("queue_full")),
            AppError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "timeout_error", None),
            AppError::Cancelled(_) => (
                StatusCode::from_u16(CLIENT_CLOSED_REQUEST).unwrap_or(StatusCode::BAD_REQUEST),
                "cancelled_error",
                Some("request_cancelled"),
            ),
            AppError::WorkerUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "server_error", Some("worker_unavailable")),
            AppError::GenerationFailed(_) => (StatusCode::INTERNAL_SERVER_ERROR, "generation_error", Some("no_image")),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
        };

        let body = Json(ErrorResponse {
            error: ErrorDetail {
                message: self.to_string(),
                r#type: error_type.to_string(),
                code: code.map(|c| c.to_string()),
            },
        });

        (status, body).into_response()
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, AppError>;
