//! # Error Handling Module
//!
//! Provides structured error types for LearnPath operations.
//! All errors are propagated with meaningful messages for API consumers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::progress::TransitionError;

/// Result type alias for LearnPath operations
pub type LearnResult<T> = Result<T, LearnError>;

/// Comprehensive error type for all LearnPath operations
#[derive(Error, Debug)]
pub enum LearnError {
    /// Database connection or query errors
    #[error("Database error: {0}")]
    Database(String),

    /// JSON parsing or serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid payload structure
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Checkpoint status change not allowed
    #[error("{0}")]
    Transition(#[from] TransitionError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// Authentication failed
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but not allowed
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource conflict (e.g., user already exists)
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Blob storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// The AI generation service failed or returned garbage
    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl LearnError {
    /// Returns the appropriate HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            LearnError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            LearnError::Json(_) => StatusCode::BAD_REQUEST,
            LearnError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            LearnError::Transition(_) => StatusCode::BAD_REQUEST,
            LearnError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LearnError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            LearnError::Forbidden(_) => StatusCode::FORBIDDEN,
            LearnError::Conflict(_) => StatusCode::CONFLICT,
            LearnError::NotFound(_) => StatusCode::NOT_FOUND,
            LearnError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LearnError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Returns a machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            LearnError::Database(_) => "DATABASE_ERROR",
            LearnError::Json(_) => "JSON_ERROR",
            LearnError::InvalidPayload(_) => "INVALID_PAYLOAD",
            LearnError::Transition(_) => "INVALID_TRANSITION",
            LearnError::Internal(_) => "INTERNAL_ERROR",
            LearnError::Unauthorized(_) => "UNAUTHORIZED",
            LearnError::Forbidden(_) => "FORBIDDEN",
            LearnError::Conflict(_) => "CONFLICT",
            LearnError::NotFound(_) => "NOT_FOUND",
            LearnError::Storage(_) => "STORAGE_ERROR",
            LearnError::Upstream(_) => "UPSTREAM_ERROR",
        }
    }

    /// Create an invalid payload error
    pub fn invalid(msg: impl Into<String>) -> Self {
        LearnError::InvalidPayload(msg.into())
    }

    /// Create an unauthorized error
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        LearnError::Unauthorized(msg.into())
    }

    /// Create a forbidden error
    pub fn forbidden(msg: impl Into<String>) -> Self {
        LearnError::Forbidden(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        LearnError::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        LearnError::NotFound(msg.into())
    }
}

/// Converts LearnError into an Axum HTTP response
impl IntoResponse for LearnError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        let body = Json(json!({
            "error": {
                "code": self.error_code(),
                "message": self.to_string(),
            },
            "success": false,
        }));

        (status, body).into_response()
    }
}

/// Convert rusqlite errors to LearnError
impl From<rusqlite::Error> for LearnError {
    fn from(err: rusqlite::Error) -> Self {
        if err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation) {
            return LearnError::Conflict(err.to_string());
        }
        LearnError::Database(err.to_string())
    }
}

/// Convert tokio-rusqlite errors to LearnError
impl From<tokio_rusqlite::Error> for LearnError {
    fn from(err: tokio_rusqlite::Error) -> Self {
        match err {
            tokio_rusqlite::Error::Rusqlite(inner) => inner.into(),
            other => LearnError::Database(other.to_string()),
        }
    }
}

/// Convert AI service transport errors to LearnError
impl From<reqwest::Error> for LearnError {
    fn from(err: reqwest::Error) -> Self {
        LearnError::Upstream(err.to_string())
    }
}
