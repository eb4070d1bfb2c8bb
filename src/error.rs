//! # Error Handling and Response Types
//!
//! Standardized error types, response formats, and HTTP status mappings for
//! the cache server. All API errors serialize to a consistent JSON shape:
//!
//! ```json
//! {
//!   "error": "Human-readable error message",
//!   "code": "machine_readable_error_code",
//!   "timestamp": "2024-01-01T12:00:00Z"
//! }
//! ```
//!
//! Error classifications map to HTTP statuses:
//!
//! - **NotFound** (404): the Store has no entry; drives the miss path
//! - **BadRequest** (400): malformed client input
//! - **Upstream** (502): the real registry could not be reached
//! - **DigestMismatch / Corrupt / Io / Internal** (500): local failures
//!
//! Internal details (paths, sources) go to the log, never to the client.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use serde::Serialize;

/// Standardized error response body for API consistency.
#[derive(Serialize, Debug)]
pub struct ApiErrorResponse {
    pub error: String,
    pub code: String,
    pub timestamp: String,
}

/// Machine-readable error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotFound,
    ValidationError,
    UpstreamError,
    InternalError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NotFound => "not_found",
            ErrorCode::ValidationError => "validation_error",
            ErrorCode::UpstreamError => "upstream_error",
            ErrorCode::InternalError => "internal_error",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            ErrorCode::NotFound => StatusCode::NOT_FOUND,
            ErrorCode::ValidationError => StatusCode::BAD_REQUEST,
            ErrorCode::UpstreamError => StatusCode::BAD_GATEWAY,
            ErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Application-specific error types.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    NotFound(String),

    #[error("digest mismatch: expected {expected}, computed {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("upstream request failed: {0}")]
    Upstream(String),

    #[error("internal server error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Whether this error means "no cache entry" rather than a real failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::NotFound(_))
    }

    pub fn error_code(&self) -> ErrorCode {
        match self {
            AppError::NotFound(_) => ErrorCode::NotFound,
            AppError::BadRequest(_) | AppError::Json(_) => ErrorCode::ValidationError,
            AppError::Upstream(_) => ErrorCode::UpstreamError,
            AppError::Io(_)
            | AppError::DigestMismatch { .. }
            | AppError::Corrupt(_)
            | AppError::Internal(_)
            | AppError::Anyhow(_) => ErrorCode::InternalError,
        }
    }

    /// Create a standardized error response body.
    ///
    /// The message for 5xx classes is generic so that internal paths and
    /// error sources never leak to clients; the full error is logged.
    pub fn to_error_response(&self) -> ApiErrorResponse {
        let code = self.error_code();
        let error = match code {
            ErrorCode::InternalError => "internal server error".to_string(),
            ErrorCode::UpstreamError => "upstream registry unavailable".to_string(),
            _ => self.to_string(),
        };
        ApiErrorResponse {
            error,
            code: code.as_str().to_string(),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, code = self.error_code().as_str(), "Request failed");

        let status = self.error_code().http_status();
        let body = self.to_error_response();
        (status, axum::Json(body)).into_response()
    }
}

/// Convenient result type for application operations.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            AppError::NotFound("x".into()).error_code().http_status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Upstream("x".into()).error_code().http_status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::BadRequest("x".into()).error_code().http_status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Corrupt("x".into()).error_code().http_status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_errors_do_not_leak_details() {
        let err = AppError::Io(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "/var/cache/secret-path",
        ));
        let body = err.to_error_response();
        assert!(!body.error.contains("secret-path"));
        assert_eq!(body.code, "internal_error");
    }

    #[test]
    fn test_not_found_is_recoverable() {
        assert!(AppError::NotFound("blob".into()).is_not_found());
        assert!(!AppError::Corrupt("manifest".into()).is_not_found());
    }
}
