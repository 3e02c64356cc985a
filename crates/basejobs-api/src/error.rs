//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use basejobs_queue::QueueError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Queue(e) => match e {
                QueueError::UnknownJobType(_) => StatusCode::BAD_REQUEST,
                QueueError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
                QueueError::JobNotFound(_) => StatusCode::NOT_FOUND,
                QueueError::QueueFull(_) | QueueError::BackendUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                QueueError::InvalidConfig(_)
                | QueueError::Corrupt(_)
                | QueueError::Redis(_)
                | QueueError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    /// Error category name returned to callers.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Validation(_) => "ValidationError",
            ApiError::Queue(e) => e.code(),
        }
    }

    fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Don't expose internal error details in production
        let detail = if self.is_internal()
            && std::env::var("ENVIRONMENT").unwrap_or_default() == "production"
        {
            "An internal error occurred".to_string()
        } else {
            self.to_string()
        };

        if self.is_internal() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = ErrorResponse {
            detail,
            code: Some(self.code().to_string()),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_status_mapping() {
        let cases = [
            (QueueError::unknown_job_type("compress"), StatusCode::BAD_REQUEST),
            (QueueError::Validation("baseId is required".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (QueueError::JobNotFound("x".into()), StatusCode::NOT_FOUND),
            (QueueError::QueueFull(10), StatusCode::SERVICE_UNAVAILABLE),
            (QueueError::backend_unavailable("down"), StatusCode::SERVICE_UNAVAILABLE),
            (QueueError::corrupt("bad hash"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_codes_carry_taxonomy_name() {
        assert_eq!(ApiError::from(QueueError::QueueFull(1)).code(), "QueueFull");
        assert_eq!(ApiError::not_found("job").code(), "NotFound");
        assert_eq!(ApiError::validation("payload").code(), "ValidationError");
    }
}
