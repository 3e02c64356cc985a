//! Queue error types.

use basejobs_models::UnknownJobType;
use thiserror::Error;

use crate::processor::ValidationError;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Queue is full ({0} jobs waiting)")]
    QueueFull(usize),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Corrupt job record: {0}")]
    Corrupt(String),

    #[error("Redis error: {0}")]
    Redis(redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn unknown_job_type(job_type: impl Into<String>) -> Self {
        Self::UnknownJobType(job_type.into())
    }

    pub fn backend_unavailable(msg: impl Into<String>) -> Self {
        Self::BackendUnavailable(msg.into())
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Stable name of the error category, exposed to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            QueueError::UnknownJobType(_) => "UnknownJobType",
            QueueError::Validation(_) => "ValidationError",
            QueueError::JobNotFound(_) => "NotFound",
            QueueError::QueueFull(_) => "QueueFull",
            QueueError::BackendUnavailable(_) => "BackendUnavailable",
            QueueError::InvalidConfig(_) => "InvalidConfig",
            QueueError::Corrupt(_) | QueueError::Redis(_) | QueueError::Json(_) => "Internal",
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() || e.is_timeout() {
            QueueError::BackendUnavailable(e.to_string())
        } else {
            QueueError::Redis(e)
        }
    }
}

impl From<UnknownJobType> for QueueError {
    fn from(e: UnknownJobType) -> Self {
        QueueError::UnknownJobType(e.0)
    }
}

impl From<ValidationError> for QueueError {
    fn from(e: ValidationError) -> Self {
        QueueError::Validation(e.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(QueueError::unknown_job_type("x").code(), "UnknownJobType");
        assert_eq!(QueueError::from(ValidationError::new("bad")).code(), "ValidationError");
        assert_eq!(QueueError::QueueFull(10).code(), "QueueFull");
    }

    #[test]
    fn test_connection_refused_is_backend_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = QueueError::from(redis::RedisError::from(io));
        assert!(matches!(err, QueueError::BackendUnavailable(_)));
    }
}
