//! Worker error types.

use basejobs_queue::ProcessorError;
use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Base not found: {0}")]
    BaseNotFound(String),

    #[error("Malformed export document: {0}")]
    MalformedFile(String),

    #[error("Unsupported export version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WorkerError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedFile(msg.into())
    }

    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }
}

impl From<WorkerError> for ProcessorError {
    fn from(e: WorkerError) -> Self {
        ProcessorError::new(e.to_string())
    }
}
