//! Job processors and the type registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use basejobs_models::{JobType, Room};

use crate::progress::ProgressHandle;

/// Payload rejected before a job is created.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Failure of a running processor. Persisted on the job as `ProcessorError`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct ProcessorError {
    pub message: String,
}

impl ProcessorError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Executor for one job type.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Job type this processor handles.
    fn job_type(&self) -> JobType;

    /// Check a payload before the job is accepted.
    fn validate(&self, payload: &Value) -> Result<(), ValidationError>;

    /// Room whose subscribers may observe the job. Defaults to the payload's `baseId`.
    fn owner_context(&self, payload: &Value) -> Result<Room, ValidationError> {
        payload
            .get("baseId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(Room::new)
            .ok_or_else(|| ValidationError::new("baseId is required"))
    }

    /// Run the job. Progress and log lines go through `progress`.
    async fn run(&self, payload: Value, progress: ProgressHandle) -> Result<Value, ProcessorError>;
}

/// Lookup table from job type to processor.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    processors: HashMap<JobType, Arc<dyn JobProcessor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a processor under its job type, replacing any previous one.
    pub fn register(mut self, processor: Arc<dyn JobProcessor>) -> Self {
        self.processors.insert(processor.job_type(), processor);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobProcessor>> {
        self.processors.get(&job_type).cloned()
    }

    /// Registered job types, sorted by name.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self.processors.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }
}

impl std::fmt::Debug for ProcessorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessorRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}
