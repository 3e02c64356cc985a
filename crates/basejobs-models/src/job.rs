//! Job records and lifecycle status.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier for a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Live delivery scope of a job, one per base or session context.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Room(pub String);

impl Room {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job status. Transitions are monotone: waiting -> active -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Accepted, not yet claimed by a worker
    #[default]
    Waiting,
    /// Claimed by a worker
    Active,
    /// Finished with a result
    Completed,
    /// Finished with a categorized error
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotone.
    ///
    /// `Active -> Active` is allowed: a stalled job is re-claimed without
    /// going back to waiting.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Waiting, JobStatus::Active) => true,
            (JobStatus::Active, JobStatus::Active) => true,
            (JobStatus::Active, JobStatus::Completed | JobStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobStatus::Waiting),
            "active" => Ok(JobStatus::Active),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("invalid job status: {}", other)),
        }
    }
}

/// Returned when a job type name has no known variant.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unknown job type: {0}")]
pub struct UnknownJobType(pub String);

/// Type of job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Export a base into a downloadable document
    Export,
    /// Import an export document into a base
    Import,
    /// Copy a base under a new id
    Duplicate,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Export => "export",
            JobType::Import => "import",
            JobType::Duplicate => "duplicate",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = UnknownJobType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export" => Ok(JobType::Export),
            "import" => Ok(JobType::Import),
            "duplicate" => Ok(JobType::Duplicate),
            other => Err(UnknownJobType(other.to_string())),
        }
    }
}

/// Failure categories persisted on failed jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum ErrorCategory {
    /// The processor ran and failed (returned an error or panicked)
    ProcessorError,
    /// The job's worker died more often than the retry budget allows
    StalledJobExceeded,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::ProcessorError => "ProcessorError",
            ErrorCategory::StalledJobExceeded => "StalledJobExceeded",
        }
    }
}

/// Categorized failure stored on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobError {
    pub category: ErrorCategory,
    pub message: String,
}

impl JobError {
    pub fn processor(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::ProcessorError,
            message: message.into(),
        }
    }

    pub fn stalled(message: impl Into<String>) -> Self {
        Self {
            category: ErrorCategory::StalledJobExceeded,
            message: message.into(),
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.category.as_str(), self.message)
    }
}

/// A job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// Job type
    #[serde(rename = "type")]
    pub job_type: JobType,

    /// Processor-specific payload
    pub payload: Value,

    /// Room allowed to observe this job
    pub owner_context: Room,

    /// Lifecycle status
    pub status: JobStatus,

    /// Last reported completion fraction (0.0 - 1.0)
    #[serde(default)]
    pub progress: f64,

    /// Number of claims by a worker; the current claim's fencing token
    #[serde(default)]
    pub attempts: u32,

    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,

    /// Present only when completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Present only when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JobError>,
}

impl Job {
    /// Create a new waiting job.
    pub fn new(job_type: JobType, payload: Value, owner_context: Room) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            payload,
            owner_context,
            status: JobStatus::Waiting,
            progress: 0.0,
            attempts: 0,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_job_creation() {
        let job = Job::new(JobType::Export, json!({"baseId": "b1"}), Room::new("b1"));

        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.attempts, 0);
        assert!(job.result.is_none());
        assert!(job.error.is_none());
        assert!(!job.id.as_str().is_empty());
    }

    #[test]
    fn test_job_serializes_camel_case() {
        let job = Job::new(JobType::Duplicate, json!({}), Room::new("b1"));
        let value = serde_json::to_value(&job).unwrap();

        assert_eq!(value["type"], "duplicate");
        assert_eq!(value["ownerContext"], "b1");
        assert_eq!(value["status"], "waiting");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("result").is_none());
    }

    #[test]
    fn test_status_transitions_are_monotone() {
        assert!(JobStatus::Waiting.can_transition_to(JobStatus::Active));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Active));
        assert!(JobStatus::Active.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Active.can_transition_to(JobStatus::Waiting));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Active));
    }

    #[test]
    fn test_job_type_parse() {
        assert_eq!("export".parse::<JobType>().unwrap(), JobType::Export);
        assert_eq!(
            "no-such-type".parse::<JobType>(),
            Err(UnknownJobType("no-such-type".to_string()))
        );
    }

    #[test]
    fn test_error_category_wire_name() {
        let err = JobError::processor("boom");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["category"], "ProcessorError");

        let stalled = JobError::stalled("worker died");
        assert_eq!(serde_json::to_value(&stalled).unwrap()["category"], "StalledJobExceeded");
    }
}
