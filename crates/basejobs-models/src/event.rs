//! Events published on the job event bus.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::{Job, JobError, JobId, JobStatus, JobType, Room};

/// Payload of an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    /// Plain status transition
    Status,

    /// Completion fraction (0.0 - 1.0)
    Progress { value: f64 },

    /// Free-text log line
    Log { message: String },

    /// Terminal success
    Completed { result: Value },

    /// Terminal failure
    Failed { error: JobError },
}

/// A job event. Ephemeral: only delivered, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub job_id: JobId,
    pub job_type: JobType,
    pub owner_context: Room,
    pub status: JobStatus,
    pub data: EventData,
    pub timestamp: DateTime<Utc>,
}

impl EventMessage {
    fn for_job(job: &Job, status: JobStatus, data: EventData) -> Self {
        Self {
            job_id: job.id.clone(),
            job_type: job.job_type,
            owner_context: job.owner_context.clone(),
            status,
            data,
            timestamp: Utc::now(),
        }
    }

    /// Status transition without extra data.
    pub fn status(job: &Job, status: JobStatus) -> Self {
        Self::for_job(job, status, EventData::Status)
    }

    /// Progress update for an active job.
    pub fn progress(job: &Job, value: f64) -> Self {
        Self::for_job(job, JobStatus::Active, EventData::Progress { value })
    }

    /// Log line for an active job.
    pub fn log(job: &Job, message: impl Into<String>) -> Self {
        Self::for_job(
            job,
            JobStatus::Active,
            EventData::Log {
                message: message.into(),
            },
        )
    }

    /// Terminal success.
    pub fn completed(job: &Job, result: Value) -> Self {
        Self::for_job(job, JobStatus::Completed, EventData::Completed { result })
    }

    /// Terminal failure.
    pub fn failed(job: &Job, error: JobError) -> Self {
        Self::for_job(job, JobStatus::Failed, EventData::Failed { error })
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self.data {
            EventData::Status => "status",
            EventData::Progress { .. } => "progress",
            EventData::Log { .. } => "log",
            EventData::Completed { .. } => "completed",
            EventData::Failed { .. } => "failed",
        }
    }
}
