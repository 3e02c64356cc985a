//! Job record store.
//!
//! The store is the single source of truth for job status. Every write made
//! on behalf of a running job carries the attempt number returned by
//! [`JobStore::activate`]; writes from a superseded attempt are rejected so
//! only the worker currently owning a job can change it.

mod memory;
mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use basejobs_models::{Job, JobError, JobId, JobStatus};

use crate::error::QueueResult;

pub use memory::MemoryJobStore;
pub use self::redis::RedisJobStore;

/// Terminal outcome of a job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Completed(Value),
    Failed(JobError),
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(_) => JobStatus::Completed,
            JobOutcome::Failed(_) => JobStatus::Failed,
        }
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new waiting job.
    async fn insert(&self, job: &Job) -> QueueResult<()>;

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>>;

    /// Remove a job that was never handed to a worker (rollback of a failed enqueue).
    async fn remove(&self, id: &JobId) -> QueueResult<()>;

    /// Claim a job for execution. Moves it to active and returns the new
    /// attempt number, or `None` if the job is missing or already terminal.
    async fn activate(&self, id: &JobId) -> QueueResult<Option<u32>>;

    /// Record progress. Returns false if `attempt` no longer owns the job.
    async fn set_progress(&self, id: &JobId, attempt: u32, progress: f64) -> QueueResult<bool>;

    /// Move an active job to its terminal state. Returns false if `attempt`
    /// no longer owns the job or the job is already terminal.
    async fn finish(&self, id: &JobId, attempt: u32, outcome: &JobOutcome) -> QueueResult<bool>;

    /// Fail a job whose owner is gone, regardless of attempt.
    async fn fail_stalled(&self, id: &JobId, error: &JobError) -> QueueResult<bool>;

    /// Drop terminal jobs finished before `cutoff`. Returns the removed ids.
    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> QueueResult<Vec<JobId>>;
}
