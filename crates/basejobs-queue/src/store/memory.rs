use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use basejobs_models::{Job, JobError, JobId, JobStatus};

use super::{JobOutcome, JobStore};
use crate::error::QueueResult;

/// In-process job store used by the fallback backend.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub async fn len(&self) -> usize {
        self.jobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.read().await.is_empty()
    }
}

fn owned_by(job: &Job, attempt: u32) -> bool {
    job.status == JobStatus::Active && job.attempts == attempt
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        self.jobs.write().await.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        Ok(self.jobs.read().await.get(id).cloned())
    }

    async fn remove(&self, id: &JobId) -> QueueResult<()> {
        self.jobs.write().await.remove(id);
        Ok(())
    }

    async fn activate(&self, id: &JobId) -> QueueResult<Option<u32>> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(None);
        };
        if !job.status.can_transition_to(JobStatus::Active) {
            return Ok(None);
        }
        job.status = JobStatus::Active;
        job.attempts += 1;
        job.started_at = Some(Utc::now());
        Ok(Some(job.attempts))
    }

    async fn set_progress(&self, id: &JobId, attempt: u32, progress: f64) -> QueueResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if owned_by(job, attempt) => {
                job.progress = progress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish(&self, id: &JobId, attempt: u32, outcome: &JobOutcome) -> QueueResult<bool> {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(id) else {
            return Ok(false);
        };
        if !owned_by(job, attempt) {
            return Ok(false);
        }
        job.status = outcome.status();
        job.finished_at = Some(Utc::now());
        match outcome {
            JobOutcome::Completed(result) => {
                job.progress = 1.0;
                job.result = Some(result.clone());
            }
            JobOutcome::Failed(error) => job.error = Some(error.clone()),
        }
        Ok(true)
    }

    async fn fail_stalled(&self, id: &JobId, error: &JobError) -> QueueResult<bool> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(id) {
            Some(job) if job.status == JobStatus::Active => {
                job.status = JobStatus::Failed;
                job.finished_at = Some(Utc::now());
                job.error = Some(error.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn purge_finished(&self, cutoff: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        let mut jobs = self.jobs.write().await;
        let expired: Vec<JobId> = jobs
            .values()
            .filter(|job| job.is_terminal() && job.finished_at.map(|t| t < cutoff).unwrap_or(false))
            .map(|job| job.id.clone())
            .collect();
        for id in &expired {
            jobs.remove(id);
        }
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basejobs_models::{JobType, Room};
    use serde_json::json;

    fn job() -> Job {
        Job::new(JobType::Export, json!({"baseId": "b1"}), Room::new("b1"))
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();

        let attempt = store.activate(&job.id).await.unwrap().unwrap();
        assert_eq!(attempt, 1);
        assert!(store.set_progress(&job.id, attempt, 0.5).await.unwrap());

        let outcome = JobOutcome::Completed(json!({"fileUrl": "file:///x"}));
        assert!(store.finish(&job.id, attempt, &outcome).await.unwrap());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert_eq!(stored.result, Some(json!({"fileUrl": "file:///x"})));
        assert!(stored.error.is_none());
        assert!(stored.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_terminal_is_immutable() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();
        let attempt = store.activate(&job.id).await.unwrap().unwrap();

        let failed = JobOutcome::Failed(JobError::processor("boom"));
        assert!(store.finish(&job.id, attempt, &failed).await.unwrap());

        // No second terminal write, no re-activation, no stalled override
        let completed = JobOutcome::Completed(json!({}));
        assert!(!store.finish(&job.id, attempt, &completed).await.unwrap());
        assert!(store.activate(&job.id).await.unwrap().is_none());
        assert!(!store.fail_stalled(&job.id, &JobError::stalled("x")).await.unwrap());

        let stored = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.error, Some(JobError::processor("boom")));
        assert!(stored.result.is_none());
    }

    #[tokio::test]
    async fn test_stale_attempt_is_rejected() {
        let store = MemoryJobStore::new();
        let job = job();
        store.insert(&job).await.unwrap();

        let first = store.activate(&job.id).await.unwrap().unwrap();
        let second = store.activate(&job.id).await.unwrap().unwrap();
        assert_eq!(second, first + 1);

        assert!(!store.set_progress(&job.id, first, 0.9).await.unwrap());
        let outcome = JobOutcome::Completed(json!({}));
        assert!(!store.finish(&job.id, first, &outcome).await.unwrap());
        assert!(store.finish(&job.id, second, &outcome).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_finished() {
        let store = MemoryJobStore::new();
        let done = job();
        let waiting = job();
        store.insert(&done).await.unwrap();
        store.insert(&waiting).await.unwrap();

        let attempt = store.activate(&done.id).await.unwrap().unwrap();
        store
            .finish(&done.id, attempt, &JobOutcome::Completed(json!({})))
            .await
            .unwrap();

        let removed = store
            .purge_finished(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, vec![done.id.clone()]);
        assert!(store.get(&done.id).await.unwrap().is_none());
        assert!(store.get(&waiting.id).await.unwrap().is_some());
    }
}
