//! Dispatch harness shared by both backends.
//!
//! [`JobCore`] owns the registry, record store, event bus and log sink. It
//! admits new jobs and runs claimed ones, turning every processor outcome
//! (result, error or panic) into exactly one terminal store write followed by
//! one terminal event.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use basejobs_models::{EventMessage, Job, JobError, JobId, JobLogLine, JobStatus, JobType};

use crate::error::{QueueError, QueueResult};
use crate::events::{EventBus, EventPredicate, EventSubscription};
use crate::logs::JobLogSink;
use crate::metrics;
use crate::processor::ProcessorRegistry;
use crate::progress::ProgressHandle;
use crate::store::{JobOutcome, JobStore};

/// How a claimed job's execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Execution {
    /// Terminal state written and published
    Completed,
    /// Terminal state written and published
    Failed,
    /// Job missing or already terminal, nothing to run
    Skipped,
    /// Ownership lost mid-run; another worker owns the job now
    Abandoned,
}

impl Execution {
    /// Whether the queue entry for this job can be removed.
    pub fn is_settled(&self) -> bool {
        !matches!(self, Execution::Abandoned)
    }
}

#[derive(Clone)]
pub struct JobCore {
    registry: Arc<ProcessorRegistry>,
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    logs: Arc<JobLogSink>,
}

impl JobCore {
    pub fn new(
        registry: ProcessorRegistry,
        store: Arc<dyn JobStore>,
        bus: Arc<dyn EventBus>,
        logs: Arc<JobLogSink>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            store,
            bus,
            logs,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn logs(&self) -> &Arc<JobLogSink> {
        &self.logs
    }

    /// Validate and persist a new waiting job. Nothing is persisted on error.
    pub async fn admit(&self, job_type: &str, payload: Value) -> QueueResult<Job> {
        let result = self.build(job_type, payload);
        let job = match result {
            Ok(job) => job,
            Err(e) => {
                metrics::record_job_rejected(e.code());
                return Err(e);
            }
        };

        self.store.insert(&job).await?;
        Ok(job)
    }

    fn build(&self, job_type: &str, payload: Value) -> QueueResult<Job> {
        let job_type: JobType = job_type.parse()?;
        let processor = self
            .registry
            .get(job_type)
            .ok_or_else(|| QueueError::unknown_job_type(job_type.as_str()))?;

        processor.validate(&payload)?;
        let owner = processor.owner_context(&payload)?;
        Ok(Job::new(job_type, payload, owner))
    }

    /// Publish the waiting event of a freshly queued job.
    pub async fn announce(&self, job: &Job) {
        metrics::record_job_enqueued(job.job_type.as_str());
        info!(job_id = %job.id, job_type = %job.job_type, room = %job.owner_context, "Enqueued job");
        self.publish(&EventMessage::status(job, JobStatus::Waiting)).await;
    }

    /// Drop an announced job that never reached the queue, closing its event
    /// sequence with a failure.
    pub async fn withdraw(&self, job: &Job, reason: &QueueError) {
        if let Err(e) = self.store.remove(&job.id).await {
            error!(job_id = %job.id, "Failed to remove unqueued job: {}", e);
        }
        metrics::record_job_rejected(reason.code());
        let error = JobError::processor(format!("job could not be queued: {}", reason));
        self.publish(&EventMessage::failed(job, error)).await;
    }

    pub async fn get_status(&self, id: &JobId) -> QueueResult<Job> {
        self.store
            .get(id)
            .await?
            .ok_or_else(|| QueueError::JobNotFound(id.to_string()))
    }

    pub async fn get_logs(&self, id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        // Unknown ids are an error, known jobs with no lines are not.
        self.get_status(id).await?;
        self.logs.lines(id).await
    }

    pub async fn subscribe(&self, predicate: EventPredicate) -> QueueResult<EventSubscription> {
        let stream = self.bus.subscribe().await?;
        Ok(EventSubscription::new(stream, predicate))
    }

    pub(crate) async fn publish(&self, event: &EventMessage) {
        if let Err(e) = self.bus.publish(event).await {
            warn!(job_id = %event.job_id, kind = event.kind(), "Failed to publish event: {}", e);
        }
    }

    /// Fail a job whose worker died too often. Used by the distributed backend.
    pub(crate) async fn fail_stalled(&self, id: &JobId, error: JobError) -> QueueResult<bool> {
        // Fences out the dead owner and moves never-started jobs through active.
        if self.store.activate(id).await?.is_none() {
            return Ok(false);
        }
        if !self.store.fail_stalled(id, &error).await? {
            return Ok(false);
        }

        self.logs.append(id, format!("Job failed: {}", error));
        if let Err(e) = self.logs.flush_job(id).await {
            warn!(job_id = %id, "Failed to flush job logs: {}", e);
        }

        if let Some(job) = self.store.get(id).await? {
            metrics::record_job_failed(job.job_type.as_str(), error.category.as_str());
            self.publish(&EventMessage::failed(&job, error)).await;
        }
        Ok(true)
    }

    /// Claim and run a job.
    ///
    /// `ownership_lost` resolves when the caller's claim on the job has been
    /// taken away; the processor future is then dropped and nothing more is
    /// written for this attempt.
    pub async fn execute<F>(&self, id: &JobId, ownership_lost: F) -> QueueResult<Execution>
    where
        F: Future<Output = ()>,
    {
        let Some(attempt) = self.store.activate(id).await? else {
            debug!(job_id = %id, "Job missing or terminal, skipping");
            return Ok(Execution::Skipped);
        };
        let Some(job) = self.store.get(id).await? else {
            return Ok(Execution::Skipped);
        };
        let job = Arc::new(job);
        let job_type = job.job_type.as_str();

        info!(job_id = %id, job_type, attempt, "Executing job");
        metrics::record_job_started(job_type);
        self.publish(&EventMessage::status(&job, JobStatus::Active)).await;
        self.logs.append(id, format!("Job started (attempt {})", attempt));

        let started = Instant::now();
        let outcome = match self.registry.get(job.job_type) {
            Some(processor) => {
                let handle = ProgressHandle::new(
                    Arc::clone(&job),
                    attempt,
                    Arc::clone(&self.store),
                    Arc::clone(&self.bus),
                    Arc::clone(&self.logs),
                );
                let run = AssertUnwindSafe(processor.run(job.payload.clone(), handle)).catch_unwind();

                tokio::pin!(ownership_lost);
                let result = tokio::select! {
                    biased;
                    _ = &mut ownership_lost => {
                        warn!(job_id = %id, attempt, "Lost ownership of job, abandoning execution");
                        metrics::record_job_finished();
                        return Ok(Execution::Abandoned);
                    }
                    result = run => result,
                };

                match result {
                    Ok(Ok(value)) => JobOutcome::Completed(value),
                    Ok(Err(e)) => JobOutcome::Failed(JobError::processor(e.message)),
                    Err(panic) => JobOutcome::Failed(JobError::processor(format!(
                        "Processor panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            }
            // A worker built with a different registry than the enqueuing process.
            None => JobOutcome::Failed(JobError::processor(format!(
                "No processor registered for job type '{}'",
                job_type
            ))),
        };
        metrics::record_job_finished();

        self.finish(&job, attempt, outcome, started).await
    }

    async fn finish(
        &self,
        job: &Job,
        attempt: u32,
        outcome: JobOutcome,
        started: Instant,
    ) -> QueueResult<Execution> {
        let id = &job.id;
        let job_type = job.job_type.as_str();

        match &outcome {
            JobOutcome::Completed(_) => self.logs.append(id, "Job completed"),
            JobOutcome::Failed(e) => self.logs.append(id, format!("Job failed: {}", e)),
        }
        if let Err(e) = self.logs.flush_job(id).await {
            warn!(job_id = %id, "Failed to flush job logs: {}", e);
        }

        if !self.store.finish(id, attempt, &outcome).await? {
            warn!(job_id = %id, attempt, "Job was taken over by another attempt, dropping outcome");
            return Ok(Execution::Abandoned);
        }

        let elapsed = started.elapsed().as_secs_f64();
        match outcome {
            JobOutcome::Completed(result) => {
                info!(job_id = %id, job_type, elapsed_secs = elapsed, "Job completed");
                metrics::record_job_completed(job_type, elapsed);
                self.publish(&EventMessage::completed(job, result)).await;
                Ok(Execution::Completed)
            }
            JobOutcome::Failed(err) => {
                error!(job_id = %id, job_type, category = err.category.as_str(), "Job failed: {}", err.message);
                metrics::record_job_failed(job_type, err.category.as_str());
                self.publish(&EventMessage::failed(job, err)).await;
                Ok(Execution::Failed)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
