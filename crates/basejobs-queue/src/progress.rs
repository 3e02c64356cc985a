//! Progress-reporting handle given to processors.

use std::sync::Arc;

use tracing::{debug, warn};

use basejobs_models::{EventMessage, Job, JobId};

use crate::events::EventBus;
use crate::logs::JobLogSink;
use crate::store::JobStore;

/// Lets a processor report completion and log lines without knowing which
/// backend runs it. Reporting never fails the job: bus and store errors are
/// logged and swallowed.
#[derive(Clone)]
pub struct ProgressHandle {
    job: Arc<Job>,
    attempt: u32,
    store: Arc<dyn JobStore>,
    bus: Arc<dyn EventBus>,
    logs: Arc<JobLogSink>,
}

impl ProgressHandle {
    pub(crate) fn new(
        job: Arc<Job>,
        attempt: u32,
        store: Arc<dyn JobStore>,
        bus: Arc<dyn EventBus>,
        logs: Arc<JobLogSink>,
    ) -> Self {
        Self {
            job,
            attempt,
            store,
            bus,
            logs,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job.id
    }

    /// Attempt number of the execution this handle belongs to.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Report a completion fraction, clamped to 0.0 - 1.0.
    pub async fn progress(&self, fraction: f64) {
        let value = if fraction.is_finite() {
            fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };

        match self.store.set_progress(&self.job.id, self.attempt, value).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(job_id = %self.job.id, attempt = self.attempt, "Progress from superseded attempt ignored");
                return;
            }
            Err(e) => warn!(job_id = %self.job.id, "Failed to store progress: {}", e),
        }

        if let Err(e) = self.bus.publish(&EventMessage::progress(&self.job, value)).await {
            warn!(job_id = %self.job.id, "Failed to publish progress: {}", e);
        }
    }

    /// Append a line to the job log and publish it.
    pub async fn log(&self, message: impl Into<String>) {
        let message = message.into();
        debug!(job_id = %self.job.id, "{}", message);

        self.logs.append(&self.job.id, message.clone());
        if let Err(e) = self.bus.publish(&EventMessage::log(&self.job, message)).await {
            warn!(job_id = %self.job.id, "Failed to publish log line: {}", e);
        }
    }
}

impl std::fmt::Debug for ProgressHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHandle")
            .field("job_id", &self.job.id)
            .field("attempt", &self.attempt)
            .finish()
    }
}
