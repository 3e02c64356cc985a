//! Queue backends.
//!
//! The backend is chosen once at startup by [`connect`]: Redis Streams when a
//! broker URL is configured, the in-process queue otherwise. Callers only see
//! [`QueueBackend`].

mod fallback;
mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::info;

use basejobs_models::{Job, JobId, JobLogLine};

use crate::config::{QueueConfig, QueueMode};
use crate::error::QueueResult;
use crate::events::{EventPredicate, EventSubscription};
use crate::processor::ProcessorRegistry;

pub use fallback::FallbackBackend;
pub use self::redis::RedisBackend;

#[async_trait]
pub trait QueueBackend: Send + Sync {
    fn mode(&self) -> QueueMode;

    /// Validate a payload, persist a waiting job and queue it for execution.
    ///
    /// Fails with `UnknownJobType`, `Validation`, `QueueFull` or
    /// `BackendUnavailable`; in every error case no job record exists.
    async fn enqueue(&self, job_type: &str, payload: Value) -> QueueResult<JobId>;

    /// Current record of a job, or `JobNotFound`.
    async fn get_status(&self, id: &JobId) -> QueueResult<Job>;

    /// Flushed log lines of a job, oldest first.
    async fn get_logs(&self, id: &JobId) -> QueueResult<Vec<JobLogLine>>;

    /// Receive every event matching `predicate` published from now on.
    async fn subscribe_events(&self, predicate: EventPredicate) -> QueueResult<EventSubscription>;

    /// Start consuming jobs. Processes that only serve the API never call this.
    async fn start(&self) -> QueueResult<()>;

    /// Stop taking new jobs and wait for in-flight ones to finish.
    async fn shutdown(&self);

    /// Check the backend is reachable.
    async fn ping(&self) -> QueueResult<()>;
}

pub type SharedQueue = Arc<dyn QueueBackend>;

/// Build the backend selected by `config`.
pub async fn connect(config: QueueConfig, registry: ProcessorRegistry) -> QueueResult<SharedQueue> {
    let backend: SharedQueue = match config.mode() {
        QueueMode::Distributed => Arc::new(RedisBackend::connect(config, registry).await?),
        QueueMode::Fallback => Arc::new(FallbackBackend::new(config, registry)),
    };

    info!(mode = %backend.mode(), "Job queue backend ready");
    Ok(backend)
}
