use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use basejobs_models::{Job, JobId, JobLogLine};

use super::QueueBackend;
use crate::config::{QueueConfig, QueueMode};
use crate::dispatch::JobCore;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventPredicate, EventSubscription, LocalEventBus};
use crate::logs::{JobLogSink, MemoryLogStore};
use crate::metrics;
use crate::processor::ProcessorRegistry;
use crate::shutdown::stopped;
use crate::store::MemoryJobStore;

/// In-process backend: a bounded FIFO channel drained by a worker pool.
///
/// Nothing survives a restart. Events are delivered to subscribers in this
/// process only.
pub struct FallbackBackend {
    config: QueueConfig,
    core: JobCore,
    sender: mpsc::Sender<JobId>,
    receiver: Mutex<Option<mpsc::Receiver<JobId>>>,
    job_semaphore: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FallbackBackend {
    pub fn new(config: QueueConfig, registry: ProcessorRegistry) -> Self {
        let logs = Arc::new(JobLogSink::new(
            Arc::new(MemoryLogStore::new()),
            config.log_flush_interval,
        ));
        let core = JobCore::new(
            registry,
            Arc::new(MemoryJobStore::new()),
            Arc::new(LocalEventBus::new()),
            logs,
        );
        Self::with_core(config, core)
    }

    /// Build around an existing core, sharing its stores with the caller.
    pub fn with_core(config: QueueConfig, core: JobCore) -> Self {
        let (sender, receiver) = mpsc::channel(config.max_queue_len.max(1));
        let job_semaphore = Arc::new(Semaphore::new(config.concurrency.max(1)));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            core,
            sender,
            receiver: Mutex::new(Some(receiver)),
            job_semaphore,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn waiting(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    fn spawn_dispatcher(&self, mut receiver: mpsc::Receiver<JobId>) -> JoinHandle<()> {
        let core = self.core.clone();
        let semaphore = Arc::clone(&self.job_semaphore);
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = stopped(&mut shutdown_rx) => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let job_id = tokio::select! {
                    _ = stopped(&mut shutdown_rx) => break,
                    job_id = receiver.recv() => match job_id {
                        Some(job_id) => job_id,
                        None => break,
                    },
                };

                let core = core.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    // Nothing can take a job away from this process.
                    if let Err(e) = core.execute(&job_id, std::future::pending()).await {
                        error!(job_id = %job_id, "Failed to execute job: {}", e);
                    }
                });
            }
            debug!("In-process dispatcher stopped");
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let core = self.core.clone();
        let retention = self.config.retention;
        let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(300));
        let mut shutdown_rx = self.shutdown.subscribe();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = stopped(&mut shutdown_rx) => break,
                    _ = interval.tick() => {
                        let cutoff = match chrono::Duration::from_std(retention) {
                            Ok(retention) => Utc::now() - retention,
                            Err(_) => continue,
                        };
                        match core.store().purge_finished(cutoff).await {
                            Ok(ids) if !ids.is_empty() => {
                                debug!("Purged {} finished jobs", ids.len());
                                if let Err(e) = core.logs().purge(&ids).await {
                                    warn!("Failed to purge job logs: {}", e);
                                }
                            }
                            Ok(_) => {}
                            Err(e) => warn!("Failed to purge finished jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    async fn wait_for_jobs(&self) {
        let total = self.config.concurrency.max(1);
        while self.job_semaphore.available_permits() < total {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

#[async_trait]
impl QueueBackend for FallbackBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Fallback
    }

    async fn enqueue(&self, job_type: &str, payload: Value) -> QueueResult<JobId> {
        let job = self.core.admit(job_type, payload).await?;

        let permit = match self.sender.try_reserve() {
            Ok(permit) => permit,
            Err(e) => {
                self.core.store().remove(&job.id).await?;
                return Err(match e {
                    mpsc::error::TrySendError::Full(()) => {
                        warn!(job_type, "In-process queue full, rejecting job");
                        metrics::record_job_rejected("QueueFull");
                        QueueError::QueueFull(self.config.max_queue_len)
                    }
                    mpsc::error::TrySendError::Closed(()) => {
                        QueueError::backend_unavailable("in-process queue is shut down")
                    }
                });
            }
        };

        self.core.announce(&job).await;
        permit.send(job.id.clone());
        metrics::set_queue_length(self.waiting() as u64);

        Ok(job.id)
    }

    async fn get_status(&self, id: &JobId) -> QueueResult<Job> {
        self.core.get_status(id).await
    }

    async fn get_logs(&self, id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        self.core.get_logs(id).await
    }

    async fn subscribe_events(&self, predicate: EventPredicate) -> QueueResult<EventSubscription> {
        self.core.subscribe(predicate).await
    }

    async fn start(&self) -> QueueResult<()> {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(receiver) = receiver else {
            warn!("In-process workers already started");
            return Ok(());
        };

        info!(
            "Starting in-process job workers with {} max concurrent jobs",
            self.config.concurrency
        );

        let mut handles = vec![
            self.spawn_dispatcher(receiver),
            self.core.logs().spawn_flusher(self.shutdown.subscribe()),
        ];
        if !self.config.retention.is_zero() {
            handles.push(self.spawn_sweeper());
        }
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down in-process job workers");
        let _ = self.shutdown.send(true);

        if tokio::time::timeout(self.config.shutdown_timeout, self.wait_for_jobs())
            .await
            .is_err()
        {
            warn!("Timed out waiting for in-flight jobs");
        }

        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            let _ = task.await;
        }
        info!("In-process job workers stopped");
    }

    async fn ping(&self) -> QueueResult<()> {
        Ok(())
    }
}
