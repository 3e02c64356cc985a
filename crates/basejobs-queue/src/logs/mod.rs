//! Job log sink.
//!
//! Lines are buffered in memory and written to the [`JobLogStore`] in
//! batches, either by the periodic flusher or when a job finishes.

mod memory;
mod redis;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use basejobs_models::{JobId, JobLogLine};

use crate::error::QueueResult;
use crate::shutdown::stopped;

pub use memory::MemoryLogStore;
pub use self::redis::RedisLogStore;

/// Durable storage for job log lines.
#[async_trait]
pub trait JobLogStore: Send + Sync {
    /// Append lines to a job's log, preserving their order.
    async fn append(&self, job_id: &JobId, lines: &[JobLogLine]) -> QueueResult<()>;

    /// All flushed lines of a job, oldest first.
    async fn read(&self, job_id: &JobId) -> QueueResult<Vec<JobLogLine>>;

    /// Delete the logs of removed jobs.
    async fn purge(&self, job_ids: &[JobId]) -> QueueResult<()>;
}

/// Buffered, append-only per-job log.
pub struct JobLogSink {
    store: Arc<dyn JobLogStore>,
    pending: Mutex<HashMap<JobId, Vec<JobLogLine>>>,
    flush_interval: Duration,
}

impl JobLogSink {
    pub fn new(store: Arc<dyn JobLogStore>, flush_interval: Duration) -> Self {
        Self {
            store,
            pending: Mutex::new(HashMap::new()),
            flush_interval,
        }
    }

    /// Buffer a line. Visible to readers after the next flush.
    pub fn append(&self, job_id: &JobId, message: impl Into<String>) {
        let line = JobLogLine::new(message);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.entry(job_id.clone()).or_default().push(line);
    }

    fn take(&self, job_id: Option<&JobId>) -> Vec<(JobId, Vec<JobLogLine>)> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        match job_id {
            Some(id) => pending
                .remove(id)
                .map(|lines| vec![(id.clone(), lines)])
                .unwrap_or_default(),
            None => pending.drain().collect(),
        }
    }

    /// Put back lines that failed to flush, ahead of anything appended since.
    fn restore(&self, job_id: JobId, mut lines: Vec<JobLogLine>) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let entry = pending.entry(job_id).or_default();
        lines.append(entry);
        *entry = lines;
    }

    async fn write(&self, batches: Vec<(JobId, Vec<JobLogLine>)>) -> QueueResult<usize> {
        let mut written = 0;
        let mut first_error = None;

        for (job_id, lines) in batches {
            match self.store.append(&job_id, &lines).await {
                Ok(()) => written += lines.len(),
                Err(e) => {
                    self.restore(job_id, lines);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(written),
        }
    }

    /// Flush every buffered line. Returns the number of lines written.
    pub async fn flush(&self) -> QueueResult<usize> {
        let batches = self.take(None);
        self.write(batches).await
    }

    /// Flush the buffered lines of one job.
    pub async fn flush_job(&self, job_id: &JobId) -> QueueResult<usize> {
        let batches = self.take(Some(job_id));
        self.write(batches).await
    }

    /// Flushed lines of a job.
    pub async fn lines(&self, job_id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        self.store.read(job_id).await
    }

    /// Delete the logs of removed jobs.
    pub async fn purge(&self, job_ids: &[JobId]) -> QueueResult<()> {
        self.store.purge(job_ids).await
    }

    /// Spawn the periodic flusher. It flushes one last time on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let sink = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sink.flush_interval);
            loop {
                tokio::select! {
                    _ = stopped(&mut shutdown) => break,
                    _ = interval.tick() => {
                        match sink.flush().await {
                            Ok(0) => {}
                            Ok(n) => debug!("Flushed {} job log lines", n),
                            Err(e) => warn!("Failed to flush job logs: {}", e),
                        }
                    }
                }
            }

            if let Err(e) = sink.flush().await {
                warn!("Failed final job log flush: {}", e);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test]
    async fn test_lines_visible_after_flush() {
        let store = Arc::new(MemoryLogStore::new());
        let sink = JobLogSink::new(store.clone(), Duration::from_secs(60));
        let job_id = JobId::new();

        sink.append(&job_id, "first");
        sink.append(&job_id, "second");
        assert!(sink.lines(&job_id).await.unwrap().is_empty());

        assert_eq!(sink.flush().await.unwrap(), 2);
        let lines = sink.lines(&job_id).await.unwrap();
        let messages: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_flush_job_leaves_other_jobs_buffered() {
        let store = Arc::new(MemoryLogStore::new());
        let sink = JobLogSink::new(store, Duration::from_secs(60));
        let a = JobId::new();
        let b = JobId::new();

        sink.append(&a, "a1");
        sink.append(&b, "b1");
        assert_eq!(sink.flush_job(&a).await.unwrap(), 1);

        assert_eq!(sink.lines(&a).await.unwrap().len(), 1);
        assert!(sink.lines(&b).await.unwrap().is_empty());
    }

    struct FlakyStore {
        fail: AtomicBool,
        inner: MemoryLogStore,
    }

    #[async_trait]
    impl JobLogStore for FlakyStore {
        async fn append(&self, job_id: &JobId, lines: &[JobLogLine]) -> QueueResult<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(QueueError::backend_unavailable("down"));
            }
            self.inner.append(job_id, lines).await
        }

        async fn read(&self, job_id: &JobId) -> QueueResult<Vec<JobLogLine>> {
            self.inner.read(job_id).await
        }

        async fn purge(&self, job_ids: &[JobId]) -> QueueResult<()> {
            self.inner.purge(job_ids).await
        }
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_lines_in_order() {
        let store = Arc::new(FlakyStore {
            fail: AtomicBool::new(true),
            inner: MemoryLogStore::new(),
        });
        let sink = JobLogSink::new(store.clone(), Duration::from_secs(60));
        let job_id = JobId::new();

        sink.append(&job_id, "one");
        assert!(sink.flush().await.is_err());
        sink.append(&job_id, "two");

        store.fail.store(false, Ordering::SeqCst);
        assert_eq!(sink.flush().await.unwrap(), 2);

        let messages: Vec<_> = sink
            .lines(&job_id)
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.message)
            .collect();
        assert_eq!(messages, vec!["one", "two"]);
    }
}
