use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::streams::{StreamClaimReply, StreamPendingCountReply, StreamRangeReply, StreamReadReply};
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use basejobs_models::{Job, JobError, JobId, JobLogLine};

use super::QueueBackend;
use crate::config::{QueueConfig, QueueMode};
use crate::dispatch::JobCore;
use crate::error::{QueueError, QueueResult};
use crate::events::{EventPredicate, EventSubscription, RedisEventBus};
use crate::logs::{JobLogSink, RedisLogStore};
use crate::metrics;
use crate::processor::ProcessorRegistry;
use crate::retry::{retry_async, FailureTracker, RetryConfig};
use crate::shutdown::stopped;
use crate::store::RedisJobStore;

/// Max entries read or claimed per round.
const BATCH_SIZE: usize = 5;

/// How long a stream read blocks waiting for new entries.
const READ_BLOCK_MS: u64 = 1000;

static REFRESH_LEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
",
    )
});

static RELEASE_LEASE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
",
    )
});

/// Whether the `stalls`-th stall of a job uses up a budget of `max` requeues.
fn stall_budget_exceeded(stalls: u32, max: u32) -> bool {
    stalls > max
}

/// A worker's claim on one job.
struct Lease {
    key: String,
    token: String,
}

/// Distributed backend over Redis Streams.
///
/// Jobs are stream entries read through a consumer group. A worker holding an
/// entry also holds a per-job lease key that it refreshes while the job runs;
/// entries whose lease has expired belong to a dead worker and are claimed
/// by the stall scanner of any other worker.
pub struct RedisBackend {
    worker: StreamWorker,
    shutdown: watch::Sender<bool>,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
struct StreamWorker {
    config: Arc<QueueConfig>,
    client: redis::Client,
    core: JobCore,
    stream: String,
    group: String,
    consumer_name: String,
    job_semaphore: Arc<Semaphore>,
}

impl RedisBackend {
    /// Connect to Redis and make sure the stream and consumer group exist.
    pub async fn connect(config: QueueConfig, registry: ProcessorRegistry) -> QueueResult<Self> {
        let url = config
            .redis_url
            .clone()
            .ok_or_else(|| QueueError::InvalidConfig("redis URL is not set".to_string()))?;
        let client = redis::Client::open(url.as_str())?;

        let store = Arc::new(RedisJobStore::new(
            client.clone(),
            config.key_prefix.clone(),
            config.retention,
        ));
        let logs = Arc::new(JobLogSink::new(
            Arc::new(RedisLogStore::new(
                client.clone(),
                config.key_prefix.clone(),
                config.retention,
            )),
            config.log_flush_interval,
        ));
        let bus = Arc::new(RedisEventBus::new(client.clone(), config.key("events")));
        let core = JobCore::new(registry, store, bus, logs);

        let backend = Self::with_core(config, client, core);
        backend.worker.init().await?;
        Ok(backend)
    }

    pub fn with_core(config: QueueConfig, client: redis::Client, core: JobCore) -> Self {
        let (shutdown, _) = watch::channel(false);
        let worker = StreamWorker {
            stream: config.key("jobs"),
            group: config.key("workers"),
            consumer_name: format!("worker-{}", Uuid::new_v4()),
            job_semaphore: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config: Arc::new(config),
            client,
            core,
        };

        Self {
            worker,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        }
    }

    async fn wait_for_jobs(&self) {
        let total = self.worker.config.concurrency.max(1);
        while self.worker.job_semaphore.available_permits() < total {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl StreamWorker {
    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }

    /// Create the consumer group (and stream) if missing.
    async fn init(&self) -> QueueResult<()> {
        let mut conn = self.conn().await?;

        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group: {}", self.group),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists: {}", self.group);
            }
            Err(e) => return Err(e.into()),
        }

        Ok(())
    }

    fn lease_key(&self, job_id: &JobId) -> String {
        self.config.key(&format!("lease:{}", job_id))
    }

    fn stalls_key(&self, job_id: &JobId) -> String {
        self.config.key(&format!("stalls:{}", job_id))
    }

    async fn push(&self, job: &Job) -> QueueResult<String> {
        let mut conn = self.conn().await?;

        let message_id: String = redis::cmd("XADD")
            .arg(&self.stream)
            .arg("*")
            .arg("job_id")
            .arg(job.id.as_str())
            .arg("type")
            .arg(job.job_type.as_str())
            .query_async(&mut conn)
            .await?;

        Ok(message_id)
    }

    /// Acknowledge and delete a settled stream entry.
    async fn ack(&self, message_id: &str) -> QueueResult<()> {
        let config = RetryConfig::new("stream ack");
        let worker = self;

        retry_async(&config, || async move {
            let mut conn = worker.conn().await?;
            redis::pipe()
                .atomic()
                .cmd("XACK")
                .arg(&worker.stream)
                .arg(&worker.group)
                .arg(message_id)
                .ignore()
                .cmd("XDEL")
                .arg(&worker.stream)
                .arg(message_id)
                .ignore()
                .query_async::<()>(&mut conn)
                .await?;
            Ok::<(), QueueError>(())
        })
        .await?;

        debug!("Acknowledged stream entry: {}", message_id);
        Ok(())
    }

    async fn acquire_lease(&self, job_id: &JobId) -> QueueResult<Option<Lease>> {
        let mut conn = self.conn().await?;
        let lease = Lease {
            key: self.lease_key(job_id),
            token: format!("{}:{}", self.consumer_name, Uuid::new_v4()),
        };

        let acquired: Option<String> = redis::cmd("SET")
            .arg(&lease.key)
            .arg(&lease.token)
            .arg("NX")
            .arg("PX")
            .arg(self.config.lease_ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await?;

        Ok(acquired.map(|_| lease))
    }

    async fn release_lease(&self, lease: &Lease) {
        let result: QueueResult<i64> = async {
            let mut conn = self.conn().await?;
            Ok(RELEASE_LEASE
                .key(&lease.key)
                .arg(&lease.token)
                .invoke_async(&mut conn)
                .await?)
        }
        .await;

        if let Err(e) = result {
            warn!("Failed to release lease {}: {}", lease.key, e);
        }
    }

    /// Refresh the lease until it is lost. Resolves only when another worker
    /// may have taken the job over.
    async fn hold_lease(&self, lease: &Lease) {
        let ttl = self.config.lease_ttl;
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;
        let mut last_refresh = Instant::now();
        let mut conn = None;

        loop {
            interval.tick().await;

            let refreshed: QueueResult<i64> = async {
                if conn.is_none() {
                    conn = Some(self.conn().await?);
                }
                let Some(c) = conn.as_mut() else {
                    return Ok(0);
                };
                Ok(REFRESH_LEASE
                    .key(&lease.key)
                    .arg(&lease.token)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(c)
                    .await?)
            }
            .await;

            match refreshed {
                Ok(1) => last_refresh = Instant::now(),
                Ok(_) => {
                    warn!("Lease {} was taken over", lease.key);
                    return;
                }
                Err(e) => {
                    conn = None;
                    warn!("Failed to refresh lease {}: {}", lease.key, e);
                    if last_refresh.elapsed() >= ttl {
                        warn!("Lease {} expired while Redis was unreachable", lease.key);
                        return;
                    }
                }
            }
        }
    }

    /// Run a leased job and settle its stream entry.
    async fn run_leased(&self, message_id: String, job_id: JobId, lease: Lease) {
        let execution = self.core.execute(&job_id, self.hold_lease(&lease)).await;

        match execution {
            Ok(execution) if execution.is_settled() => {
                if let Err(e) = self.ack(&message_id).await {
                    error!(job_id = %job_id, "Failed to ack stream entry {}: {}", message_id, e);
                }
                self.clear_stalls(&job_id).await;
                self.release_lease(&lease).await;
            }
            Ok(_) => {
                info!(job_id = %job_id, "Leaving stream entry {} for the new owner", message_id);
            }
            Err(e) => {
                // Left pending; the stall scanner picks it up once the lease is gone.
                error!(job_id = %job_id, "Failed to execute job: {}", e);
                self.release_lease(&lease).await;
            }
        }
    }

    async fn clear_stalls(&self, job_id: &JobId) {
        let result: QueueResult<()> = async {
            let mut conn = self.conn().await?;
            conn.del::<_, ()>(self.stalls_key(job_id)).await?;
            Ok(())
        }
        .await;

        if let Err(e) = result {
            warn!(job_id = %job_id, "Failed to clear stall counter: {}", e);
        }
    }

    fn spawn_job(&self, permit: OwnedSemaphorePermit, message_id: String, job_id: JobId, lease: Lease) {
        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            worker.run_leased(message_id, job_id, lease).await;
        });
    }

    /// Read new entries for this consumer and dispatch them.
    async fn consume(&self) -> QueueResult<()> {
        let available = self.job_semaphore.available_permits();
        if available == 0 {
            // All slots busy, wait a bit
            tokio::time::sleep(Duration::from_millis(100)).await;
            return Ok(());
        }

        let mut conn = self.conn().await?;
        let reply: StreamReadReply = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg("COUNT")
            .arg(available.min(BATCH_SIZE))
            .arg("BLOCK")
            .arg(READ_BLOCK_MS)
            .arg("STREAMS")
            .arg(&self.stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;

        for entry in reply.keys.into_iter().flat_map(|key| key.ids) {
            let message_id = entry.id.clone();
            let Some(job_id) = entry.get::<String>("job_id").map(JobId::from_string) else {
                warn!("Dropping stream entry {} without job_id", message_id);
                self.ack(&message_id).await.ok();
                continue;
            };

            let permit = Arc::clone(&self.job_semaphore)
                .acquire_owned()
                .await
                .map_err(|_| QueueError::backend_unavailable("worker pool closed"))?;

            match self.acquire_lease(&job_id).await? {
                Some(lease) => {
                    debug!(job_id = %job_id, "Consumed job from stream");
                    self.spawn_job(permit, message_id, job_id, lease);
                }
                // Leased elsewhere; the holder settles the entry.
                None => debug!(job_id = %job_id, "Job already leased, skipping"),
            }
        }

        Ok(())
    }

    async fn consume_loop(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting stream consumer '{}' with {} max concurrent jobs",
            self.consumer_name, self.config.concurrency
        );
        let mut failures = FailureTracker::new(3);
        let backoff = RetryConfig::new("stream read")
            .with_base_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                result = self.consume() => match result {
                    Ok(()) => failures.record_success(),
                    Err(e) => {
                        if failures.record_failure() {
                            error!("Error consuming jobs: {}", e);
                        }
                        tokio::time::sleep(backoff.delay_for_attempt(failures.failure_count())).await;
                    }
                },
            }
        }
        info!("Stream consumer '{}' stopped", self.consumer_name);
    }

    /// Take over entries whose worker stopped refreshing its lease.
    async fn claim_stalled(&self) -> QueueResult<usize> {
        let mut conn = self.conn().await?;
        let min_idle_ms = self.config.lease_ttl.as_millis() as u64;

        let queued: u64 = conn.xlen(&self.stream).await?;
        metrics::set_queue_length(queued);

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(BATCH_SIZE * 2)
            .query_async(&mut conn)
            .await?;

        let mut claimed = 0;
        for pending in pending.ids {
            let Ok(permit) = Arc::clone(&self.job_semaphore).try_acquire_owned() else {
                break;
            };

            let range: StreamRangeReply = conn
                .xrange(&self.stream, &pending.id, &pending.id)
                .await?;
            let Some(job_id) = range
                .ids
                .first()
                .and_then(|entry| entry.get::<String>("job_id"))
                .map(JobId::from_string)
            else {
                continue;
            };

            // A live owner keeps its lease; only dead workers' jobs are free.
            let Some(lease) = self.acquire_lease(&job_id).await? else {
                continue;
            };

            let reply: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(&self.stream)
                .arg(&self.group)
                .arg(&self.consumer_name)
                .arg(min_idle_ms)
                .arg(&pending.id)
                .query_async(&mut conn)
                .await?;
            if reply.ids.is_empty() {
                // Settled or claimed by someone else in the meantime
                self.release_lease(&lease).await;
                continue;
            }

            claimed += 1;
            self.requeue_stalled(permit, pending.id, job_id, lease).await?;
        }

        Ok(claimed)
    }

    async fn requeue_stalled(
        &self,
        permit: OwnedSemaphorePermit,
        message_id: String,
        job_id: JobId,
        lease: Lease,
    ) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let stalls_key = self.stalls_key(&job_id);
        let mut pipe = redis::pipe();
        pipe.atomic().incr(&stalls_key, 1);
        if self.config.retention.as_secs() > 0 {
            pipe.expire(&stalls_key, self.config.retention.as_secs() as i64)
                .ignore();
        }
        let (stalls,): (u32,) = pipe.query_async(&mut conn).await?;
        metrics::record_job_stalled();

        let max = self.config.max_stalled_retries;
        if !stall_budget_exceeded(stalls, max) {
            warn!(job_id = %job_id, "Requeuing stalled job (stall {}/{})", stalls, max);
            self.spawn_job(permit, message_id, job_id, lease);
            return Ok(());
        }

        warn!(job_id = %job_id, "Job stalled {} times, failing it", stalls);
        let error = JobError::stalled(format!(
            "job stalled {} times, more than the allowed {}",
            stalls, max
        ));
        self.core.fail_stalled(&job_id, error).await?;
        self.ack(&message_id).await?;
        self.clear_stalls(&job_id).await;
        self.release_lease(&lease).await;
        Ok(())
    }

    async fn claim_loop(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.claim_interval);
        let mut failures = FailureTracker::new(3);

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                _ = interval.tick() => {
                    match self.claim_stalled().await {
                        Ok(claimed) => {
                            failures.record_success();
                            if claimed > 0 {
                                info!("Claimed {} stalled jobs", claimed);
                            }
                        }
                        Err(e) => {
                            if failures.record_failure() {
                                warn!("Failed to claim stalled jobs: {}", e);
                            }
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl QueueBackend for RedisBackend {
    fn mode(&self) -> QueueMode {
        QueueMode::Distributed
    }

    async fn enqueue(&self, job_type: &str, payload: Value) -> QueueResult<JobId> {
        let core = &self.worker.core;
        let job = core.admit(job_type, payload).await?;

        // Announced first so a worker's events always follow "waiting".
        core.announce(&job).await;
        match self.worker.push(&job).await {
            Ok(message_id) => debug!(job_id = %job.id, "Added job to stream as {}", message_id),
            Err(e) => {
                core.withdraw(&job, &e).await;
                return Err(e);
            }
        }
        Ok(job.id)
    }

    async fn get_status(&self, id: &JobId) -> QueueResult<Job> {
        self.worker.core.get_status(id).await
    }

    async fn get_logs(&self, id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        self.worker.core.get_logs(id).await
    }

    async fn subscribe_events(&self, predicate: EventPredicate) -> QueueResult<EventSubscription> {
        self.worker.core.subscribe(predicate).await
    }

    async fn start(&self) -> QueueResult<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Stream workers already started");
            return Ok(());
        }

        let handles = vec![
            tokio::spawn(self.worker.clone().consume_loop(self.shutdown.subscribe())),
            tokio::spawn(self.worker.clone().claim_loop(self.shutdown.subscribe())),
            self.worker.core.logs().spawn_flusher(self.shutdown.subscribe()),
        ];
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(handles);
        Ok(())
    }

    async fn shutdown(&self) {
        info!("Shutting down stream workers");
        let _ = self.shutdown.send(true);

        if tokio::time::timeout(self.worker.config.shutdown_timeout, self.wait_for_jobs())
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
        info!("Stream workers stopped");
    }

    async fn ping(&self) -> QueueResult<()> {
        let mut conn = self.worker.conn().await?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker(config: QueueConfig) -> StreamWorker {
        let client = redis::Client::open("redis://127.0.0.1:6379").unwrap();
        let registry = ProcessorRegistry::new();
        let core = JobCore::new(
            registry,
            Arc::new(crate::store::MemoryJobStore::new()),
            Arc::new(crate::events::LocalEventBus::new()),
            Arc::new(JobLogSink::new(
                Arc::new(crate::logs::MemoryLogStore::new()),
                Duration::from_secs(1),
            )),
        );
        RedisBackend::with_core(config, client, core).worker
    }

    #[test]
    fn test_stall_budget() {
        assert!(!stall_budget_exceeded(1, 1));
        assert!(stall_budget_exceeded(2, 1));
        assert!(stall_budget_exceeded(1, 0));
        assert!(!stall_budget_exceeded(3, 3));
    }

    #[test]
    fn test_keys_share_the_prefix() {
        let worker = worker(QueueConfig {
            key_prefix: "jobs-test".to_string(),
            ..QueueConfig::default()
        });
        let id = JobId::from_string("abc");

        assert_eq!(worker.stream, "jobs-test:jobs");
        assert_eq!(worker.group, "jobs-test:workers");
        assert_eq!(worker.lease_key(&id), "jobs-test:lease:abc");
        assert_eq!(worker.stalls_key(&id), "jobs-test:stalls:abc");
        assert!(worker.consumer_name.starts_with("worker-"));
    }
}
