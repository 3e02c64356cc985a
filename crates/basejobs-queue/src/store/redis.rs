use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{AsyncCommands, Script};
use tracing::debug;

use basejobs_models::{Job, JobError, JobId, JobStatus};

use super::{JobOutcome, JobStore};
use crate::error::{QueueError, QueueResult};

/// Move a non-terminal job to active and bump its attempt counter.
static ACTIVATE: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
local status = redis.call('HGET', KEYS[1], 'status')
if not status or status == 'completed' or status == 'failed' then
  return -1
end
local attempt = redis.call('HINCRBY', KEYS[1], 'attempts', 1)
redis.call('HSET', KEYS[1], 'status', 'active', 'startedAt', ARGV[1])
return attempt
",
    )
});

static SET_PROGRESS: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'status') ~= 'active' then return 0 end
if redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'progress', ARGV[2])
return 1
",
    )
});

static FINISH: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'status') ~= 'active' then return 0 end
if redis.call('HGET', KEYS[1], 'attempts') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], ARGV[3], ARGV[4], 'finishedAt', ARGV[5])
if ARGV[2] == 'completed' then
  redis.call('HSET', KEYS[1], 'progress', '1')
end
local ttl = tonumber(ARGV[6])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
",
    )
});

static FAIL_STALLED: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('HGET', KEYS[1], 'status') ~= 'active' then return 0 end
redis.call('HSET', KEYS[1], 'status', 'failed', 'error', ARGV[1], 'finishedAt', ARGV[2])
local ttl = tonumber(ARGV[3])
if ttl > 0 then
  redis.call('EXPIRE', KEYS[1], ttl)
end
return 1
",
    )
});

/// Job store backed by one Redis hash per job.
///
/// The immutable part of the job is kept as JSON in the `record` field; the
/// lifecycle fields are separate hash fields so the Lua scripts above can
/// check ownership and update them atomically.
pub struct RedisJobStore {
    client: redis::Client,
    key_prefix: String,
    retention: Duration,
}

impl RedisJobStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            retention,
        }
    }

    fn key(&self, id: &JobId) -> String {
        format!("{}:job:{}", self.key_prefix, id)
    }

    async fn conn(&self) -> QueueResult<redis::aio::MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

fn parse_job(id: &JobId, mut fields: HashMap<String, String>) -> QueueResult<Job> {
    let record = fields
        .remove("record")
        .ok_or_else(|| QueueError::corrupt(format!("job {} has no record", id)))?;
    let mut job: Job = serde_json::from_str(&record)?;

    if let Some(status) = fields.get("status") {
        job.status = status.parse::<JobStatus>().map_err(QueueError::corrupt)?;
    }
    job.attempts = fields
        .get("attempts")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    job.progress = fields
        .get("progress")
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0);
    job.started_at = fields.get("startedAt").and_then(|s| parse_time(s));
    job.finished_at = fields.get("finishedAt").and_then(|s| parse_time(s));
    job.result = fields
        .get("result")
        .map(|s| serde_json::from_str(s))
        .transpose()?;
    job.error = fields
        .get("error")
        .map(|s| serde_json::from_str(s))
        .transpose()?;

    Ok(job)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn insert(&self, job: &Job) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        let record = serde_json::to_string(job)?;

        conn.hset_multiple::<_, _, _, ()>(
            self.key(&job.id),
            &[
                ("record", record.as_str()),
                ("status", job.status.as_str()),
                ("attempts", "0"),
                ("progress", "0"),
            ],
        )
        .await?;

        Ok(())
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let mut conn = self.conn().await?;
        let fields: HashMap<String, String> = conn.hgetall(self.key(id)).await?;

        if fields.is_empty() {
            return Ok(None);
        }
        parse_job(id, fields).map(Some)
    }

    async fn remove(&self, id: &JobId) -> QueueResult<()> {
        let mut conn = self.conn().await?;
        conn.del::<_, ()>(self.key(id)).await?;
        Ok(())
    }

    async fn activate(&self, id: &JobId) -> QueueResult<Option<u32>> {
        let mut conn = self.conn().await?;
        let attempt: i64 = ACTIVATE
            .key(self.key(id))
            .arg(Utc::now().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        if attempt < 0 {
            debug!(job_id = %id, "Job missing or terminal, not activated");
            return Ok(None);
        }
        Ok(Some(attempt as u32))
    }

    async fn set_progress(&self, id: &JobId, attempt: u32, progress: f64) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = SET_PROGRESS
            .key(self.key(id))
            .arg(attempt)
            .arg(progress)
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn finish(&self, id: &JobId, attempt: u32, outcome: &JobOutcome) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let (field, value) = match outcome {
            JobOutcome::Completed(result) => ("result", serde_json::to_string(result)?),
            JobOutcome::Failed(error) => ("error", serde_json::to_string(error)?),
        };

        let updated: i64 = FINISH
            .key(self.key(id))
            .arg(attempt)
            .arg(outcome.status().as_str())
            .arg(field)
            .arg(value)
            .arg(Utc::now().to_rfc3339())
            .arg(self.retention.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn fail_stalled(&self, id: &JobId, error: &JobError) -> QueueResult<bool> {
        let mut conn = self.conn().await?;
        let updated: i64 = FAIL_STALLED
            .key(self.key(id))
            .arg(serde_json::to_string(error)?)
            .arg(Utc::now().to_rfc3339())
            .arg(self.retention.as_secs())
            .invoke_async(&mut conn)
            .await?;
        Ok(updated == 1)
    }

    async fn purge_finished(&self, _cutoff: DateTime<Utc>) -> QueueResult<Vec<JobId>> {
        // Terminal hashes carry a TTL set by FINISH / FAIL_STALLED.
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basejobs_models::{JobType, Room};
    use serde_json::json;

    #[test]
    fn test_parse_job_overrides_lifecycle_fields() {
        let job = Job::new(JobType::Export, json!({"baseId": "b1"}), Room::new("b1"));
        let mut fields = HashMap::new();
        fields.insert("record".to_string(), serde_json::to_string(&job).unwrap());
        fields.insert("status".to_string(), "completed".to_string());
        fields.insert("attempts".to_string(), "2".to_string());
        fields.insert("progress".to_string(), "1".to_string());
        fields.insert("finishedAt".to_string(), Utc::now().to_rfc3339());
        fields.insert("result".to_string(), r#"{"fileUrl":"x"}"#.to_string());

        let parsed = parse_job(&job.id, fields).unwrap();
        assert_eq!(parsed.status, JobStatus::Completed);
        assert_eq!(parsed.attempts, 2);
        assert_eq!(parsed.progress, 1.0);
        assert_eq!(parsed.result, Some(json!({"fileUrl": "x"})));
        assert!(parsed.error.is_none());
        assert!(parsed.finished_at.is_some());
    }

    #[test]
    fn test_parse_job_without_record_is_corrupt() {
        let fields = HashMap::from([("status".to_string(), "active".to_string())]);
        let err = parse_job(&JobId::new(), fields).unwrap_err();
        assert!(matches!(err, QueueError::Corrupt(_)));
    }
}
