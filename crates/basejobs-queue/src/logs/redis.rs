use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tracing::warn;

use basejobs_models::{JobId, JobLogLine};

use super::JobLogStore;
use crate::error::QueueResult;

/// Log store backed by one Redis list of JSON lines per job.
pub struct RedisLogStore {
    client: redis::Client,
    key_prefix: String,
    retention: Duration,
}

impl RedisLogStore {
    pub fn new(client: redis::Client, key_prefix: impl Into<String>, retention: Duration) -> Self {
        Self {
            client,
            key_prefix: key_prefix.into(),
            retention,
        }
    }

    fn key(&self, job_id: &JobId) -> String {
        format!("{}:log:{}", self.key_prefix, job_id)
    }
}

/// RPUSH the lines and refresh the list TTL. A zero retention keeps the list.
fn append_pipeline(key: &str, encoded: Vec<String>, retention: Duration) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.rpush(key, encoded).ignore();
    if retention.as_secs() > 0 {
        pipe.expire(key, retention.as_secs() as i64).ignore();
    }
    pipe
}

#[async_trait]
impl JobLogStore for RedisLogStore {
    async fn append(&self, job_id: &JobId, lines: &[JobLogLine]) -> QueueResult<()> {
        if lines.is_empty() {
            return Ok(());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let key = self.key(job_id);
        let encoded = lines
            .iter()
            .map(serde_json::to_string)
            .collect::<Result<Vec<_>, _>>()?;

        append_pipeline(&key, encoded, self.retention)
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn read(&self, job_id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let raw: Vec<String> = conn.lrange(self.key(job_id), 0, -1).await?;

        Ok(raw
            .iter()
            .filter_map(|s| match serde_json::from_str(s) {
                Ok(line) => Some(line),
                Err(e) => {
                    warn!(job_id = %job_id, "Skipping malformed log line: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn purge(&self, job_ids: &[JobId]) -> QueueResult<()> {
        if job_ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let keys: Vec<String> = job_ids.iter().map(|id| self.key(id)).collect();
        conn.del::<_, ()>(keys).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packed(pipe: &redis::Pipeline) -> String {
        String::from_utf8_lossy(&pipe.get_packed_pipeline()).into_owned()
    }

    #[test]
    fn test_append_sets_ttl_only_with_retention() {
        let lines = vec![r#"{"message":"hi"}"#.to_string()];

        let with_ttl = packed(&append_pipeline("jobs:log:a", lines.clone(), Duration::from_secs(60)));
        assert!(with_ttl.contains("RPUSH"));
        assert!(with_ttl.contains("EXPIRE"));

        let keep = packed(&append_pipeline("jobs:log:a", lines, Duration::ZERO));
        assert!(keep.contains("RPUSH"));
        assert!(!keep.contains("EXPIRE"));
    }
}
