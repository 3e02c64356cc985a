use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use basejobs_models::{JobId, JobLogLine};

use super::JobLogStore;
use crate::error::QueueResult;

/// In-process log store used by the fallback backend.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    lines: RwLock<HashMap<JobId, Vec<JobLogLine>>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobLogStore for MemoryLogStore {
    async fn append(&self, job_id: &JobId, lines: &[JobLogLine]) -> QueueResult<()> {
        self.lines
            .write()
            .await
            .entry(job_id.clone())
            .or_default()
            .extend_from_slice(lines);
        Ok(())
    }

    async fn read(&self, job_id: &JobId) -> QueueResult<Vec<JobLogLine>> {
        Ok(self.lines.read().await.get(job_id).cloned().unwrap_or_default())
    }

    async fn purge(&self, job_ids: &[JobId]) -> QueueResult<()> {
        let mut lines = self.lines.write().await;
        for id in job_ids {
            lines.remove(id);
        }
        Ok(())
    }
}
