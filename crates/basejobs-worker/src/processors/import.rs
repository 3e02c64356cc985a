use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

use basejobs_models::JobType;
use basejobs_queue::{JobProcessor, ProcessorError, ProgressHandle, ValidationError};

use super::{require_base_id, step_progress, ExportDocument, EXPORT_VERSION};
use crate::bases::{BaseRepository, BaseSnapshot};
use crate::error::{WorkerError, WorkerResult};

/// Merges an inline export document into a base, creating it if needed.
pub struct ImportProcessor {
    bases: Arc<dyn BaseRepository>,
}

impl ImportProcessor {
    pub fn new(bases: Arc<dyn BaseRepository>) -> Self {
        Self { bases }
    }
}

fn require_file(payload: &Value) -> Result<&str, ValidationError> {
    payload
        .get("file")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ValidationError::new("file is required"))
}

/// Parse an export document, checking its version before its shape.
pub(crate) fn parse_document(file: &str) -> WorkerResult<ExportDocument> {
    let raw: Value = serde_json::from_str(file).map_err(|e| WorkerError::malformed(e.to_string()))?;

    let version = raw
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| WorkerError::malformed("missing version"))?;
    if version != u64::from(EXPORT_VERSION) {
        return Err(WorkerError::UnsupportedVersion(version.min(u64::from(u32::MAX)) as u32));
    }

    serde_json::from_value(raw).map_err(|e| WorkerError::malformed(e.to_string()))
}

#[async_trait]
impl JobProcessor for ImportProcessor {
    fn job_type(&self) -> JobType {
        JobType::Import
    }

    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        require_base_id(payload)?;
        require_file(payload)?;
        Ok(())
    }

    async fn run(&self, payload: Value, progress: ProgressHandle) -> Result<Value, ProcessorError> {
        let base_id = require_base_id(&payload).map_err(|e| ProcessorError::new(e.0))?;
        let file = require_file(&payload).map_err(|e| ProcessorError::new(e.0))?;

        progress.log(format!("Importing into base {}", base_id)).await;
        let document = parse_document(file)?;
        progress.progress(0.1).await;

        let mut target = match self.bases.load_optional(base_id).await? {
            Some(base) => base,
            None => {
                progress.log(format!("Creating base {}", base_id)).await;
                BaseSnapshot::new(base_id, document.base.title.clone())
            }
        };

        let total = document.base.tables.len();
        let mut rows = 0;
        for (i, table) in document.base.tables.into_iter().enumerate() {
            rows += table.rows.len();
            progress
                .log(format!("Imported table {} ({} rows)", table.name, table.rows.len()))
                .await;
            target.merge_table(table);
            progress.progress(step_progress(i + 1, total)).await;
        }

        self.bases.save(&target).await?;
        info!(job_id = %progress.job_id(), base_id, tables = total, rows, "Import finished");

        Ok(json!({
            "baseId": base_id,
            "tables": total,
            "rows": rows,
        }))
    }
}
