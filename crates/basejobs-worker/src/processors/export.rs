use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use basejobs_models::{JobId, JobType};
use basejobs_queue::{JobProcessor, ProcessorError, ProgressHandle, ValidationError};

use super::{optional_field, require_base_id, step_progress};
use crate::bases::{BaseRepository, BaseSnapshot};
use crate::error::WorkerError;
use crate::storage::ExportStorage;

/// Current export document format.
pub const EXPORT_VERSION: u32 = 1;

/// Versioned export file contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    pub base: BaseSnapshot,
}

impl ExportDocument {
    pub fn new(base: BaseSnapshot) -> Self {
        Self {
            version: EXPORT_VERSION,
            exported_at: Utc::now(),
            base,
        }
    }
}

/// Serializes a base, or some of its tables, into an export document.
pub struct ExportProcessor {
    bases: Arc<dyn BaseRepository>,
    storage: Arc<dyn ExportStorage>,
}

impl ExportProcessor {
    pub fn new(bases: Arc<dyn BaseRepository>, storage: Arc<dyn ExportStorage>) -> Self {
        Self { bases, storage }
    }
}

fn table_filter(payload: &Value) -> Result<Option<Vec<String>>, ValidationError> {
    let Some(tables) = optional_field(payload, "tables") else {
        return Ok(None);
    };

    let names = tables
        .as_array()
        .ok_or_else(|| ValidationError::new("tables must be an array of table names"))?
        .iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| ValidationError::new("tables must be an array of table names"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(names))
}

/// Storage key of an export. Unique per job; a retried job overwrites its own file.
fn export_key(base_id: &str, job_id: &JobId, exported_at: &DateTime<Utc>) -> String {
    format!(
        "{}/{}-{}-{}.json",
        base_id,
        base_id,
        exported_at.format("%Y%m%dT%H%M%SZ"),
        job_id
    )
}

#[async_trait]
impl JobProcessor for ExportProcessor {
    fn job_type(&self) -> JobType {
        JobType::Export
    }

    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        require_base_id(payload)?;
        table_filter(payload)?;
        Ok(())
    }

    async fn run(&self, payload: Value, progress: ProgressHandle) -> Result<Value, ProcessorError> {
        let base_id = require_base_id(&payload).map_err(|e| ProcessorError::new(e.0))?;
        let filter = table_filter(&payload).map_err(|e| ProcessorError::new(e.0))?;

        progress.log(format!("Exporting base {}", base_id)).await;
        let source = self.bases.load(base_id).await?;

        let selected = match &filter {
            Some(names) => {
                if let Some(missing) = names.iter().find(|n| !source.tables.iter().any(|t| &t.name == *n)) {
                    return Err(ProcessorError::new(format!("Table '{}' not found in base {}", missing, base_id)));
                }
                source
                    .tables
                    .iter()
                    .filter(|t| names.contains(&t.name))
                    .cloned()
                    .collect()
            }
            None => source.tables.clone(),
        };
        progress.progress(0.1).await;

        let total = selected.len();
        let mut exported = BaseSnapshot::new(source.id.clone(), source.title.clone());
        for (i, table) in selected.into_iter().enumerate() {
            progress
                .log(format!("Exported table {} ({} rows)", table.name, table.rows.len()))
                .await;
            exported.tables.push(table);
            progress.progress(step_progress(i + 1, total)).await;
        }

        let tables = exported.tables.len();
        let rows = exported.row_count();
        let document = ExportDocument::new(exported);
        let bytes = serde_json::to_vec_pretty(&document).map_err(WorkerError::from)?;

        let key = export_key(base_id, progress.job_id(), &document.exported_at);
        let file_url = self.storage.put(&key, bytes).await?;

        info!(
            job_id = %progress.job_id(),
            attempt = progress.attempt(),
            base_id,
            tables,
            rows,
            "Export written to {}",
            file_url
        );
        progress.log(format!("Export file ready: {}", file_url)).await;

        Ok(json!({
            "fileUrl": file_url,
            "tables": tables,
            "rows": rows,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_key_is_unique_per_job() {
        let at = Utc::now();
        let a = export_key("b1", &JobId::new(), &at);
        let b = export_key("b1", &JobId::new(), &at);

        assert_ne!(a, b);
        assert!(a.starts_with("b1/b1-"));
        assert!(a.ends_with(".json"));
    }

    #[test]
    fn test_table_filter() {
        assert_eq!(table_filter(&json!({"baseId": "b1"})).unwrap(), None);
        assert_eq!(
            table_filter(&json!({"tables": ["Tasks"]})).unwrap(),
            Some(vec!["Tasks".to_string()])
        );
        assert!(table_filter(&json!({"tables": "Tasks"})).is_err());
        assert!(table_filter(&json!({"tables": [1]})).is_err());
    }
}
