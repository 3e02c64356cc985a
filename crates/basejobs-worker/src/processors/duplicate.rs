use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use basejobs_models::JobType;
use basejobs_queue::{JobProcessor, ProcessorError, ProgressHandle, ValidationError};

use super::{optional_field, require_base_id, step_progress};
use crate::bases::{BaseRepository, BaseSnapshot};

/// Copies a base under a new id, optionally without its rows.
pub struct DuplicateProcessor {
    bases: Arc<dyn BaseRepository>,
}

impl DuplicateProcessor {
    pub fn new(bases: Arc<dyn BaseRepository>) -> Self {
        Self { bases }
    }
}

struct DuplicateOptions {
    exclude_data: bool,
    title: Option<String>,
}

fn options(payload: &Value) -> Result<DuplicateOptions, ValidationError> {
    let exclude_data = match optional_field(payload, "excludeData") {
        Some(v) => v
            .as_bool()
            .ok_or_else(|| ValidationError::new("excludeData must be a boolean"))?,
        None => false,
    };
    let title = match optional_field(payload, "title") {
        Some(v) => Some(
            v.as_str()
                .filter(|s| !s.trim().is_empty())
                .ok_or_else(|| ValidationError::new("title must be a non-empty string"))?
                .to_string(),
        ),
        None => None,
    };

    Ok(DuplicateOptions { exclude_data, title })
}

#[async_trait]
impl JobProcessor for DuplicateProcessor {
    fn job_type(&self) -> JobType {
        JobType::Duplicate
    }

    fn validate(&self, payload: &Value) -> Result<(), ValidationError> {
        require_base_id(payload)?;
        options(payload)?;
        Ok(())
    }

    async fn run(&self, payload: Value, progress: ProgressHandle) -> Result<Value, ProcessorError> {
        let source_id = require_base_id(&payload).map_err(|e| ProcessorError::new(e.0))?;
        let options = options(&payload).map_err(|e| ProcessorError::new(e.0))?;

        let source = self.bases.load(source_id).await?;
        progress.progress(0.1).await;

        let new_id = format!("b{}", Uuid::new_v4().simple());
        let title = options
            .title
            .unwrap_or_else(|| format!("{} copy", source.title));
        progress
            .log(format!("Duplicating base {} into {}", source_id, new_id))
            .await;

        let total = source.tables.len();
        let mut copy = BaseSnapshot::new(new_id.clone(), title);
        for (i, table) in source.tables.iter().enumerate() {
            let table = if options.exclude_data {
                table.schema_only()
            } else {
                table.clone()
            };
            progress.log(format!("Copied table {}", table.name)).await;
            copy.tables.push(table);
            progress.progress(step_progress(i + 1, total)).await;
        }

        self.bases.save(&copy).await?;
        info!(job_id = %progress.job_id(), source_base_id = source_id, base_id = %new_id, "Base duplicated");

        Ok(json!({
            "baseId": new_id,
            "sourceBaseId": source_id,
        }))
    }
}
