//! Job processors for bases.

mod duplicate;
mod export;
mod import;

use std::sync::Arc;

use serde_json::Value;

use basejobs_queue::{ProcessorRegistry, ValidationError};

use crate::bases::{is_valid_base_id, BaseRepository};
use crate::storage::ExportStorage;

pub use duplicate::DuplicateProcessor;
pub use export::{ExportDocument, ExportProcessor, EXPORT_VERSION};
pub use import::ImportProcessor;

/// Registry with every base processor, sharing one repository and storage.
pub fn build_registry(
    bases: Arc<dyn BaseRepository>,
    storage: Arc<dyn ExportStorage>,
) -> ProcessorRegistry {
    ProcessorRegistry::new()
        .register(Arc::new(ExportProcessor::new(Arc::clone(&bases), storage)))
        .register(Arc::new(ImportProcessor::new(Arc::clone(&bases))))
        .register(Arc::new(DuplicateProcessor::new(bases)))
}

fn require_base_id(payload: &Value) -> Result<&str, ValidationError> {
    let base_id = payload
        .get("baseId")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ValidationError::new("baseId is required"))?;

    if !is_valid_base_id(base_id) {
        return Err(ValidationError::new(format!("invalid baseId '{}'", base_id)));
    }
    Ok(base_id)
}

fn optional_field<'a>(payload: &'a Value, field: &str) -> Option<&'a Value> {
    payload.get(field).filter(|v| !v.is_null())
}

/// Fraction of work done after `done` of `total` steps, kept below 1.0.
fn step_progress(done: usize, total: usize) -> f64 {
    if total == 0 {
        return 0.9;
    }
    0.1 + 0.8 * (done as f64 / total as f64)
}
