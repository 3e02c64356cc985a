//! Base snapshots and the file-backed base repository.

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{WorkerError, WorkerResult};

/// Column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    /// UI data type, e.g. `SingleLineText`, `Number`
    pub uidt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableData {
    pub name: String,
    #[serde(default)]
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub rows: Vec<Map<String, Value>>,
}

impl TableData {
    /// Same table with no rows.
    pub fn schema_only(&self) -> Self {
        Self {
            name: self.name.clone(),
            columns: self.columns.clone(),
            rows: Vec::new(),
        }
    }
}

/// Full contents of a base.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseSnapshot {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub tables: Vec<TableData>,
}

impl BaseSnapshot {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            tables: Vec::new(),
        }
    }

    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }

    /// Add a table, or append the rows of a same-named one and keep its columns
    /// plus any new ones.
    pub fn merge_table(&mut self, table: TableData) {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => {
                for column in table.columns {
                    if !existing.columns.iter().any(|c| c.name == column.name) {
                        existing.columns.push(column);
                    }
                }
                existing.rows.extend(table.rows);
            }
            None => self.tables.push(table),
        }
    }
}

/// Base ids are used as file names.
pub fn is_valid_base_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Storage of base snapshots.
#[async_trait]
pub trait BaseRepository: Send + Sync {
    async fn load(&self, base_id: &str) -> WorkerResult<BaseSnapshot>;

    async fn load_optional(&self, base_id: &str) -> WorkerResult<Option<BaseSnapshot>> {
        match self.load(base_id).await {
            Ok(base) => Ok(Some(base)),
            Err(WorkerError::BaseNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, base: &BaseSnapshot) -> WorkerResult<()>;
}

/// One JSON file per base under a directory.
#[derive(Debug, Clone)]
pub struct FileBaseRepository {
    dir: PathBuf,
}

impl FileBaseRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path(&self, base_id: &str) -> WorkerResult<PathBuf> {
        if !is_valid_base_id(base_id) {
            return Err(WorkerError::invalid_payload(format!("invalid base id '{}'", base_id)));
        }
        Ok(self.dir.join(format!("{}.json", base_id)))
    }
}

#[async_trait]
impl BaseRepository for FileBaseRepository {
    async fn load(&self, base_id: &str) -> WorkerResult<BaseSnapshot> {
        let path = self.path(base_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WorkerError::BaseNotFound(base_id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn save(&self, base: &BaseSnapshot) -> WorkerResult<()> {
        let path = self.path(&base.id)?;
        tokio::fs::create_dir_all(&self.dir).await?;

        // Write then rename so readers never see a partial file
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(base)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(base_id = %base.id, "Saved base snapshot to {}", path.display());
        Ok(())
    }
}
