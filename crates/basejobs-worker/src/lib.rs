//! Base job processors.
//!
//! This crate provides:
//! - Export, import and duplicate processors
//! - The file-backed base repository and export storage they work against
//! - The worker binary that runs them from the distributed queue

pub mod bases;
pub mod config;
pub mod error;
pub mod processors;
pub mod storage;

use std::sync::Arc;

use basejobs_queue::ProcessorRegistry;

pub use bases::{BaseRepository, BaseSnapshot, ColumnDef, FileBaseRepository, TableData};
pub use config::WorkerConfig;
pub use error::{WorkerError, WorkerResult};
pub use processors::{build_registry, ExportDocument};
pub use storage::{ExportStorage, LocalFileStorage};

/// Registry backed by the local stand-ins configured in `config`.
pub fn registry_from_config(config: &WorkerConfig) -> ProcessorRegistry {
    let bases = Arc::new(FileBaseRepository::new(config.bases_dir()));
    let storage = Arc::new(LocalFileStorage::new(
        config.exports_dir(),
        config.public_url.clone(),
    ));
    build_registry(bases, storage)
}
