//! Worker configuration.

use std::path::PathBuf;

/// Settings of the local stand-ins used by the processors.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Root directory for base snapshots and export files
    pub data_dir: PathBuf,
    /// Public URL prefix of stored export files; `file://` URLs when unset
    pub public_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/tmp/basejobs"),
            public_url: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            data_dir: std::env::var("JOBS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("/tmp/basejobs")),
            public_url: std::env::var("JOBS_PUBLIC_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    pub fn bases_dir(&self) -> PathBuf {
        self.data_dir.join("bases")
    }

    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("exports")
    }
}
