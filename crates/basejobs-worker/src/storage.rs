//! Storage for export files.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::debug;

use crate::error::WorkerResult;

#[async_trait]
pub trait ExportStorage: Send + Sync {
    /// Store `bytes` under `key` and return the URL clients download it from.
    async fn put(&self, key: &str, bytes: Vec<u8>) -> WorkerResult<String>;
}

/// Stores exports as files in a local directory.
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    dir: PathBuf,
    public_url: Option<String>,
}

impl LocalFileStorage {
    /// `public_url`, when set, is the URL prefix the directory is served under.
    pub fn new(dir: impl Into<PathBuf>, public_url: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            public_url: public_url.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    fn url_for(&self, key: &str, path: &std::path::Path) -> String {
        match &self.public_url {
            Some(base) => format!("{}/{}", base, key),
            None => format!("file://{}", path.display()),
        }
    }
}

#[async_trait]
impl ExportStorage for LocalFileStorage {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> WorkerResult<String> {
        let path = self.dir.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &bytes).await?;

        debug!("Stored {} bytes at {}", bytes.len(), path.display());
        Ok(self.url_for(key, &path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_writes_file_and_builds_url() {
        let dir = tempfile::tempdir().unwrap();

        let local = LocalFileStorage::new(dir.path(), None);
        let url = local.put("b1/export.json", b"{}".to_vec()).await.unwrap();
        assert!(url.starts_with("file://"));
        assert_eq!(tokio::fs::read(dir.path().join("b1/export.json")).await.unwrap(), b"{}");

        let public = LocalFileStorage::new(dir.path(), Some("https://files.example.com/".to_string()));
        let url = public.put("b1/export.json", b"{}".to_vec()).await.unwrap();
        assert_eq!(url, "https://files.example.com/b1/export.json");
    }
}
