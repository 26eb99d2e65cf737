//! Filesystem result store.
//!
//! Results are written as `<uuid>.<extension>` under a root directory and
//! addressed as `file://<name>`. Resolving yields an absolute `file://` URL.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use tracing::debug;
use uuid::Uuid;

use super::{ResultStore, ResultStoreError, RetrievalRef};

const SCHEME: &str = "file://";

#[derive(Debug, Clone)]
pub struct FsResultStore {
    root: PathBuf,
    extension: String,
    url_ttl: Duration,
}

impl FsResultStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extension: "png".to_string(),
            url_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, locator: &str) -> Result<PathBuf, ResultStoreError> {
        let name = locator
            .strip_prefix(SCHEME)
            .ok_or_else(|| ResultStoreError::InvalidLocator(locator.to_string()))?;
        let plain = !name.is_empty()
            && !name.contains(['/', '\\'])
            && name != "."
            && name != "..";
        if !plain {
            return Err(ResultStoreError::InvalidLocator(locator.to_string()));
        }
        Ok(self.root.join(name))
    }
}

#[async_trait]
impl ResultStore for FsResultStore {
    async fn save(&self, bytes: Vec<u8>) -> Result<String, ResultStoreError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| ResultStoreError::Io(format!("create {}: {e}", self.root.display())))?;

        let name = format!("{}.{}", Uuid::now_v7(), self.extension);
        let path = self.root.join(&name);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| ResultStoreError::Io(format!("write {}: {e}", path.display())))?;

        debug!(path = %path.display(), bytes = bytes.len(), "stored generation result");
        Ok(format!("{SCHEME}{name}"))
    }

    async fn resolve(&self, locator: &str) -> Result<RetrievalRef, ResultStoreError> {
        let path = self.path_for(locator)?;
        let absolute = match tokio::fs::canonicalize(&path).await {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ResultStoreError::NotFound(locator.to_string()));
            }
            Err(e) => {
                return Err(ResultStoreError::Io(format!("resolve {}: {e}", path.display())));
            }
        };

        let ttl = TimeDelta::from_std(self.url_ttl).unwrap_or(TimeDelta::MAX);
        Ok(RetrievalRef {
            url: format!("file://{}", absolute.display()),
            expires_at: Utc::now() + ttl,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_writes_file_and_resolve_points_at_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path().join("results"));

        let locator = store.save(vec![1, 2, 3]).await.unwrap();
        assert!(locator.starts_with("file://"));
        assert!(locator.ends_with(".png"));

        let reference = store.resolve(&locator).await.unwrap();
        let path = reference.url.strip_prefix("file://").unwrap();
        assert_eq!(std::fs::read(path).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn path_traversal_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path());

        for locator in ["file://../etc/passwd", "file://a/b.png", "file://", "s3://x/y"] {
            assert!(
                matches!(
                    store.resolve(locator).await,
                    Err(ResultStoreError::InvalidLocator(_))
                ),
                "{locator}"
            );
        }
    }

    #[tokio::test]
    async fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsResultStore::new(dir.path()).with_extension("bin");
        assert!(matches!(
            store.resolve("file://nope.bin").await,
            Err(ResultStoreError::NotFound(_))
        ));
    }
}
