use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use uuid::Uuid;

use super::{ResultStore, ResultStoreError, RetrievalRef};

const SCHEME: &str = "mem://";

/// In-memory result store for tests/dev. Locators look like `mem://<uuid>`.
#[derive(Debug)]
pub struct InMemoryResultStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    url_ttl: Duration,
}

impl Default for InMemoryResultStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            url_ttl: Duration::from_secs(3600),
        }
    }

    pub fn with_url_ttl(mut self, ttl: Duration) -> Self {
        self.url_ttl = ttl;
        self
    }

    /// Bytes stored under `locator`, if any.
    pub fn get(&self, locator: &str) -> Option<Vec<u8>> {
        self.blobs.read().ok()?.get(locator).cloned()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ResultStore for InMemoryResultStore {
    async fn save(&self, bytes: Vec<u8>) -> Result<String, ResultStoreError> {
        let locator = format!("{SCHEME}{}", Uuid::now_v7());
        self.blobs
            .write()
            .map_err(|_| ResultStoreError::Io("result store lock poisoned".to_string()))?
            .insert(locator.clone(), bytes);
        Ok(locator)
    }

    async fn resolve(&self, locator: &str) -> Result<RetrievalRef, ResultStoreError> {
        if !locator.starts_with(SCHEME) {
            return Err(ResultStoreError::InvalidLocator(locator.to_string()));
        }
        let known = self
            .blobs
            .read()
            .map_err(|_| ResultStoreError::Io("result store lock poisoned".to_string()))?
            .contains_key(locator);
        if !known {
            return Err(ResultStoreError::NotFound(locator.to_string()));
        }
        let ttl = TimeDelta::from_std(self.url_ttl).unwrap_or(TimeDelta::MAX);
        Ok(RetrievalRef {
            url: locator.to_string(),
            expires_at: Utc::now() + ttl,
        })
    }
}
