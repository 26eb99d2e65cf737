//! Result store boundary: persist generated bytes, hand out retrieval references.

pub mod fs;
pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use fs::FsResultStore;
pub use in_memory::InMemoryResultStore;

/// Time-limited reference to a stored result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrievalRef {
    pub url: String,
    pub expires_at: DateTime<Utc>,
}

#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Persist `bytes` and return an opaque locator.
    async fn save(&self, bytes: Vec<u8>) -> Result<String, ResultStoreError>;

    /// Turn a locator returned by `save` into a retrieval reference.
    async fn resolve(&self, locator: &str) -> Result<RetrievalRef, ResultStoreError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ResultStoreError {
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("no stored result for locator: {0}")]
    NotFound(String),
    #[error("result storage failed: {0}")]
    Io(String),
}
