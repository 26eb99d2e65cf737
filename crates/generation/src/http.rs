//! Provider backed by a remote HTTP generation endpoint.
//!
//! The endpoint receives `POST {"prompt": "..."}` and answers with the
//! generated media as the response body, which is streamed through unchanged.

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, warn};

use crate::error::GenerationError;
use crate::provider::{ByteStream, GenerationProvider};

#[derive(Debug, Clone)]
pub struct HttpGenerationProvider {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpGenerationProvider {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GenerationError::generic(format!("failed to build http client: {e}")))?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, prompt: &str) -> Result<ByteStream, GenerationError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "prompt": prompt }))
            .send()
            .await
            .map_err(|e| GenerationError::generic(format!("request to provider failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(endpoint = %self.endpoint, %status, "provider rejected generation request");
            return Err(GenerationError::service(format!(
                "provider returned {status}: {body}"
            )));
        }

        debug!(endpoint = %self.endpoint, "provider accepted generation request");
        let stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| bytes.to_vec())
                .map_err(|e| GenerationError::generic(format!("provider stream broke: {e}")))
        });
        Ok(stream.boxed())
    }
}
