use async_trait::async_trait;
use futures::TryStreamExt;
use futures::stream::BoxStream;

use crate::error::GenerationError;

/// Lazily produced output of a provider: finite and not restartable.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, GenerationError>>;

/// A content-generation capability.
///
/// `generate` may fail before producing a stream (e.g. the request was
/// rejected) or while the stream is being drained (e.g. the connection broke).
/// Both surface as [`GenerationError`].
#[async_trait]
pub trait GenerationProvider: Send + Sync + 'static {
    /// Short name used in logs and audit records.
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<ByteStream, GenerationError>;
}

/// Drain a provider stream into one buffer.
pub async fn collect_bytes(stream: ByteStream) -> Result<Vec<u8>, GenerationError> {
    stream.try_concat().await
}
