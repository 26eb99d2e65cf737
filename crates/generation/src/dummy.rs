//! In-process provider for local runs and tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tracing::debug;

use crate::error::GenerationError;
use crate::provider::{ByteStream, GenerationProvider};

/// First bytes of every PNG file; the default dummy payload.
pub const PNG_SIGNATURE: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

const CHUNK_SIZE: usize = 8 * 1024;

/// Hook used to inject provider failures.
pub trait ErrorSimulator: Send + Sync + 'static {
    /// Called once per `generate`, before any bytes are produced.
    fn maybe_fail(&self, prompt: &str) -> Result<(), GenerationError>;
}

/// Simulator that never fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverFail;

impl ErrorSimulator for NeverFail {
    fn maybe_fail(&self, _prompt: &str) -> Result<(), GenerationError> {
        Ok(())
    }
}

/// Simulator that replays a script of outcomes, one per call.
///
/// `None` entries succeed. Once the script is exhausted the fallback applies.
#[derive(Debug)]
pub struct ScriptedErrors {
    script: Mutex<VecDeque<Option<GenerationError>>>,
    fallback: Option<GenerationError>,
}

impl ScriptedErrors {
    pub fn new(script: impl IntoIterator<Item = Option<GenerationError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
        }
    }

    /// Fail every call with `error`.
    pub fn always(error: GenerationError) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback: Some(error),
        }
    }

    /// Fail with each error in turn, then succeed.
    pub fn failing_with(errors: impl IntoIterator<Item = GenerationError>) -> Self {
        Self::new(errors.into_iter().map(Some))
    }
}

impl ErrorSimulator for ScriptedErrors {
    fn maybe_fail(&self, _prompt: &str) -> Result<(), GenerationError> {
        let next = self
            .script
            .lock()
            .map_err(|_| GenerationError::generic("error script lock poisoned"))?
            .pop_front();
        match next {
            Some(Some(err)) => Err(err),
            Some(None) => Ok(()),
            None => match &self.fallback {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            },
        }
    }
}

/// Provider that returns a fixed payload after an optional delay.
#[derive(Clone)]
pub struct DummyProvider {
    simulator: Arc<dyn ErrorSimulator>,
    delay: Duration,
    payload: Arc<Vec<u8>>,
}

impl DummyProvider {
    pub fn new(simulator: Arc<dyn ErrorSimulator>) -> Self {
        Self {
            simulator,
            delay: Duration::ZERO,
            payload: Arc::new(PNG_SIGNATURE.to_vec()),
        }
    }

    /// Provider that always succeeds.
    pub fn reliable() -> Self {
        Self::new(Arc::new(NeverFail))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Arc::new(payload.into());
        self
    }
}

impl core::fmt::Debug for DummyProvider {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DummyProvider")
            .field("delay", &self.delay)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

#[async_trait]
impl GenerationProvider for DummyProvider {
    fn name(&self) -> &str {
        "dummy"
    }

    async fn generate(&self, prompt: &str) -> Result<ByteStream, GenerationError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.simulator.maybe_fail(prompt)?;

        debug!(payload_len = self.payload.len(), "dummy provider produced payload");
        let chunks: Vec<Result<Vec<u8>, GenerationError>> = self
            .payload
            .chunks(CHUNK_SIZE)
            .map(|chunk| Ok(chunk.to_vec()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
