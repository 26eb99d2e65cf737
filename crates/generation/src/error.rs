use thiserror::Error;

/// Classified failure of a generation call.
///
/// The orchestrator retries both kinds identically; the classification is kept
/// for audit records and for callers that want to differentiate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// The provider reported a service-level problem (rejected input, model
    /// error, non-success HTTP status, quota).
    #[error("generation service error: {0}")]
    Service(String),

    /// Anything else: transport failures, broken streams, unexpected errors.
    #[error("generation failed: {0}")]
    Generic(String),
}

impl GenerationError {
    pub fn service(msg: impl Into<String>) -> Self {
        Self::Service(msg.into())
    }

    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }
}
