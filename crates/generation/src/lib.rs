//! `mediaforge-generation`
//!
//! **Responsibility:** the content-generation provider boundary.
//!
//! Providers turn a prompt into a finite stream of byte chunks or fail with a
//! classified [`GenerationError`]. They never touch job state; the orchestrator
//! in `mediaforge-infra` owns retries and persistence.

pub mod dummy;
pub mod error;
pub mod http;
pub mod provider;

pub use dummy::{DummyProvider, ErrorSimulator, NeverFail, ScriptedErrors, PNG_SIGNATURE};
pub use error::GenerationError;
pub use http::HttpGenerationProvider;
pub use provider::{ByteStream, GenerationProvider, collect_bytes};
