//! `mediaforge-core`: domain foundation for the generation job engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod status;

pub use error::{DomainError, DomainResult};
pub use id::{ClaimToken, JobId, SchedulerHandle};
pub use status::JobStatus;
