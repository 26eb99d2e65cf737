//! Generation jobs: record, store, orchestration and dispatch.
//!
//! ## Lifecycle
//!
//! `QUEUED → PROCESSING → {COMPLETED | QUEUED (retry) | FAILED}`
//!
//! ## Components
//!
//! - `Job`: the durable record and its pure transitions
//! - `JobStore`: per-job atomic conditional updates (in-memory or Postgres)
//! - `Orchestrator`: one attempt per invocation, retry with exponential backoff
//! - `Dispatcher`: runs due scheduler dispatches with bounded concurrency
//! - `JobService`: submission and read surface

pub mod clock;
pub mod dispatcher;
pub mod orchestrator;
pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatcher::{DispatchStats, Dispatcher, DispatcherConfig, DispatcherHandle};
pub use orchestrator::{
    AttemptError, ErrorClass, InvocationOutcome, Orchestrator, OrchestratorConfig,
    OrchestratorError, SkipReason,
};
pub use postgres::PostgresJobStore;
pub use service::{JobService, JobServiceError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{BackoffStrategy, FailureTransition, Job, RetryPolicy};
