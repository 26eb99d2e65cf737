//! Retry scheduler boundary: "run this job again no earlier than T".
//!
//! A scheduler accepts a job id and a not-before time and returns an opaque
//! handle. When the time comes it emits a [`Dispatch`], which the
//! [`Dispatcher`](crate::jobs::Dispatcher) turns into an orchestrator invocation.

pub mod in_memory;
pub mod local;
#[cfg(feature = "redis")]
pub mod redis;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use mediaforge_core::{JobId, SchedulerHandle};

pub use in_memory::InMemoryRetryScheduler;
pub use local::LocalRetryScheduler;
#[cfg(feature = "redis")]
pub use self::redis::RedisRetryScheduler;

/// A scheduled invocation, emitted once `not_before` has passed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    pub job_id: JobId,
    pub handle: SchedulerHandle,
    pub not_before: DateTime<Utc>,
}

impl Dispatch {
    pub fn new(job_id: JobId, handle: SchedulerHandle, not_before: DateTime<Utc>) -> Self {
        Self {
            job_id,
            handle,
            not_before,
        }
    }
}

#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// Schedule `job_id` to run no earlier than `not_before`.
    async fn schedule(
        &self,
        job_id: JobId,
        not_before: DateTime<Utc>,
    ) -> Result<SchedulerHandle, SchedulerError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler transport error: {0}")]
    Transport(String),
    #[error("scheduler is closed")]
    Closed,
}
