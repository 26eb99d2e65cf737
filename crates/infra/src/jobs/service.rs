//! Submission surface: create jobs, read their state, resolve results.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use mediaforge_core::{DomainError, JobId, JobStatus, SchedulerHandle};

use crate::results::{ResultStore, ResultStoreError, RetrievalRef};
use crate::scheduler::{RetryScheduler, SchedulerError};

use super::clock::{Clock, SystemClock};
use super::store::{JobStore, JobStoreError};
use super::types::Job;

#[derive(Debug, thiserror::Error)]
pub enum JobServiceError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("scheduling job {job_id} failed: {source}")]
    Scheduling {
        job_id: JobId,
        #[source]
        source: SchedulerError,
    },
    #[error("result store error: {0}")]
    Results(#[from] ResultStoreError),
}

pub struct JobService {
    store: Arc<dyn JobStore>,
    scheduler: Arc<dyn RetryScheduler>,
    results: Arc<dyn ResultStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for JobService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobService").finish_non_exhaustive()
    }
}

impl JobService {
    pub fn new(
        store: Arc<dyn JobStore>,
        scheduler: Arc<dyn RetryScheduler>,
        results: Arc<dyn ResultStore>,
    ) -> Self {
        Self {
            store,
            scheduler,
            results,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Create a `QUEUED` job and schedule its first run immediately.
    ///
    /// If scheduling fails the job stays `QUEUED` with an empty history and
    /// the error is returned.
    #[instrument(skip(self, prompt), fields(prompt_len = prompt.len()))]
    pub async fn submit(&self, prompt: &str) -> Result<Job, JobServiceError> {
        if prompt.trim().is_empty() {
            return Err(DomainError::validation("prompt must not be empty").into());
        }

        let now = self.clock.now();
        let job = self.store.insert(Job::new(prompt, now)).await?;

        let handle = self
            .scheduler
            .schedule(job.id, now)
            .await
            .map_err(|source| {
                warn!(job_id = %job.id, error = %source, "initial scheduling failed");
                JobServiceError::Scheduling {
                    job_id: job.id,
                    source,
                }
            })?;

        // The first dispatch may already be running; the write does not depend on status.
        let job = self
            .store
            .record_enqueue(job.id, handle.clone(), self.clock.now())
            .await?;
        info!(job_id = %job.id, handle = %handle, status = %job.status, "job submitted");
        Ok(job)
    }

    pub async fn status(&self, id: JobId) -> Result<Job, JobServiceError> {
        self.store
            .get(id)
            .await?
            .ok_or(JobServiceError::NotFound(id))
    }

    /// Look a job up by any handle in its scheduling history.
    pub async fn status_by_handle(&self, handle: &SchedulerHandle) -> Result<Job, JobServiceError> {
        self.store
            .find_by_handle(handle)
            .await?
            .ok_or_else(|| DomainError::not_found().into())
    }

    /// Retrieval reference for a completed job's result.
    pub async fn content_url(&self, id: JobId) -> Result<RetrievalRef, JobServiceError> {
        let job = self.status(id).await?;
        if job.status != JobStatus::Completed {
            return Err(DomainError::invalid_state(JobStatus::Completed, job.status).into());
        }
        let locator = job.result_locator.ok_or_else(|| {
            DomainError::conflict(format!("completed job {id} has no result locator"))
        })?;
        Ok(self.results.resolve(&locator).await?)
    }
}
