//! Job record store: the atomic-update contract and an in-memory implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mediaforge_core::{ClaimToken, DomainError, JobId, JobStatus, SchedulerHandle};

use super::types::{FailureTransition, Job};

/// Durable job records with per-job atomic conditional updates.
///
/// Every mutating method is a single compare-and-set: it either applies to the
/// row it read or fails without side effects. Concurrent invocations on the
/// same job id can therefore never both claim it, and never both land a
/// terminal write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a freshly created job.
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Find the job whose scheduling history contains `handle`.
    async fn find_by_handle(&self, handle: &SchedulerHandle) -> Result<Option<Job>, JobStoreError>;

    /// Put the handle of the initial enqueue at the front of the history.
    ///
    /// Applies whatever the job's status: the first dispatch may have run already.
    async fn record_enqueue(
        &self,
        id: JobId,
        handle: SchedulerHandle,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// `QUEUED → PROCESSING` if the job exists, is queued and is eligible at `now`.
    ///
    /// Returns `None` when the claim did not apply; nothing is mutated then.
    async fn claim(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// `PROCESSING → COMPLETED` for the claim holding `token`; increments the attempt count.
    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        locator: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// `PROCESSING → QUEUED | FAILED` for the claim holding `token`; increments
    /// the attempt count and appends to the scheduling history.
    async fn record_retry_or_fail(
        &self,
        id: JobId,
        token: ClaimToken,
        transition: FailureTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    /// The conditional write did not apply because the row no longer matches.
    #[error("write rejected for job {id}: {reason}")]
    Rejected { id: JobId, reason: DomainError },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn rejected(id: JobId, reason: DomainError) -> Self {
        Self::Rejected { id, reason }
    }

    /// Infrastructure failure, as opposed to a lifecycle rule refusing the write.
    pub fn is_storage(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

/// In-memory job store for tests/dev.
///
/// A single write lock around the map makes every operation atomic.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, Job>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count jobs per status.
    pub fn count_by_status(&self) -> Result<HashMap<JobStatus, usize>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        let mut counts = HashMap::new();
        for job in jobs.values() {
            *counts.entry(job.status).or_insert(0) += 1;
        }
        Ok(counts)
    }

    fn mutate<F>(&self, id: JobId, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), DomainError>,
    {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;

        // Apply to a copy so a rejected write leaves the record untouched.
        let mut next = job.clone();
        apply(&mut next).map_err(|reason| JobStoreError::rejected(id, reason))?;
        *job = next.clone();
        Ok(next)
    }
}

fn poisoned() -> JobStoreError {
    JobStoreError::Storage("job store lock poisoned".to_string())
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs.get(&id).cloned())
    }

    async fn find_by_handle(&self, handle: &SchedulerHandle) -> Result<Option<Job>, JobStoreError> {
        let jobs = self.jobs.read().map_err(|_| poisoned())?;
        Ok(jobs
            .values()
            .filter(|job| job.has_handle(handle))
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn record_enqueue(
        &self,
        id: JobId,
        handle: SchedulerHandle,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, |job| {
            job.record_enqueue(handle, now);
            Ok(())
        })
    }

    async fn claim(
        &self,
        id: JobId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut jobs = self.jobs.write().map_err(|_| poisoned())?;
        match jobs.get_mut(&id) {
            Some(job) if job.is_claimable(now) => {
                job.claim(token, now)
                    .map_err(|reason| JobStoreError::rejected(id, reason))?;
                Ok(Some(job.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        id: JobId,
        token: ClaimToken,
        locator: String,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, |job| job.complete(token, locator, now))
    }

    async fn record_retry_or_fail(
        &self,
        id: JobId,
        token: ClaimToken,
        transition: FailureTransition,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.mutate(id, |job| job.record_failure(token, transition, now))
    }
}
