//! Job orchestrator: claim, generate, persist, or hand the failure to the
//! retry path.
//!
//! One call to [`Orchestrator::invoke`] is one attempt. The store decides who
//! owns a job: the orchestrator never locks anything in-process, it only
//! issues conditional writes and reacts to whether they applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Value as JsonValue, json};
use tracing::{debug, error, info, instrument, warn};

use mediaforge_core::{ClaimToken, JobId, JobStatus};
use mediaforge_generation::{GenerationError, GenerationProvider, collect_bytes};

use crate::audit::{AuditEvent, AuditLevel, AuditLog, TracingAuditLog};
use crate::results::{ResultStore, ResultStoreError};
use crate::scheduler::{RetryScheduler, SchedulerError};

use super::clock::{Clock, SystemClock};
use super::store::{JobStore, JobStoreError};
use super::types::{FailureTransition, Job, RetryPolicy};

pub const DEFAULT_AUDIT_SOURCE: &str = "orchestrator";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub retry_policy: RetryPolicy,
    /// Upper bound on generation (provider call plus draining the stream).
    pub generation_timeout: Option<Duration>,
    /// `source` of emitted audit events.
    pub audit_source: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::default(),
            generation_timeout: None,
            audit_source: DEFAULT_AUDIT_SOURCE.to_string(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_generation_timeout(mut self, timeout: Duration) -> Self {
        self.generation_timeout = Some(timeout);
        self
    }
}

/// Result of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed(Job),
    /// Back in `QUEUED` with a new scheduler handle.
    Rescheduled(Job),
    Failed(Job),
    /// The claim did not apply; nothing was mutated.
    Skipped(SkipReason),
}

impl InvocationOutcome {
    pub fn job(&self) -> Option<&Job> {
        match self {
            InvocationOutcome::Completed(job)
            | InvocationOutcome::Rescheduled(job)
            | InvocationOutcome::Failed(job) => Some(job),
            InvocationOutcome::Skipped(_) => None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, InvocationOutcome::Skipped(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound(JobId),
    /// The job is not `QUEUED` (another invocation holds it, or it is terminal).
    NotClaimable { job_id: JobId, status: JobStatus },
    /// Queued, but its backoff has not elapsed.
    NotYetEligible {
        job_id: JobId,
        next_eligible_run: DateTime<Utc>,
    },
}

/// Failure classes as recorded in audit events.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    ServiceError,
    GenericError,
    StorageFailure,
}

/// Why one attempt did not produce a completed job.
#[derive(Debug, thiserror::Error)]
pub enum AttemptError {
    #[error("generation failed")]
    Generation(#[source] GenerationError),

    #[error("saving the result failed")]
    ResultStore(#[source] ResultStoreError),

    #[error("recording completion failed")]
    Bookkeeping(#[source] JobStoreError),

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
}

impl AttemptError {
    pub fn class(&self) -> ErrorClass {
        match self {
            AttemptError::Generation(GenerationError::Service(_)) => ErrorClass::ServiceError,
            AttemptError::Generation(GenerationError::Generic(_)) | AttemptError::Timeout(_) => {
                ErrorClass::GenericError
            }
            AttemptError::ResultStore(_) | AttemptError::Bookkeeping(_) => {
                ErrorClass::StorageFailure
            }
        }
    }

    /// This error followed by each of its sources, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut source = std::error::Error::source(self);
        while let Some(err) = source {
            chain.push(err.to_string());
            source = err.source();
        }
        chain
    }
}

impl From<GenerationError> for AttemptError {
    fn from(err: GenerationError) -> Self {
        AttemptError::Generation(err)
    }
}

impl From<ResultStoreError> for AttemptError {
    fn from(err: ResultStoreError) -> Self {
        AttemptError::ResultStore(err)
    }
}

/// Failures that escape an invocation: the claim write itself, or the final
/// bookkeeping write after failure handling.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    provider: Arc<dyn GenerationProvider>,
    results: Arc<dyn ResultStore>,
    scheduler: Arc<dyn RetryScheduler>,
    audit: Arc<dyn AuditLog>,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("provider", &self.provider.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn JobStore>,
        provider: Arc<dyn GenerationProvider>,
        results: Arc<dyn ResultStore>,
        scheduler: Arc<dyn RetryScheduler>,
    ) -> Self {
        Self {
            store,
            provider,
            results,
            scheduler,
            audit: Arc::new(TracingAuditLog),
            clock: Arc::new(SystemClock),
            config: OrchestratorConfig::default(),
        }
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Scheduler that retries are handed to.
    pub fn scheduler(&self) -> &Arc<dyn RetryScheduler> {
        &self.scheduler
    }

    /// Run one attempt for `job_id`.
    ///
    /// Attempt failures never surface here; they are turned into a retry or a
    /// terminal failure. Only store write failures propagate.
    #[instrument(skip(self), fields(provider = %self.provider.name()))]
    pub async fn invoke(&self, job_id: JobId) -> Result<InvocationOutcome, OrchestratorError> {
        let token = ClaimToken::new();
        let Some(job) = self.store.claim(job_id, token, self.clock.now()).await? else {
            let reason = self.skip_reason(job_id).await?;
            info!(job_id = %job_id, reason = ?reason, "invocation skipped");
            return Ok(InvocationOutcome::Skipped(reason));
        };
        debug!(job_id = %job_id, attempt = job.attempt_count + 1, "job claimed");

        let locator = match self.attempt(&job).await {
            Ok(locator) => locator,
            Err(err) => return self.handle_failure(&job, token, err).await,
        };

        match self
            .store
            .complete(job_id, token, locator, self.clock.now())
            .await
        {
            Ok(done) => {
                info!(
                    job_id = %job_id,
                    attempts = done.attempt_count,
                    locator = done.result_locator.as_deref().unwrap_or_default(),
                    "job completed"
                );
                self.emit(
                    AuditLevel::Info,
                    "generation completed",
                    json!({ "job": snapshot(&done) }),
                )
                .await;
                Ok(InvocationOutcome::Completed(done))
            }
            Err(err) if err.is_storage() => {
                self.handle_failure(&job, token, AttemptError::Bookkeeping(err))
                    .await
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Decide between retry and terminal failure for a claimed job whose
    /// attempt failed, and record the decision.
    ///
    /// The retry boundary is checked after counting the failed attempt: with
    /// `max_retries = 5` the fifth failure is terminal.
    pub async fn handle_failure(
        &self,
        job: &Job,
        token: ClaimToken,
        error: AttemptError,
    ) -> Result<InvocationOutcome, OrchestratorError> {
        let prior = job.attempt_count;
        let attempts_after = prior.saturating_add(1);
        let now = self.clock.now();
        let policy = &self.config.retry_policy;

        let mut schedule_error: Option<SchedulerError> = None;
        let transition = if policy.should_retry(attempts_after) {
            let next_run = policy.next_run(prior, now);
            match self.scheduler.schedule(job.id, next_run).await {
                Ok(handle) => FailureTransition::Retry { next_run, handle },
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "could not schedule retry, failing job");
                    schedule_error = Some(e);
                    FailureTransition::Fail
                }
            }
        } else {
            FailureTransition::Fail
        };

        let updated = self
            .store
            .record_retry_or_fail(job.id, token, transition, now)
            .await?;

        let rescheduled = updated.status == JobStatus::Queued;
        if rescheduled {
            warn!(
                job_id = %job.id,
                attempts = updated.attempt_count,
                next_run = ?updated.next_eligible_run,
                error = %error,
                class = ?error.class(),
                "attempt failed, retry scheduled"
            );
        } else {
            error!(
                job_id = %job.id,
                attempts = updated.attempt_count,
                error = %error,
                class = ?error.class(),
                "attempt failed, job failed"
            );
        }

        let mut context = json!({
            "job": snapshot(&updated),
            "error": {
                "class": error.class(),
                "message": error.to_string(),
                "chain": error.chain(),
                "debug": format!("{error:?}"),
            },
        });
        if let Some(e) = &schedule_error {
            context["scheduler_error"] = JsonValue::String(e.to_string());
        }
        let (level, message) = if rescheduled {
            (AuditLevel::Warning, "generation failed, retry scheduled")
        } else {
            (AuditLevel::Error, "generation failed permanently")
        };
        self.emit(level, message, context).await;

        Ok(if rescheduled {
            InvocationOutcome::Rescheduled(updated)
        } else {
            InvocationOutcome::Failed(updated)
        })
    }

    async fn attempt(&self, job: &Job) -> Result<String, AttemptError> {
        let generate = async {
            let stream = self.provider.generate(&job.prompt).await?;
            Ok::<_, AttemptError>(collect_bytes(stream).await?)
        };
        let bytes = match self.config.generation_timeout {
            Some(limit) => tokio::time::timeout(limit, generate)
                .await
                .map_err(|_| AttemptError::Timeout(limit))??,
            None => generate.await?,
        };
        debug!(job_id = %job.id, bytes = bytes.len(), "generation finished");
        Ok(self.results.save(bytes).await?)
    }

    async fn skip_reason(&self, job_id: JobId) -> Result<SkipReason, OrchestratorError> {
        let reason = match self.store.get(job_id).await? {
            None => SkipReason::NotFound(job_id),
            Some(job) => match (job.status, job.next_eligible_run) {
                (JobStatus::Queued, Some(next_eligible_run)) => SkipReason::NotYetEligible {
                    job_id,
                    next_eligible_run,
                },
                (status, _) => SkipReason::NotClaimable { job_id, status },
            },
        };
        Ok(reason)
    }

    async fn emit(&self, level: AuditLevel, message: &str, context: JsonValue) {
        let event = AuditEvent::new(&self.config.audit_source, level, message, context);
        if let Err(e) = self.audit.record(event).await {
            warn!(error = %e, "audit event dropped");
        }
    }
}

fn snapshot(job: &Job) -> JsonValue {
    serde_json::to_value(job).unwrap_or(JsonValue::Null)
}
