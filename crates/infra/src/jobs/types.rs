//! Job record and retry policy.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use mediaforge_core::{ClaimToken, DomainError, DomainResult, JobId, JobStatus, SchedulerHandle};

/// Durable record of one generation job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Input text; never changes after creation.
    pub prompt: String,
    pub status: JobStatus,
    /// Set exactly once, on the transition into `COMPLETED`.
    pub result_locator: Option<String>,
    /// Number of finished attempts (success or failure).
    pub attempt_count: u32,
    /// Earliest time a re-invocation may claim the job.
    pub next_eligible_run: Option<DateTime<Utc>>,
    /// One entry per scheduling call, starting with the initial enqueue.
    /// A terminal failure appends `None`.
    pub scheduling_history: Vec<Option<SchedulerHandle>>,
    /// Token of the invocation currently holding the job in `PROCESSING`.
    pub claim_token: Option<ClaimToken>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What failure handling decided for a finished, unsuccessful attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureTransition {
    /// Back to `QUEUED`, runnable no earlier than `next_run`.
    Retry {
        next_run: DateTime<Utc>,
        handle: SchedulerHandle,
    },
    /// Give up: `FAILED`.
    Fail,
}

impl FailureTransition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            FailureTransition::Retry { .. } => JobStatus::Queued,
            FailureTransition::Fail => JobStatus::Failed,
        }
    }
}

impl Job {
    /// Create a new `QUEUED` job.
    pub fn new(prompt: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self::with_id(JobId::new(), prompt, now)
    }

    pub fn with_id(id: JobId, prompt: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            prompt: prompt.into(),
            status: JobStatus::Queued,
            result_locator: None,
            attempt_count: 0,
            next_eligible_run: None,
            scheduling_history: Vec::new(),
            claim_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Most recent non-absent scheduler handle.
    pub fn latest_handle(&self) -> Option<&SchedulerHandle> {
        self.scheduling_history.iter().rev().flatten().next()
    }

    pub fn has_handle(&self, handle: &SchedulerHandle) -> bool {
        self.scheduling_history
            .iter()
            .any(|h| h.as_ref() == Some(handle))
    }

    /// Whether a claim at `now` would succeed.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.next_eligible_run.is_none_or(|at| at <= now)
    }

    /// Record the handle of the initial enqueue.
    ///
    /// Applies in any status: the first dispatch may already have claimed,
    /// retried or finished the job. The handle always goes first.
    pub fn record_enqueue(&mut self, handle: SchedulerHandle, now: DateTime<Utc>) {
        self.scheduling_history.insert(0, Some(handle));
        self.updated_at = now;
    }

    /// `QUEUED → PROCESSING`, stamping the claim token.
    pub fn claim(&mut self, token: ClaimToken, now: DateTime<Utc>) -> DomainResult<()> {
        self.status.check_transition(JobStatus::Processing)?;
        if !self.is_claimable(now) {
            return Err(DomainError::conflict(format!(
                "job {} is not eligible before {:?}",
                self.id, self.next_eligible_run
            )));
        }
        self.status = JobStatus::Processing;
        self.claim_token = Some(token);
        self.updated_at = now;
        Ok(())
    }

    /// `PROCESSING → COMPLETED` for the invocation holding `token`.
    pub fn complete(
        &mut self,
        token: ClaimToken,
        locator: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_owned(token)?;
        if self.result_locator.is_some() {
            return Err(DomainError::conflict(format!(
                "job {} already has a result locator",
                self.id
            )));
        }
        self.status = JobStatus::Completed;
        self.result_locator = Some(locator.into());
        self.attempt_count += 1;
        self.next_eligible_run = None;
        self.claim_token = None;
        self.updated_at = now;
        Ok(())
    }

    /// `PROCESSING → QUEUED | FAILED` for the invocation holding `token`.
    pub fn record_failure(
        &mut self,
        token: ClaimToken,
        transition: FailureTransition,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        self.ensure_owned(token)?;
        self.status.check_transition(transition.target_status())?;
        match transition {
            FailureTransition::Retry { next_run, handle } => {
                self.status = JobStatus::Queued;
                self.next_eligible_run = Some(next_run);
                self.scheduling_history.push(Some(handle));
            }
            FailureTransition::Fail => {
                self.status = JobStatus::Failed;
                self.next_eligible_run = None;
                self.scheduling_history.push(None);
            }
        }
        self.attempt_count += 1;
        self.claim_token = None;
        self.updated_at = now;
        Ok(())
    }

    fn ensure_owned(&self, token: ClaimToken) -> DomainResult<()> {
        if self.status != JobStatus::Processing {
            return Err(DomainError::invalid_state(JobStatus::Processing, self.status));
        }
        if self.claim_token != Some(token) {
            return Err(DomainError::conflict(format!(
                "job {} is held by another claim",
                self.id
            )));
        }
        Ok(())
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed,
    /// Exponential backoff: base * 2^prior_attempts
    #[default]
    Exponential,
    /// Linear backoff: base * (prior_attempts + 1)
    Linear,
}

/// Retry policy configuration.
///
/// Delays are a pure function of the attempt count; there is no jitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts after which a failing job becomes `FAILED`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60 * 60),
            strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with no retries: the first failure is terminal.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay before the next run, given how many attempts had finished before
    /// the one that just failed (0-indexed).
    pub fn delay_for_attempt(&self, prior_attempts: u32) -> Duration {
        let delay = match self.strategy {
            BackoffStrategy::Fixed => Some(self.base_delay),
            BackoffStrategy::Exponential => 2u32
                .checked_pow(prior_attempts)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
            BackoffStrategy::Linear => prior_attempts
                .checked_add(1)
                .and_then(|factor| self.base_delay.checked_mul(factor)),
        };
        delay.map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// Earliest next run for a job whose failed attempt was preceded by
    /// `prior_attempts` finished attempts.
    pub fn next_run(&self, prior_attempts: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let delay = TimeDelta::from_std(self.delay_for_attempt(prior_attempts))
            .unwrap_or(TimeDelta::MAX);
        now.checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Check the attempt count *after* the failed attempt was counted.
    pub fn should_retry(&self, attempts_after_failure: u32) -> bool {
        attempts_after_failure < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn claimed_job() -> (Job, ClaimToken) {
        let mut job = Job::new("a red bicycle", now());
        job.record_enqueue(SchedulerHandle::new("initial"), now());
        let token = ClaimToken::new();
        job.claim(token, now()).unwrap();
        (job, token)
    }

    #[test]
    fn exponential_backoff_doubles_from_one_second() {
        let policy = RetryPolicy::default();

        for (k, expected) in [1u64, 2, 4, 8, 16].into_iter().enumerate() {
            assert_eq!(
                policy.delay_for_attempt(k as u32),
                Duration::from_secs(expected)
            );
        }
    }

    #[test]
    fn fixed_backoff_is_constant() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(500));

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(500));
    }

    #[test]
    fn linear_backoff_increases_linearly() {
        let policy = RetryPolicy {
            strategy: BackoffStrategy::Linear,
            base_delay: Duration::from_millis(100),
            ..Default::default()
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
    }

    #[test]
    fn huge_attempt_counts_saturate_at_max_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(40), policy.max_delay);
        assert_eq!(policy.delay_for_attempt(u32::MAX), policy.max_delay);
    }

    #[test]
    fn should_retry_is_checked_post_increment() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(1));
        assert!(policy.should_retry(4));
        assert!(!policy.should_retry(5));
        assert!(!policy.should_retry(6));
    }

    #[test]
    fn next_run_adds_delay_to_now() {
        let policy = RetryPolicy::default();
        let at = now();
        assert_eq!(policy.next_run(3, at), at + TimeDelta::seconds(8));
    }

    #[test]
    fn completing_sets_locator_once() {
        let (mut job, token) = claimed_job();

        job.complete(token, "blob://abc", now()).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result_locator.as_deref(), Some("blob://abc"));
        assert_eq!(job.attempt_count, 1);
        assert!(job.claim_token.is_none());

        let err = job.complete(token, "blob://other", now()).unwrap_err();
        assert!(matches!(err, DomainError::InvalidState { .. }));
        assert_eq!(job.result_locator.as_deref(), Some("blob://abc"));
    }

    #[test]
    fn late_enqueue_handle_goes_first_whatever_the_status() {
        let mut job = Job::new("p", now());
        let token = ClaimToken::new();
        job.claim(token, now()).unwrap();
        job.record_failure(
            token,
            FailureTransition::Retry {
                next_run: now(),
                handle: SchedulerHandle::new("retry-1"),
            },
            now(),
        )
        .unwrap();
        let token = ClaimToken::new();
        job.claim(token, now()).unwrap();
        job.complete(token, "blob://abc", now()).unwrap();

        job.record_enqueue(SchedulerHandle::new("initial"), now());

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(
            job.scheduling_history,
            vec![
                Some(SchedulerHandle::new("initial")),
                Some(SchedulerHandle::new("retry-1")),
            ]
        );
        assert!(job.has_handle(&SchedulerHandle::new("initial")));
    }

    #[test]
    fn terminal_write_with_foreign_token_is_rejected() {
        let (mut job, _token) = claimed_job();

        let err = job
            .record_failure(ClaimToken::new(), FailureTransition::Fail, now())
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempt_count, 0);
    }

    #[test]
    fn retry_requeues_with_handle_and_gate() {
        let (mut job, token) = claimed_job();
        let next_run = now() + TimeDelta::seconds(1);

        job.record_failure(
            token,
            FailureTransition::Retry {
                next_run,
                handle: SchedulerHandle::new("retry-1"),
            },
            now(),
        )
        .unwrap();

        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.next_eligible_run, Some(next_run));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(job.latest_handle(), Some(&SchedulerHandle::new("retry-1")));
        assert!(!job.is_claimable(next_run - TimeDelta::milliseconds(1)));
        assert!(job.is_claimable(next_run));
    }

    #[test]
    fn terminal_failure_appends_absent_handle() {
        let (mut job, token) = claimed_job();

        job.record_failure(token, FailureTransition::Fail, now()).unwrap();

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.next_eligible_run, None);
        assert_eq!(job.scheduling_history.len(), 2);
        assert_eq!(job.scheduling_history[1], None);
        assert_eq!(job.latest_handle(), Some(&SchedulerHandle::new("initial")));
    }

    #[test]
    fn claim_requires_queued() {
        let (mut job, _token) = claimed_job();
        let err = job.claim(ClaimToken::new(), now()).unwrap_err();
        assert!(matches!(err, DomainError::IllegalTransition { .. }));
    }

    proptest! {
        #[test]
        fn exponential_delay_never_decreases(base_ms in 1u64..5_000, k in 0u32..40) {
            let policy = RetryPolicy::exponential(5, Duration::from_millis(base_ms));
            prop_assert!(policy.delay_for_attempt(k + 1) >= policy.delay_for_attempt(k));
        }

        #[test]
        fn delay_is_a_pure_function(base_ms in 0u64..10_000, k in 0u32..64) {
            let policy = RetryPolicy::exponential(5, Duration::from_millis(base_ms));
            prop_assert_eq!(policy.delay_for_attempt(k), policy.delay_for_attempt(k));
            prop_assert!(policy.delay_for_attempt(k) <= policy.max_delay);
        }

        #[test]
        fn attempt_count_tracks_finished_attempts(outcomes in prop::collection::vec(any::<bool>(), 1..10)) {
            let mut job = Job::new("p", now());
            job.record_enqueue(SchedulerHandle::new("h0"), now());
            let mut finished = 0u32;

            for (i, succeed) in outcomes.into_iter().enumerate() {
                let token = ClaimToken::new();
                job.claim(token, now()).unwrap();
                if succeed {
                    job.complete(token, "loc", now()).unwrap();
                } else {
                    job.record_failure(
                        token,
                        FailureTransition::Retry {
                            next_run: now() - TimeDelta::seconds(1),
                            handle: SchedulerHandle::new(format!("h{}", i + 1)),
                        },
                        now(),
                    )
                    .unwrap();
                }
                finished += 1;
                prop_assert_eq!(job.attempt_count, finished);
                if succeed {
                    break;
                }
            }
        }
    }
}
