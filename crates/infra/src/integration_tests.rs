//! End-to-end scenarios for the orchestration pipeline.
//!
//! Tests: JobService::submit → RetryScheduler → Orchestrator → JobStore / ResultStore
//!
//! Verifies:
//! - Attempt counting and scheduling history across retries
//! - Terminal failure after the configured number of attempts
//! - Exclusive claiming under concurrent invocations
//! - Backoff gating against an injected clock
//! - Slow store writes racing the dispatches they scheduled

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeDelta, Utc};
    use futures::StreamExt;
    use futures::stream;

    use mediaforge_core::{ClaimToken, JobId, JobStatus, SchedulerHandle};
    use mediaforge_generation::{
        ByteStream, DummyProvider, GenerationError, GenerationProvider, ScriptedErrors,
    };

    use crate::audit::{AuditLevel, InMemoryAuditLog};
    use crate::jobs::{
        Clock, Dispatcher, DispatcherConfig, FailureTransition, InMemoryJobStore,
        InvocationOutcome, Job, JobService, JobStore, JobStoreError, ManualClock, Orchestrator,
        OrchestratorConfig, RetryPolicy, SkipReason,
    };
    use crate::results::{InMemoryResultStore, ResultStore, ResultStoreError, RetrievalRef};
    use crate::scheduler::{InMemoryRetryScheduler, LocalRetryScheduler};

    struct Pipeline {
        store: Arc<InMemoryJobStore>,
        scheduler: Arc<InMemoryRetryScheduler>,
        audit: Arc<InMemoryAuditLog>,
        clock: Arc<ManualClock>,
        service: JobService,
        orchestrator: Arc<Orchestrator>,
    }

    fn pipeline(provider: Arc<dyn GenerationProvider>, results: Arc<dyn ResultStore>) -> Pipeline {
        let store = Arc::new(InMemoryJobStore::new());
        let scheduler = Arc::new(InMemoryRetryScheduler::new());
        let audit = Arc::new(InMemoryAuditLog::new());
        let clock = Arc::new(ManualClock::starting_now());

        let service = JobService::new(store.clone(), scheduler.clone(), results.clone())
            .with_clock(clock.clone());
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), provider, results, scheduler.clone())
                .with_audit(audit.clone())
                .with_clock(clock.clone()),
        );

        Pipeline {
            store,
            scheduler,
            audit,
            clock,
            service,
            orchestrator,
        }
    }

    fn always_failing(err: GenerationError) -> Arc<dyn GenerationProvider> {
        Arc::new(DummyProvider::new(Arc::new(ScriptedErrors::always(err))))
    }

    /// Result store that hands out a fixed locator and remembers the bytes.
    struct FixedLocatorStore {
        locator: String,
        saved: std::sync::Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl ResultStore for FixedLocatorStore {
        async fn save(&self, bytes: Vec<u8>) -> Result<String, ResultStoreError> {
            self.saved.lock().unwrap().push(bytes);
            Ok(self.locator.clone())
        }

        async fn resolve(&self, locator: &str) -> Result<RetrievalRef, ResultStoreError> {
            Ok(RetrievalRef {
                url: format!("https://cdn.example/{locator}"),
                expires_at: chrono::Utc::now(),
            })
        }
    }

    /// In-memory store whose enqueue and failure writes land late.
    #[derive(Default)]
    struct SlowWrites {
        inner: InMemoryJobStore,
        enqueue_delay: Duration,
        failure_delay: Duration,
    }

    #[async_trait]
    impl JobStore for SlowWrites {
        async fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
            self.inner.insert(job).await
        }

        async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
            self.inner.get(id).await
        }

        async fn find_by_handle(
            &self,
            handle: &SchedulerHandle,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.find_by_handle(handle).await
        }

        async fn record_enqueue(
            &self,
            id: JobId,
            handle: SchedulerHandle,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            tokio::time::sleep(self.enqueue_delay).await;
            self.inner.record_enqueue(id, handle, now).await
        }

        async fn claim(
            &self,
            id: JobId,
            token: ClaimToken,
            now: DateTime<Utc>,
        ) -> Result<Option<Job>, JobStoreError> {
            self.inner.claim(id, token, now).await
        }

        async fn complete(
            &self,
            id: JobId,
            token: ClaimToken,
            locator: String,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            self.inner.complete(id, token, locator, now).await
        }

        async fn record_retry_or_fail(
            &self,
            id: JobId,
            token: ClaimToken,
            transition: FailureTransition,
            now: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            tokio::time::sleep(self.failure_delay).await;
            self.inner.record_retry_or_fail(id, token, transition, now).await
        }
    }

    async fn wait_for_terminal(service: &JobService, id: JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let current = service.status(id).await.unwrap();
                if current.status.is_terminal() {
                    break current;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    /// Provider yielding a fixed byte sequence in two chunks.
    struct FixedBytes(Vec<u8>);

    #[async_trait]
    impl GenerationProvider for FixedBytes {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn generate(&self, _prompt: &str) -> Result<ByteStream, GenerationError> {
            let (head, tail) = self.0.split_at(2);
            Ok(stream::iter(vec![Ok(head.to_vec()), Ok(tail.to_vec())]).boxed())
        }
    }

    #[tokio::test]
    async fn first_attempt_success_records_one_handle_and_one_attempt() {
        let p = pipeline(
            Arc::new(DummyProvider::reliable()),
            Arc::new(InMemoryResultStore::new()),
        );
        let job = p.service.submit("a cat in a hat").await.unwrap();

        let outcome = p.orchestrator.invoke(job.id).await.unwrap();
        let done = outcome.job().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert_eq!(done.scheduling_history.len(), 1);
        assert!(done.next_eligible_run.is_none());
    }

    #[tokio::test]
    async fn always_failing_provider_fails_after_five_attempts() {
        let p = pipeline(
            always_failing(GenerationError::service("model unavailable")),
            Arc::new(InMemoryResultStore::new()),
        );
        let job = p.service.submit("p").await.unwrap();

        let mut expected_delay = 1;
        for attempt in 1..=5u32 {
            let outcome = p.orchestrator.invoke(job.id).await.unwrap();
            let current = outcome.job().unwrap().clone();
            assert_eq!(current.attempt_count, attempt);

            if attempt < 5 {
                assert!(matches!(outcome, InvocationOutcome::Rescheduled(_)));
                assert_eq!(
                    current.next_eligible_run,
                    Some(p.clock.now() + TimeDelta::seconds(expected_delay))
                );
                p.clock.advance(Duration::from_secs(expected_delay as u64));
                expected_delay *= 2;
            } else {
                assert!(matches!(outcome, InvocationOutcome::Failed(_)));
            }
        }

        let failed = p.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.attempt_count, 5);
        assert!(failed.result_locator.is_none());
        assert!(failed.next_eligible_run.is_none());
        // enqueue + four retries + terminal marker
        assert_eq!(failed.scheduling_history.len(), 6);
        assert_eq!(failed.scheduling_history.last(), Some(&None));
        assert_eq!(p.scheduler.scheduled().len(), 5);

        let levels: Vec<_> = p.audit.events().iter().map(|e| e.level).collect();
        assert_eq!(levels.len(), 5);
        assert_eq!(levels[4], AuditLevel::Error);
        assert!(levels[..4].iter().all(|l| *l == AuditLevel::Warning));

        // A terminal job is never claimed again.
        assert_eq!(
            p.orchestrator.invoke(job.id).await.unwrap(),
            InvocationOutcome::Skipped(SkipReason::NotClaimable {
                job_id: job.id,
                status: JobStatus::Failed,
            })
        );
    }

    #[tokio::test]
    async fn completed_job_keeps_the_locator_from_the_result_store() {
        let results = Arc::new(FixedLocatorStore {
            locator: "blob://abc".to_string(),
            saved: std::sync::Mutex::new(Vec::new()),
        });
        let bytes = vec![0x89, 0x50, 0x4E, 0x47];
        let p = pipeline(Arc::new(FixedBytes(bytes.clone())), results.clone());
        let job = p.service.submit("p").await.unwrap();

        let outcome = p.orchestrator.invoke(job.id).await.unwrap();
        let done = outcome.job().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.result_locator.as_deref(), Some("blob://abc"));
        assert_eq!(done.attempt_count, 1);
        assert_eq!(*results.saved.lock().unwrap(), vec![bytes]);

        let reference = p.service.content_url(job.id).await.unwrap();
        assert_eq!(reference.url, "https://cdn.example/blob://abc");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_invocations_claim_once() {
        let p = pipeline(
            Arc::new(DummyProvider::reliable().with_delay(Duration::from_millis(20))),
            Arc::new(InMemoryResultStore::new()),
        );
        let job = p.service.submit("p").await.unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let orchestrator = p.orchestrator.clone();
                tokio::spawn(async move { orchestrator.invoke(job.id).await })
            })
            .collect();

        let mut completed = 0;
        let mut skipped = 0;
        for handle in handles {
            match handle.await.unwrap().unwrap() {
                InvocationOutcome::Completed(_) => completed += 1,
                InvocationOutcome::Skipped(_) => skipped += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(completed, 1);
        assert_eq!(skipped, 7);

        let done = p.store.get(job.id).await.unwrap().unwrap();
        assert_eq!(done.attempt_count, 1);
    }

    #[tokio::test]
    async fn early_reinvocation_is_gated_by_backoff() {
        let provider = DummyProvider::new(Arc::new(ScriptedErrors::failing_with([
            GenerationError::generic("connection reset"),
        ])));
        let p = pipeline(Arc::new(provider), Arc::new(InMemoryResultStore::new()));
        let job = p.service.submit("p").await.unwrap();

        p.orchestrator.invoke(job.id).await.unwrap();
        let before = p.store.get(job.id).await.unwrap().unwrap();

        p.clock.advance(Duration::from_millis(999));
        let early = p.orchestrator.invoke(job.id).await.unwrap();
        assert!(matches!(early, InvocationOutcome::Skipped(SkipReason::NotYetEligible { .. })));
        assert_eq!(p.store.get(job.id).await.unwrap().unwrap(), before);

        p.clock.advance(Duration::from_millis(1));
        let outcome = p.orchestrator.invoke(job.id).await.unwrap();
        let done = outcome.job().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 2);
        assert_eq!(done.scheduling_history.len(), 2);
    }

    #[tokio::test]
    async fn retry_handles_resolve_back_to_the_job() {
        let provider = DummyProvider::new(Arc::new(ScriptedErrors::failing_with([
            GenerationError::service("busy"),
        ])));
        let p = pipeline(Arc::new(provider), Arc::new(InMemoryResultStore::new()));
        let job = p.service.submit("p").await.unwrap();
        p.orchestrator.invoke(job.id).await.unwrap();

        for dispatch in p.scheduler.scheduled() {
            let found = p.service.status_by_handle(&dispatch.handle).await.unwrap();
            assert_eq!(found.id, job.id);
        }
        assert!(p
            .service
            .status_by_handle(&SchedulerHandle::new("mem-999"))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn local_scheduler_drives_retries_to_completion() {
        let store = Arc::new(InMemoryJobStore::new());
        let results = Arc::new(InMemoryResultStore::new());
        let (scheduler, rx) = LocalRetryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let provider = DummyProvider::new(Arc::new(ScriptedErrors::failing_with([
            GenerationError::service("warming up"),
            GenerationError::generic("stream broke"),
        ])));

        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), Arc::new(provider), results.clone(), scheduler.clone())
                .with_config(
                    OrchestratorConfig::default()
                        .with_retry_policy(RetryPolicy::exponential(5, Duration::from_millis(10))),
                ),
        );
        let service = JobService::new(store.clone(), scheduler, results);
        let handle = Dispatcher::new(orchestrator, DispatcherConfig::default()).spawn(rx);

        let job = service.submit("p").await.unwrap();
        let done = wait_for_terminal(&service, job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 3);
        assert_eq!(done.scheduling_history.len(), 3);

        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_completed, 1);
        assert_eq!(stats.jobs_rescheduled, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn enqueue_write_landing_after_completion_still_records_the_handle() {
        let store = Arc::new(SlowWrites {
            enqueue_delay: Duration::from_millis(20),
            ..Default::default()
        });
        let results = Arc::new(InMemoryResultStore::new());
        let (scheduler, rx) = LocalRetryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let orchestrator = Arc::new(Orchestrator::new(
            store.clone(),
            Arc::new(DummyProvider::reliable()),
            results.clone(),
            scheduler.clone(),
        ));
        let service = JobService::new(store.clone(), scheduler, results);
        let handle = Dispatcher::new(orchestrator, DispatcherConfig::default()).spawn(rx);

        let submitted = service.submit("p").await.unwrap();
        assert_eq!(submitted.scheduling_history.len(), 1);
        let enqueue_handle = submitted.scheduling_history[0].clone().unwrap();

        let done = wait_for_terminal(&service, submitted.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 1);
        assert_eq!(done.scheduling_history, vec![Some(enqueue_handle.clone())]);
        assert_eq!(
            service.status_by_handle(&enqueue_handle).await.unwrap().id,
            submitted.id
        );

        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_completed, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn retry_dispatch_firing_before_the_failure_is_written_is_not_lost() {
        let store = Arc::new(SlowWrites {
            failure_delay: Duration::from_millis(5),
            ..Default::default()
        });
        let results = Arc::new(InMemoryResultStore::new());
        let (scheduler, rx) = LocalRetryScheduler::new();
        let scheduler = Arc::new(scheduler);
        let provider = DummyProvider::new(Arc::new(ScriptedErrors::failing_with([
            GenerationError::service("cold start"),
        ])));
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), Arc::new(provider), results.clone(), scheduler.clone())
                .with_config(
                    OrchestratorConfig::default()
                        .with_retry_policy(RetryPolicy::exponential(5, Duration::ZERO)),
                ),
        );
        let service = JobService::new(store.clone(), scheduler, results);
        let handle = Dispatcher::new(
            orchestrator,
            DispatcherConfig::default().with_redelivery_delay(Duration::from_millis(10)),
        )
        .spawn(rx);

        let job = service.submit("p").await.unwrap();
        let done = wait_for_terminal(&service, job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.attempt_count, 2);
        // Redeliveries are not scheduling calls of the job itself.
        assert_eq!(done.scheduling_history.len(), 2);

        let stats = handle.shutdown().await;
        assert_eq!(stats.jobs_rescheduled, 1);
        assert_eq!(stats.jobs_completed, 1);
    }
}
