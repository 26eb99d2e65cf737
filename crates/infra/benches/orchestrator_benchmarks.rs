use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::Utc;
use mediaforge_core::ClaimToken;
use mediaforge_generation::DummyProvider;
use mediaforge_infra::audit::InMemoryAuditLog;
use mediaforge_infra::jobs::{InMemoryJobStore, Job, JobStore, Orchestrator, RetryPolicy};
use mediaforge_infra::results::InMemoryResultStore;
use mediaforge_infra::scheduler::InMemoryRetryScheduler;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Raw store cycle: insert, claim, complete.
fn bench_store_cycle(c: &mut Criterion) {
    let rt = runtime();
    let store = InMemoryJobStore::new();
    let store = &store;

    c.bench_function("store_insert_claim_complete", |b| {
        b.to_async(&rt).iter(|| async move {
            let job = store.insert(Job::new("bench", Utc::now())).await.unwrap();
            let token = ClaimToken::new();
            store.claim(job.id, token, Utc::now()).await.unwrap();
            let done = store
                .complete(job.id, token, "mem://bench".to_string(), Utc::now())
                .await
                .unwrap();
            black_box(done)
        })
    });
}

/// Full invocation through the orchestrator with in-memory capabilities.
fn bench_invoke(c: &mut Criterion) {
    let rt = runtime();
    let store = Arc::new(InMemoryJobStore::new());
    let orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(DummyProvider::reliable()),
        Arc::new(InMemoryResultStore::new()),
        Arc::new(InMemoryRetryScheduler::new()),
    )
    .with_audit(Arc::new(InMemoryAuditLog::new()));
    let (store, orchestrator) = (&store, &orchestrator);

    c.bench_function("orchestrator_invoke_success", |b| {
        b.to_async(&rt).iter(|| async move {
            let job = store.insert(Job::new("bench", Utc::now())).await.unwrap();
            black_box(orchestrator.invoke(job.id).await.unwrap())
        })
    });
}

/// Concurrent invocations on one job: one claim wins, the rest skip.
fn bench_contended_claims(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("contended_claims");

    for contenders in [2usize, 8, 32] {
        group.throughput(Throughput::Elements(contenders as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(contenders),
            &contenders,
            |b, &contenders| {
                let store = Arc::new(InMemoryJobStore::new());
                let orchestrator = Arc::new(Orchestrator::new(
                    store.clone(),
                    Arc::new(DummyProvider::reliable()),
                    Arc::new(InMemoryResultStore::new()),
                    Arc::new(InMemoryRetryScheduler::new()),
                ));
                b.to_async(&rt).iter(|| {
                    let store = store.clone();
                    let orchestrator = orchestrator.clone();
                    async move {
                        let job = store.insert(Job::new("bench", Utc::now())).await.unwrap();
                        let tasks: Vec<_> = (0..contenders)
                            .map(|_| {
                                let orchestrator = orchestrator.clone();
                                tokio::spawn(async move { orchestrator.invoke(job.id).await })
                            })
                            .collect();
                        for task in tasks {
                            black_box(task.await.unwrap().unwrap());
                        }
                    }
                })
            },
        );
    }
    group.finish();
}

/// Backoff computation across the attempt range.
fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::exponential(5, Duration::from_secs(1));
    c.bench_function("retry_policy_next_run", |b| {
        let now = Utc::now();
        b.iter(|| {
            for attempt in 0..32u32 {
                black_box(policy.next_run(black_box(attempt), now));
            }
        })
    });
}

criterion_group!(
    benches,
    bench_store_cycle,
    bench_invoke,
    bench_contended_claims,
    bench_backoff
);
criterion_main!(benches);
