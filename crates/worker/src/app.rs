//! Component wiring: config → stores, provider, scheduler → dispatcher.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use mediaforge_core::JobId;
use mediaforge_generation::{DummyProvider, GenerationError, GenerationProvider, HttpGenerationProvider};
use mediaforge_infra::audit::{AuditError, AuditLog, PostgresAuditLog, TracingAuditLog};
use mediaforge_infra::jobs::{
    DispatchStats, Dispatcher, DispatcherConfig, DispatcherHandle, InMemoryJobStore, Job,
    JobService, JobServiceError, JobStore, JobStoreError, Orchestrator, OrchestratorConfig,
    PostgresJobStore,
};
use mediaforge_infra::results::{FsResultStore, InMemoryResultStore, ResultStore, RetrievalRef};
use mediaforge_infra::scheduler::{Dispatch, LocalRetryScheduler, RetryScheduler, SchedulerError};
use mediaforge_infra::{ProviderKind, WorkerConfig};

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("database connection failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    JobStore(#[from] JobStoreError),
    #[error(transparent)]
    Audit(#[from] AuditError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Provider(#[from] GenerationError),
    #[error(transparent)]
    Service(#[from] JobServiceError),
    #[error("MEDIAFORGE_REDIS_URL is set but this build has no `redis` feature")]
    RedisUnavailable,
}

/// Summary printed for each submitted job.
#[derive(Debug, Serialize)]
pub struct JobReport {
    pub job: Job,
    pub content: Option<RetrievalRef>,
}

/// A running engine: submission surface plus the background dispatcher.
pub struct Worker {
    service: JobService,
    dispatcher: DispatcherHandle,
    poller: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn service(&self) -> &JobService {
        &self.service
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Poll until `id` reaches a terminal status.
    pub async fn wait_for_terminal(
        &self,
        id: JobId,
        poll: Duration,
    ) -> Result<JobReport, WorkerError> {
        loop {
            let job = self.service.status(id).await?;
            if job.status.is_terminal() {
                let content = match job.result_locator {
                    Some(_) => Some(self.service.content_url(id).await?),
                    None => None,
                };
                return Ok(JobReport { job, content });
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Stop dispatching and wait for in-flight invocations.
    pub async fn shutdown(self) -> DispatchStats {
        let stats = self.dispatcher.shutdown().await;
        if let Some(poller) = self.poller {
            if let Err(e) = poller.await {
                warn!(error = %e, "retry poller aborted");
            }
        }
        stats
    }
}

struct Stores {
    jobs: Arc<dyn JobStore>,
    audit: Arc<dyn AuditLog>,
}

async fn build_stores(config: &WorkerConfig) -> Result<Stores, WorkerError> {
    let Some(database_url) = &config.database_url else {
        info!("no database configured, using in-memory job store");
        return Ok(Stores {
            jobs: Arc::new(InMemoryJobStore::new()),
            audit: Arc::new(TracingAuditLog),
        });
    };

    let pool = PgPool::connect(database_url).await?;
    let jobs = PostgresJobStore::new(pool.clone());
    jobs.ensure_schema().await?;
    let audit = PostgresAuditLog::new(pool);
    audit.ensure_schema().await?;
    info!("using Postgres job store and audit log");

    Ok(Stores {
        jobs: Arc::new(jobs),
        audit: Arc::new(audit),
    })
}

fn build_results(config: &WorkerConfig) -> Arc<dyn ResultStore> {
    match &config.result_dir {
        Some(dir) => Arc::new(FsResultStore::new(dir).with_url_ttl(config.result_url_ttl)),
        None => Arc::new(InMemoryResultStore::new().with_url_ttl(config.result_url_ttl)),
    }
}

fn build_provider(config: &WorkerConfig) -> Result<Arc<dyn GenerationProvider>, WorkerError> {
    Ok(match &config.provider {
        ProviderKind::Dummy { delay } => Arc::new(DummyProvider::reliable().with_delay(*delay)),
        ProviderKind::Http { endpoint } => Arc::new(HttpGenerationProvider::new(endpoint.clone())?),
    })
}

enum SchedulerWiring {
    Local(LocalRetryScheduler),
    #[cfg(feature = "redis")]
    Redis(mediaforge_infra::scheduler::RedisRetryScheduler),
}

fn build_scheduler(
    config: &WorkerConfig,
    tx: mpsc::UnboundedSender<Dispatch>,
) -> Result<SchedulerWiring, WorkerError> {
    match &config.redis_url {
        None => Ok(SchedulerWiring::Local(LocalRetryScheduler::with_sender(tx))),
        #[cfg(feature = "redis")]
        Some(url) => Ok(SchedulerWiring::Redis(
            mediaforge_infra::scheduler::RedisRetryScheduler::new(url, None)?,
        )),
        #[cfg(not(feature = "redis"))]
        Some(_) => Err(WorkerError::RedisUnavailable),
    }
}

/// Build every component from `config` and start the dispatcher.
pub async fn start(config: &WorkerConfig) -> Result<Worker, WorkerError> {
    let stores = build_stores(config).await?;
    let results = build_results(config);
    let provider = build_provider(config)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let wiring = build_scheduler(config, tx.clone())?;
    let scheduler: Arc<dyn RetryScheduler> = match &wiring {
        SchedulerWiring::Local(local) => Arc::new(local.clone()),
        #[cfg(feature = "redis")]
        SchedulerWiring::Redis(redis) => Arc::new(redis.clone()),
    };

    let orchestrator_config = OrchestratorConfig {
        retry_policy: config.retry_policy.clone(),
        generation_timeout: config.generation_timeout,
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        stores.jobs.clone(),
        provider,
        results.clone(),
        scheduler.clone(),
    )
    .with_audit(stores.audit)
    .with_config(orchestrator_config);

    let dispatcher = Dispatcher::new(
        Arc::new(orchestrator),
        DispatcherConfig::default()
            .with_name("worker")
            .with_max_concurrent(config.concurrency),
    )
    .spawn(rx);

    let poller = match wiring {
        SchedulerWiring::Local(_) => None,
        #[cfg(feature = "redis")]
        SchedulerWiring::Redis(redis) => Some(redis.spawn_poller(
            tx,
            mediaforge_infra::jobs::dispatcher::DEFAULT_POLL_INTERVAL,
            dispatcher.shutdown_signal(),
        )),
    };

    info!(concurrency = config.concurrency, "worker started");
    Ok(Worker {
        service: JobService::new(stores.jobs, scheduler, results),
        dispatcher,
        poller,
    })
}
