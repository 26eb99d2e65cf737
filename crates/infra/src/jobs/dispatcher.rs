//! Dispatcher: turns due scheduler dispatches into orchestrator invocations.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::scheduler::{Dispatch, RetryScheduler};

use super::orchestrator::{InvocationOutcome, Orchestrator, SkipReason};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum concurrent invocations
    pub max_concurrent: usize,
    /// Name for logging
    pub name: String,
    /// How long to wait before redelivering a dispatch whose job was still
    /// held by another invocation.
    pub redelivery_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            name: "dispatcher".to_string(),
            redelivery_delay: Duration::from_secs(1),
        }
    }
}

impl DispatcherConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max.max(1);
        self
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }
}

/// Dispatcher runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatchStats {
    pub dispatches_received: u64,
    pub jobs_completed: u64,
    pub jobs_rescheduled: u64,
    pub jobs_failed: u64,
    pub invocations_skipped: u64,
    /// Skipped dispatches handed back to the scheduler.
    pub redeliveries: u64,
    pub invocation_errors: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Handle to a spawned dispatcher.
#[derive(Debug)]
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
    stats: Arc<Mutex<DispatchStats>>,
    started: Instant,
}

impl DispatcherHandle {
    /// Stop taking new dispatches, wait for in-flight invocations, return final stats.
    pub async fn shutdown(self) -> DispatchStats {
        let _ = self.shutdown.send(true);
        self.wait().await
    }

    /// Wait for the dispatcher to stop on its own (dispatch channel closed).
    pub async fn wait(self) -> DispatchStats {
        if let Err(e) = self.join.await {
            error!(error = %e, "dispatcher task aborted");
        }
        snapshot(&self.stats, self.started)
    }

    pub fn stats(&self) -> DispatchStats {
        snapshot(&self.stats, self.started)
    }

    /// Receiver that flips to `true` on shutdown, for companion tasks such as pollers.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }
}

/// Consumes dispatches and invokes the orchestrator, at most
/// `max_concurrent` at a time. Shutdown never cancels a running invocation.
///
/// A dispatch that arrives before its job can be claimed is not dropped: if
/// the job is still backing off it is rescheduled for `next_eligible_run`,
/// and if another invocation still holds it, for `redelivery_delay` from now.
/// Dispatches for terminal or missing jobs are dropped.
#[derive(Debug)]
pub struct Dispatcher {
    orchestrator: Arc<Orchestrator>,
    config: DispatcherConfig,
    stats: Arc<Mutex<DispatchStats>>,
}

impl Dispatcher {
    pub fn new(orchestrator: Arc<Orchestrator>, config: DispatcherConfig) -> Self {
        Self {
            orchestrator,
            config,
            stats: Arc::new(Mutex::new(DispatchStats::default())),
        }
    }

    /// Spawn onto the current runtime.
    pub fn spawn(self, rx: mpsc::UnboundedReceiver<Dispatch>) -> DispatcherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = self.stats.clone();
        let join = tokio::spawn(async move { self.run(rx, shutdown_rx).await });
        DispatcherHandle {
            shutdown: shutdown_tx,
            join,
            stats,
            started: Instant::now(),
        }
    }

    /// Run until `shutdown` flips to `true` or the dispatch channel closes.
    pub async fn run(
        &self,
        mut rx: mpsc::UnboundedReceiver<Dispatch>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(dispatcher = %self.config.name, max_concurrent = self.config.max_concurrent, "dispatcher started");
        let permits = Arc::new(Semaphore::new(self.config.max_concurrent));
        let mut running = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let dispatch = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = joined {
                        error!(dispatcher = %self.config.name, error = %e, "invocation task panicked");
                    }
                    continue;
                }
                next = rx.recv() => match next {
                    Some(dispatch) => dispatch,
                    None => break,
                },
            };

            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            self.update(|s| {
                s.dispatches_received += 1;
                s.current_running += 1;
            });
            debug!(
                dispatcher = %self.config.name,
                job_id = %dispatch.job_id,
                handle = %dispatch.handle,
                "dispatching"
            );

            let orchestrator = self.orchestrator.clone();
            let stats = self.stats.clone();
            let redelivery_delay = self.config.redelivery_delay;
            running.spawn(async move {
                let result = orchestrator.invoke(dispatch.job_id).await;
                let redelivered = match &result {
                    Ok(InvocationOutcome::Skipped(reason)) => {
                        redeliver(&orchestrator, &dispatch, reason, redelivery_delay).await
                    }
                    _ => false,
                };
                let mut s = stats.lock().unwrap_or_else(|e| e.into_inner());
                if redelivered {
                    s.redeliveries += 1;
                }
                s.current_running = s.current_running.saturating_sub(1);
                match result {
                    Ok(InvocationOutcome::Completed(_)) => s.jobs_completed += 1,
                    Ok(InvocationOutcome::Rescheduled(_)) => s.jobs_rescheduled += 1,
                    Ok(InvocationOutcome::Failed(_)) => s.jobs_failed += 1,
                    Ok(InvocationOutcome::Skipped(_)) => s.invocations_skipped += 1,
                    Err(e) => {
                        s.invocation_errors += 1;
                        error!(job_id = %dispatch.job_id, error = %e, "invocation failed");
                    }
                }
                drop(permit);
            });
        }

        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!(dispatcher = %self.config.name, error = %e, "invocation task panicked");
            }
        }
        info!(dispatcher = %self.config.name, "dispatcher stopped");
    }

    fn update(&self, apply: impl FnOnce(&mut DispatchStats)) {
        apply(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }
}

/// When a skipped dispatch should be tried again, if at all.
fn redelivery_time(reason: &SkipReason, delay: Duration) -> Option<DateTime<Utc>> {
    match reason {
        SkipReason::NotYetEligible {
            next_eligible_run, ..
        } => Some(*next_eligible_run),
        SkipReason::NotClaimable { status, .. } if !status.is_terminal() => {
            TimeDelta::from_std(delay)
                .ok()
                .and_then(|delay| Utc::now().checked_add_signed(delay))
        }
        SkipReason::NotClaimable { .. } | SkipReason::NotFound(_) => None,
    }
}

async fn redeliver(
    orchestrator: &Orchestrator,
    dispatch: &Dispatch,
    reason: &SkipReason,
    delay: Duration,
) -> bool {
    let Some(at) = redelivery_time(reason, delay) else {
        return false;
    };
    match orchestrator.scheduler().schedule(dispatch.job_id, at).await {
        Ok(handle) => {
            debug!(
                job_id = %dispatch.job_id,
                skipped = %dispatch.handle,
                handle = %handle,
                not_before = %at,
                "dispatch redelivered"
            );
            true
        }
        Err(e) => {
            warn!(job_id = %dispatch.job_id, error = %e, "redelivery failed; dispatch dropped");
            false
        }
    }
}

fn snapshot(stats: &Mutex<DispatchStats>, started: Instant) -> DispatchStats {
    let mut s = stats.lock().unwrap_or_else(|e| e.into_inner()).clone();
    s.uptime_secs = started.elapsed().as_secs();
    s
}

/// Poll interval used by remote scheduler pollers feeding a dispatcher.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
