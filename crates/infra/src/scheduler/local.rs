//! In-process scheduler backed by tokio timers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use mediaforge_core::{JobId, SchedulerHandle};

use super::{Dispatch, RetryScheduler, SchedulerError};

/// Sleeps until `not_before`, then sends the dispatch on a channel.
///
/// Pending timers live only in this process; a restart drops them.
#[derive(Debug, Clone)]
pub struct LocalRetryScheduler {
    tx: mpsc::UnboundedSender<Dispatch>,
}

impl LocalRetryScheduler {
    /// Build a scheduler and the receiver its dispatches arrive on.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Dispatch>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Build a scheduler that feeds an existing channel.
    pub fn with_sender(tx: mpsc::UnboundedSender<Dispatch>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl RetryScheduler for LocalRetryScheduler {
    async fn schedule(
        &self,
        job_id: JobId,
        not_before: DateTime<Utc>,
    ) -> Result<SchedulerHandle, SchedulerError> {
        if self.tx.is_closed() {
            return Err(SchedulerError::Closed);
        }

        let handle = SchedulerHandle::new(format!("local-{}", Uuid::now_v7()));
        let dispatch = Dispatch::new(job_id, handle.clone(), not_before);
        let delay = (not_before - Utc::now()).to_std().unwrap_or_default();
        let tx = self.tx.clone();

        debug!(job_id = %job_id, handle = %handle, delay_ms = delay.as_millis() as u64, "scheduled local dispatch");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(dispatch).is_err() {
                warn!(job_id = %job_id, "dispatch channel closed before timer fired");
            }
        });

        Ok(handle)
    }
}
