use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use mediaforge_core::{JobId, SchedulerHandle};

use super::{Dispatch, RetryScheduler, SchedulerError};

/// Records every scheduling call and never fires on its own.
///
/// Tests drain the recorded dispatches and invoke the orchestrator by hand.
#[derive(Debug, Default)]
pub struct InMemoryRetryScheduler {
    seq: AtomicU64,
    pending: Mutex<VecDeque<Dispatch>>,
    failures: Mutex<VecDeque<SchedulerError>>,
}

impl InMemoryRetryScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `schedule` call fail with `err`.
    pub fn fail_next(&self, err: SchedulerError) {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(err);
    }

    /// Dispatches recorded so far, oldest first.
    pub fn scheduled(&self) -> Vec<Dispatch> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// Remove and return every recorded dispatch.
    pub fn drain(&self) -> Vec<Dispatch> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect()
    }

    /// Remove and return the dispatches due at `now`.
    pub fn drain_due(&self, now: DateTime<Utc>) -> Vec<Dispatch> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let (due, later): (Vec<_>, Vec<_>) =
            pending.drain(..).partition(|d| d.not_before <= now);
        pending.extend(later);
        due
    }
}

#[async_trait]
impl RetryScheduler for InMemoryRetryScheduler {
    async fn schedule(
        &self,
        job_id: JobId,
        not_before: DateTime<Utc>,
    ) -> Result<SchedulerHandle, SchedulerError> {
        if let Some(err) = self
            .failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
        {
            return Err(err);
        }

        let n = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        let handle = SchedulerHandle::new(format!("mem-{n}"));
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Dispatch::new(job_id, handle.clone(), not_before));
        Ok(handle)
    }
}
