//! Redis-backed retry scheduler (durable across restarts).
//!
//! - **Queue**: one sorted set, score = not-before in epoch millis, member =
//!   the JSON-encoded [`Dispatch`].
//! - **Polling**: every poller reads the due range and `ZREM`s each member;
//!   only the poller whose `ZREM` returns 1 owns that dispatch, so an entry is
//!   emitted at most once even with several workers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};
use uuid::Uuid;

use mediaforge_core::{JobId, SchedulerHandle};

use super::{Dispatch, RetryScheduler, SchedulerError};

const DEFAULT_QUEUE_KEY: &str = "mediaforge:retries";

const DEFAULT_BATCH_SIZE: usize = 64;

#[derive(Debug, Clone)]
pub struct RedisRetryScheduler {
    client: Arc<redis::Client>,
    queue_key: String,
    batch_size: usize,
}

impl RedisRetryScheduler {
    /// * `redis_url` - connection URL, e.g. `redis://localhost:6379`
    /// * `queue_key` - sorted-set key (default `mediaforge:retries`)
    pub fn new(redis_url: impl AsRef<str>, queue_key: Option<String>) -> Result<Self, SchedulerError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(transport)?;
        Ok(Self {
            client: Arc::new(client),
            queue_key: queue_key.unwrap_or_else(|| DEFAULT_QUEUE_KEY.to_string()),
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, SchedulerError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(transport)
    }

    /// Remove and return the dispatches due at `now` that this caller won.
    #[instrument(skip(self), fields(queue_key = %self.queue_key), err)]
    pub async fn poll_due(&self, now: DateTime<Utc>) -> Result<Vec<Dispatch>, SchedulerError> {
        let mut conn = self.connection().await?;

        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(&self.queue_key)
            .arg("-inf")
            .arg(now.timestamp_millis())
            .arg("LIMIT")
            .arg(0)
            .arg(self.batch_size)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;

        let mut due = Vec::with_capacity(members.len());
        for member in members {
            let removed: i64 = redis::cmd("ZREM")
                .arg(&self.queue_key)
                .arg(&member)
                .query_async(&mut conn)
                .await
                .map_err(transport)?;
            if removed == 0 {
                // Another poller took it.
                continue;
            }
            match serde_json::from_str::<Dispatch>(&member) {
                Ok(dispatch) => due.push(dispatch),
                Err(e) => error!(error = %e, member = %member, "dropping undecodable dispatch"),
            }
        }
        Ok(due)
    }

    /// Poll every `interval` and forward due dispatches until `shutdown` flips.
    pub fn spawn_poller(
        &self,
        tx: mpsc::UnboundedSender<Dispatch>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let scheduler = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {}
                }
                if *shutdown.borrow() {
                    break;
                }

                match scheduler.poll_due(Utc::now()).await {
                    Ok(due) => {
                        for dispatch in due {
                            if tx.send(dispatch).is_err() {
                                debug!("dispatch channel closed, stopping poller");
                                return;
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "retry queue poll failed"),
                }
            }
        })
    }
}

#[async_trait]
impl RetryScheduler for RedisRetryScheduler {
    #[instrument(skip(self), fields(queue_key = %self.queue_key), err)]
    async fn schedule(
        &self,
        job_id: JobId,
        not_before: DateTime<Utc>,
    ) -> Result<SchedulerHandle, SchedulerError> {
        let handle = SchedulerHandle::new(format!("redis-{}", Uuid::now_v7()));
        let dispatch = Dispatch::new(job_id, handle.clone(), not_before);
        let member = serde_json::to_string(&dispatch)
            .map_err(|e| SchedulerError::Transport(format!("encode dispatch: {e}")))?;

        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("ZADD")
            .arg(&self.queue_key)
            .arg(not_before.timestamp_millis())
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(transport)?;

        Ok(handle)
    }
}

fn transport(e: redis::RedisError) -> SchedulerError {
    SchedulerError::Transport(e.to_string())
}
