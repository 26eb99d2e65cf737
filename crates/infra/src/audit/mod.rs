//! Audit log: structured success/failure events, best-effort.
//!
//! The orchestrator records one event per finished attempt. Losing an audit
//! event never changes a job's outcome.

pub mod postgres;

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

pub use postgres::PostgresAuditLog;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl AuditLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditLevel::Debug => "DEBUG",
            AuditLevel::Info => "INFO",
            AuditLevel::Warning => "WARNING",
            AuditLevel::Error => "ERROR",
            AuditLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for AuditLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Emitting component, e.g. `orchestrator`.
    pub source: String,
    pub level: AuditLevel,
    pub message: String,
    pub context: JsonValue,
    pub recorded_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(
        source: impl Into<String>,
        level: AuditLevel,
        message: impl Into<String>,
        context: JsonValue,
    ) -> Self {
        Self {
            source: source.into(),
            level,
            message: message.into(),
            context,
            recorded_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError>;
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("audit storage error: {0}")]
    Storage(String),
}

/// Forwards audit events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

#[async_trait]
impl AuditLog for TracingAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        let context = event.context.to_string();
        match event.level {
            AuditLevel::Debug => debug!(source = %event.source, context = %context, "{}", event.message),
            AuditLevel::Info => info!(source = %event.source, context = %context, "{}", event.message),
            AuditLevel::Warning => warn!(source = %event.source, context = %context, "{}", event.message),
            AuditLevel::Error | AuditLevel::Critical => {
                error!(source = %event.source, level = %event.level, context = %context, "{}", event.message)
            }
        }
        Ok(())
    }
}

/// Keeps events in memory for tests.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuditLog for InMemoryAuditLog {
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events
            .lock()
            .map_err(|_| AuditError::Storage("audit log lock poisoned".to_string()))?
            .push(event);
        Ok(())
    }
}
