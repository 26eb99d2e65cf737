//! Postgres audit sink, one row per event in `audit_logs`.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::instrument;
use uuid::Uuid;

use super::{AuditError, AuditEvent, AuditLog};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    tag TEXT NOT NULL,
    level TEXT NOT NULL,
    message TEXT,
    extra JSONB,
    recorded_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_audit_logs_tag ON audit_logs (tag);
"#;

#[derive(Debug, Clone)]
pub struct PostgresAuditLog {
    pool: PgPool,
}

impl PostgresAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the `audit_logs` table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<(), AuditError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| AuditError::Storage(format!("ensure_schema: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl AuditLog for PostgresAuditLog {
    #[instrument(skip(self, event), fields(source = %event.source, level = %event.level), err)]
    async fn record(&self, event: AuditEvent) -> Result<(), AuditError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs (id, tag, level, message, extra, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(&event.source)
        .bind(event.level.as_str())
        .bind(&event.message)
        .bind(&event.context)
        .bind(event.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(|e| AuditError::Storage(format!("record: {e}")))?;
        Ok(())
    }
}
