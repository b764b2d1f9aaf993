//! PostgreSQL audit log

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::{AuditEvent, AuditEventType, AuditQuery};
use crate::infra::{AuditLog, Result};

/// Append-only audit log stored in `ingest_audit_events`
#[derive(Clone)]
pub struct PgAuditLog {
    pool: PgPool,
}

impl PgAuditLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete audit events older than `older_than_days`
    pub async fn cleanup(&self, older_than_days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ingest_audit_events
            WHERE occurred_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;

        let deleted = result.rows_affected();
        if deleted > 0 {
            tracing::info!(deleted = deleted, "Cleaned up old audit events");
        }

        Ok(deleted)
    }
}

#[async_trait]
impl AuditLog for PgAuditLog {
    async fn append(&self, event: AuditEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ingest_audit_events (id, event_type, actor, occurred_at, subject_id, detail)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.id)
        .bind(event.event_type.as_str())
        .bind(&event.actor)
        .bind(event.occurred_at)
        .bind(&event.subject_id)
        .bind(&event.detail)
        .execute(&self.pool)
        .await?;

        tracing::info!(
            event_type = %event.event_type,
            actor = %event.actor,
            subject_id = ?event.subject_id,
            "Audit event"
        );

        Ok(())
    }

    async fn query(&self, query: &AuditQuery) -> Result<Vec<AuditEvent>> {
        let rows = sqlx::query_as::<_, AuditRow>(
            r#"
            SELECT id, event_type, actor, occurred_at, subject_id, detail
            FROM ingest_audit_events
            WHERE ($1::text IS NULL OR actor = $1)
              AND ($2::text IS NULL OR event_type = $2)
              AND ($3::text IS NULL OR subject_id = $3)
            ORDER BY occurred_at DESC
            LIMIT $4
            "#,
        )
        .bind(&query.actor)
        .bind(query.event_type.as_ref().map(|t| t.as_str().to_string()))
        .bind(&query.subject_id)
        .bind(query.limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(AuditEvent::from).collect())
    }

    async fn count(&self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ingest_audit_events")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0 as u64)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    event_type: String,
    actor: String,
    occurred_at: DateTime<Utc>,
    subject_id: Option<String>,
    detail: serde_json::Value,
}

impl From<AuditRow> for AuditEvent {
    fn from(row: AuditRow) -> Self {
        AuditEvent {
            id: row.id,
            event_type: AuditEventType::parse(&row.event_type),
            actor: row.actor,
            occurred_at: row.occurred_at,
            subject_id: row.subject_id,
            detail: row.detail,
        }
    }
}
