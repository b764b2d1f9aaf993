//! PostgreSQL event repository
//!
//! The idempotency record and the event are written in one transaction. The
//! unique key on `ingest_idempotency` serializes concurrent submissions of the
//! same key: the loser's insert waits for the winner to commit, affects no
//! rows, and falls back to a read.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgPool, FromRow};
use uuid::Uuid;

use crate::domain::{BookingEventPayload, EventTransition, IngestEvent, ProcessStatus};
use crate::infra::{EventRepository, EventStatusCounts, IngestError, Result};

const EVENT_COLUMNS: &str = r#"
    event_id, idempotency_key, payload, received_at, process_status, attempts,
    last_error, next_attempt_at, processed_at, processing_latency_ms, updated_at
"#;

/// PostgreSQL-based event repository
#[derive(Clone)]
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl EventRepository for PgEventStore {
    async fn insert_if_absent(&self, event: IngestEvent) -> Result<(IngestEvent, bool)> {
        let mut tx = self.pool.begin().await?;

        let reserved = sqlx::query(
            r#"
            INSERT INTO ingest_idempotency (idempotency_key, event_id, first_seen_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(&event.idempotency_key)
        .bind(event.event_id)
        .bind(event.received_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if reserved == 0 {
            tx.rollback().await?;
            let existing = self
                .find_by_idempotency_key(&event.idempotency_key)
                .await?
                .ok_or_else(|| {
                    IngestError::Internal(format!(
                        "idempotency key {} reserved without an event",
                        event.idempotency_key
                    ))
                })?;
            return Ok((existing, false));
        }

        let payload = serde_json::to_value(&event.payload)?;
        sqlx::query(
            r#"
            INSERT INTO ingest_events (
                event_id, idempotency_key, payload_version, event_type, event_time,
                source, external_booking_ref, payload, received_at, process_status,
                attempts, last_error, next_attempt_at, processed_at,
                processing_latency_ms, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.idempotency_key)
        .bind(&event.payload.payload_version)
        .bind(event.payload.event_type.as_str())
        .bind(event.payload.event_time)
        .bind(&event.payload.source)
        .bind(&event.payload.external_booking_ref)
        .bind(&payload)
        .bind(event.received_at)
        .bind(event.process_status.as_str())
        .bind(event.attempts as i32)
        .bind(&event.last_error)
        .bind(event.next_attempt_at)
        .bind(event.processed_at)
        .bind(event.processing_latency_ms)
        .bind(event.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((event, true))
    }

    async fn find_by_id(&self, event_id: Uuid) -> Result<Option<IngestEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM ingest_events WHERE event_id = $1");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(IngestEvent::try_from).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<IngestEvent>> {
        let sql = format!("SELECT {EVENT_COLUMNS} FROM ingest_events WHERE idempotency_key = $1");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(IngestEvent::try_from).transpose()
    }

    async fn transition(
        &self,
        event_id: Uuid,
        expected: ProcessStatus,
        transition: EventTransition,
    ) -> Result<IngestEvent> {
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {EVENT_COLUMNS} FROM ingest_events WHERE event_id = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, EventRow>(&sql)
            .bind(event_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(IngestError::EventNotFound(event_id))?;
        let mut event = IngestEvent::try_from(row)?;

        if event.process_status != expected {
            return Err(IngestError::EventStatusConflict {
                event_id,
                expected,
                actual: event.process_status,
            });
        }

        event.apply(&transition);

        sqlx::query(
            r#"
            UPDATE ingest_events
            SET process_status = $2,
                attempts = $3,
                last_error = $4,
                next_attempt_at = $5,
                processed_at = $6,
                processing_latency_ms = $7,
                updated_at = $8
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(event.process_status.as_str())
        .bind(event.attempts as i32)
        .bind(&event.last_error)
        .bind(event.next_attempt_at)
        .bind(event.processed_at)
        .bind(event.processing_latency_ms)
        .bind(event.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(event)
    }

    async fn status_counts_since(&self, since: DateTime<Utc>) -> Result<EventStatusCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT process_status, COUNT(*)
            FROM ingest_events
            WHERE received_at >= $1
            GROUP BY process_status
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        let mut counts = EventStatusCounts::default();
        for (status, count) in rows {
            let status: ProcessStatus = status.parse().map_err(IngestError::Internal)?;
            match status {
                ProcessStatus::Pending => counts.pending = count as u64,
                ProcessStatus::Processing => counts.processing = count as u64,
                ProcessStatus::Done => counts.done = count as u64,
                ProcessStatus::Failed => counts.failed = count as u64,
                ProcessStatus::DeadLetter => counts.dead_letter = count as u64,
            }
        }
        Ok(counts)
    }

    async fn latencies_since(&self, since: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT processing_latency_ms
            FROM ingest_events
            WHERE processed_at >= $1 AND processing_latency_ms IS NOT NULL
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(ms,)| ms).collect())
    }

    async fn list_by_status(
        &self,
        status: ProcessStatus,
        limit: usize,
    ) -> Result<Vec<IngestEvent>> {
        let sql = format!(
            "SELECT {EVENT_COLUMNS} FROM ingest_events WHERE process_status = $1 ORDER BY received_at ASC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, EventRow>(&sql)
            .bind(status.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(IngestEvent::try_from).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    event_id: Uuid,
    idempotency_key: String,
    payload: serde_json::Value,
    received_at: DateTime<Utc>,
    process_status: String,
    attempts: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    processing_latency_ms: Option<i64>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for IngestEvent {
    type Error = IngestError;

    fn try_from(row: EventRow) -> Result<Self> {
        let payload: BookingEventPayload = serde_json::from_value(row.payload)?;
        Ok(IngestEvent {
            event_id: row.event_id,
            idempotency_key: row.idempotency_key,
            payload,
            received_at: row.received_at,
            process_status: row.process_status.parse().map_err(IngestError::Internal)?,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            processed_at: row.processed_at,
            processing_latency_ms: row.processing_latency_ms,
            updated_at: row.updated_at,
        })
    }
}
