//! PostgreSQL job queue
//!
//! Jobs are claimed with `FOR UPDATE SKIP LOCKED`, so concurrent workers never
//! lease the same row. A lease that runs out without an ack makes the row
//! claimable again.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::infra::{IngestError, Job, JobKind, JobQueue, QueueCounts, Result};

#[derive(Clone)]
pub struct PgJobQueue {
    pool: PgPool,
}

impl PgJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Remove finished jobs older than `older_than_days`
    pub async fn cleanup(&self, older_than_days: i32) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE state <> 'queued'
              AND finished_at < NOW() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn finish(&self, job_id: Uuid, state: &str, error: Option<&str>) -> Result<()> {
        let updated = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET state = $2, last_error = $3, finished_at = NOW(),
                leased_by = NULL, leased_until = NULL
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(state)
        .bind(error)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(IngestError::Internal(format!("job {job_id} is not queued")));
        }
        Ok(())
    }
}

fn interval_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl JobQueue for PgJobQueue {
    async fn enqueue(&self, event_id: Uuid, kind: JobKind, delay: Duration) -> Result<Uuid> {
        let id = Uuid::new_v4();
        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (id, event_id, kind, available_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4::double precision / 1000))
            "#,
        )
        .bind(id)
        .bind(event_id)
        .bind(kind.as_str())
        .bind(interval_ms(delay))
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn dequeue(&self, worker_id: &str, visibility: Duration) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(
            r#"
            WITH next AS (
                SELECT id
                FROM ingest_jobs
                WHERE state = 'queued'
                  AND available_at <= NOW()
                  AND (leased_until IS NULL OR leased_until <= NOW())
                  AND NOT (SELECT paused FROM ingest_queue_control WHERE id)
                ORDER BY available_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_jobs j
            SET leased_by = $1,
                leased_until = NOW() + make_interval(secs => $2::double precision / 1000),
                deliveries = j.deliveries + 1
            FROM next
            WHERE j.id = next.id
            RETURNING j.id, j.event_id, j.kind, j.deliveries, j.enqueued_at
            "#,
        )
        .bind(worker_id)
        .bind(interval_ms(visibility))
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn ack(&self, job_id: Uuid) -> Result<()> {
        self.finish(job_id, "completed", None).await
    }

    async fn nack(&self, job_id: Uuid, delay: Duration) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET leased_by = NULL,
                leased_until = NULL,
                available_at = NOW() + make_interval(secs => $2::double precision / 1000)
            WHERE id = $1 AND state = 'queued'
            "#,
        )
        .bind(job_id)
        .bind(interval_ms(delay))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn fail(&self, job_id: Uuid, error: &str) -> Result<()> {
        self.finish(job_id, "failed", Some(error)).await
    }

    async fn counts(&self) -> Result<QueueCounts> {
        let row: (i64, i64, i64, i64, i64, bool) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE state = 'queued' AND available_at <= NOW()
                                 AND (leased_until IS NULL OR leased_until <= NOW())),
                COUNT(*) FILTER (WHERE state = 'queued' AND leased_until > NOW()),
                COUNT(*) FILTER (WHERE state = 'queued' AND available_at > NOW()
                                 AND (leased_until IS NULL OR leased_until <= NOW())),
                COUNT(*) FILTER (WHERE state = 'completed'),
                COUNT(*) FILTER (WHERE state = 'failed'),
                (SELECT paused FROM ingest_queue_control WHERE id)
            FROM ingest_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let (ready, active, delayed, completed, failed, paused) = row;
        let ready = ready as u64;
        Ok(QueueCounts {
            waiting: if paused { 0 } else { ready },
            active: active as u64,
            delayed: delayed as u64,
            completed: completed as u64,
            failed: failed as u64,
            paused: if paused { ready } else { 0 },
        })
    }

    async fn set_paused(&self, paused: bool) -> Result<()> {
        sqlx::query("UPDATE ingest_queue_control SET paused = $1 WHERE id")
            .bind(paused)
            .execute(&self.pool)
            .await?;
        tracing::info!(paused, "Ingest queue pause state changed");
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| IngestError::QueueUnavailable(e.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    event_id: Uuid,
    kind: String,
    deliveries: i32,
    enqueued_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = IngestError;

    fn try_from(row: JobRow) -> Result<Self> {
        Ok(Job {
            id: row.id,
            event_id: row.event_id,
            kind: row.kind.parse().map_err(IngestError::Internal)?,
            deliveries: row.deliveries.max(0) as u32,
            enqueued_at: row.enqueued_at,
        })
    }
}
