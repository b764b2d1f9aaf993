//! PostgreSQL dead-letter repository
//!
//! Status changes are conditional updates on the expected status; a zero row
//! count is resolved into not-found or a status conflict by re-reading.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::{DeadLetterEntry, DeadLetterReason, DeadLetterStatus, DeadLetterUpdate};
use crate::infra::{DeadLetterRepository, DeadLetterStats, IngestError, Result};

const ENTRY_COLUMNS: &str = r#"
    dead_letter_key, event_id, status, reason_code, reason_detail,
    poison_message, attempts, created_at, updated_at
"#;

/// PostgreSQL-backed dead-letter store
#[derive(Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn conflict_or_missing(&self, key: &str, expected: DeadLetterStatus) -> IngestError {
        match self.find_by_key(key).await {
            Ok(Some(entry)) => IngestError::DeadLetterStatusConflict {
                key: key.to_string(),
                expected,
                actual: entry.status,
            },
            Ok(None) => IngestError::DeadLetterNotFound(key.to_string()),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl DeadLetterRepository for PgDeadLetterStore {
    async fn insert_if_absent(&self, entry: DeadLetterEntry) -> Result<(DeadLetterEntry, bool)> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO ingest_dead_letters (
                dead_letter_key, event_id, status, reason_code, reason_detail,
                poison_message, attempts, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (dead_letter_key) DO NOTHING
            "#,
        )
        .bind(&entry.dead_letter_key)
        .bind(entry.event_id)
        .bind(entry.status.as_str())
        .bind(&entry.reason_code)
        .bind(&entry.reason_detail)
        .bind(entry.poison_message)
        .bind(entry.attempts as i32)
        .bind(entry.created_at)
        .bind(entry.updated_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            tracing::warn!(
                event_id = %entry.event_id,
                dead_letter_key = %entry.dead_letter_key,
                reason = %entry.reason_code,
                "Event added to dead letter store"
            );
            return Ok((entry, true));
        }

        let existing = self
            .find_by_key(&entry.dead_letter_key)
            .await?
            .ok_or_else(|| IngestError::DeadLetterNotFound(entry.dead_letter_key.clone()))?;
        Ok((existing, false))
    }

    async fn find_by_key(&self, key: &str) -> Result<Option<DeadLetterEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ingest_dead_letters WHERE dead_letter_key = $1");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DeadLetterEntry::try_from).transpose()
    }

    async fn find_by_event_id(&self, event_id: Uuid) -> Result<Option<DeadLetterEntry>> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM ingest_dead_letters WHERE event_id = $1");
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(DeadLetterEntry::try_from).transpose()
    }

    async fn transition(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        to: DeadLetterStatus,
        update: DeadLetterUpdate,
    ) -> Result<DeadLetterEntry> {
        let sql = format!(
            r#"
            UPDATE ingest_dead_letters
            SET status = $3,
                attempts = attempts + CASE WHEN $4 THEN 1 ELSE 0 END,
                reason_detail = COALESCE($5, reason_detail),
                updated_at = NOW()
            WHERE dead_letter_key = $1 AND status = $2
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(key)
            .bind(expected.as_str())
            .bind(to.as_str())
            .bind(update.increment_attempts)
            .bind(&update.reason_detail)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => DeadLetterEntry::try_from(row),
            None => Err(self.conflict_or_missing(key, expected).await),
        }
    }

    async fn update_reason(
        &self,
        key: &str,
        expected: DeadLetterStatus,
        reason: DeadLetterReason,
    ) -> Result<DeadLetterEntry> {
        let sql = format!(
            r#"
            UPDATE ingest_dead_letters
            SET reason_code = $3,
                reason_detail = $4,
                poison_message = $5,
                updated_at = NOW()
            WHERE dead_letter_key = $1 AND status = $2
            RETURNING {ENTRY_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(key)
            .bind(expected.as_str())
            .bind(&reason.reason_code)
            .bind(&reason.reason_detail)
            .bind(reason.poison_message)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => DeadLetterEntry::try_from(row),
            None => Err(self.conflict_or_missing(key, expected).await),
        }
    }

    async fn list(
        &self,
        status: Option<DeadLetterStatus>,
        limit: usize,
    ) -> Result<Vec<DeadLetterEntry>> {
        let sql = format!(
            r#"
            SELECT {ENTRY_COLUMNS}
            FROM ingest_dead_letters
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(status.map(|s| s.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(DeadLetterEntry::try_from).collect()
    }

    async fn stats(&self) -> Result<DeadLetterStats> {
        let by_status: Vec<(String, i64)> = sqlx::query_as(
            r#"
            SELECT status, COUNT(*) as count
            FROM ingest_dead_letters
            GROUP BY status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let oldest_open: (Option<DateTime<Utc>>,) = sqlx::query_as(
            "SELECT MIN(created_at) FROM ingest_dead_letters WHERE status = 'OPEN'",
        )
        .fetch_one(&self.pool)
        .await?;

        let mut counts: BTreeMap<String, u64> = DeadLetterStatus::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        let mut total = 0;
        for (status, count) in by_status {
            total += count as u64;
            counts.insert(status, count as u64);
        }

        Ok(DeadLetterStats {
            total,
            by_status: counts,
            oldest_open: oldest_open.0,
        })
    }

    async fn count_created_since(&self, since: DateTime<Utc>) -> Result<u64> {
        let count: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ingest_dead_letters WHERE created_at >= $1")
                .bind(since)
                .fetch_one(&self.pool)
                .await?;

        Ok(count.0 as u64)
    }
}

/// Database row for dead-letter entries
#[derive(Debug, sqlx::FromRow)]
struct DeadLetterRow {
    dead_letter_key: String,
    event_id: Uuid,
    status: String,
    reason_code: String,
    reason_detail: Option<String>,
    poison_message: bool,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = IngestError;

    fn try_from(row: DeadLetterRow) -> Result<Self> {
        Ok(DeadLetterEntry {
            dead_letter_key: row.dead_letter_key,
            event_id: row.event_id,
            status: row.status.parse().map_err(IngestError::Internal)?,
            reason_code: row.reason_code,
            reason_detail: row.reason_detail,
            poison_message: row.poison_message,
            attempts: row.attempts.max(0) as u32,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
