//! PostgreSQL booking domain
//!
//! Bookings are stored as a JSON record keyed by external reference. Applied
//! event ids are kept in `booking_applied_events` so re-application is a no-op.

use async_trait::async_trait;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::domain::{next_booking_state, ApplyOutcome, BookingRecord, DomainError, IngestEvent};
use crate::infra::BookingDomain;

#[derive(Clone)]
pub struct PgBookingDomain {
    pool: PgPool,
}

impl PgBookingDomain {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn unavailable(e: sqlx::Error) -> DomainError {
    DomainError::Unavailable(e.to_string())
}

fn decode(record: serde_json::Value) -> Result<BookingRecord, DomainError> {
    serde_json::from_value(record)
        .map_err(|e| DomainError::Unavailable(format!("corrupt booking record: {e}")))
}

#[async_trait]
impl BookingDomain for PgBookingDomain {
    async fn apply(&self, event: &IngestEvent) -> Result<ApplyOutcome, DomainError> {
        let mut tx = self.pool.begin().await.map_err(unavailable)?;

        let already: Option<(Uuid,)> =
            sqlx::query_as("SELECT event_id FROM booking_applied_events WHERE event_id = $1")
                .bind(event.event_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(unavailable)?;
        if already.is_some() {
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        let current: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT record FROM bookings WHERE external_booking_ref = $1 FOR UPDATE",
        )
        .bind(event.external_booking_ref())
        .fetch_optional(&mut *tx)
        .await
        .map_err(unavailable)?;
        let current = current.map(|(record,)| decode(record)).transpose()?;

        let outcome = match next_booking_state(current.as_ref(), event)? {
            Some(record) => {
                let json = serde_json::to_value(&record)
                    .map_err(|e| DomainError::Poison(e.to_string()))?;
                sqlx::query(
                    r#"
                    INSERT INTO bookings (
                        external_booking_ref, status, record, last_event_id, last_event_time, updated_at
                    ) VALUES ($1, $2, $3, $4, $5, NOW())
                    ON CONFLICT (external_booking_ref) DO UPDATE
                        SET status = EXCLUDED.status,
                            record = EXCLUDED.record,
                            last_event_id = EXCLUDED.last_event_id,
                            last_event_time = EXCLUDED.last_event_time,
                            updated_at = NOW()
                        WHERE bookings.last_event_time <= EXCLUDED.last_event_time
                    "#,
                )
                .bind(&record.external_booking_ref)
                .bind(record.status.as_str())
                .bind(&json)
                .bind(record.last_event_id)
                .bind(record.last_event_time)
                .execute(&mut *tx)
                .await
                .map_err(unavailable)?;
                ApplyOutcome::Applied
            }
            None => ApplyOutcome::Stale,
        };

        sqlx::query(
            r#"
            INSERT INTO booking_applied_events (event_id, external_booking_ref, outcome)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(event.event_id)
        .bind(event.external_booking_ref())
        .bind(match outcome {
            ApplyOutcome::Stale => "STALE",
            _ => "APPLIED",
        })
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;

        tx.commit().await.map_err(unavailable)?;
        Ok(outcome)
    }

    async fn find(&self, external_booking_ref: &str) -> Result<Option<BookingRecord>, DomainError> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT record FROM bookings WHERE external_booking_ref = $1")
                .bind(external_booking_ref)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;

        row.map(|(record,)| decode(record)).transpose()
    }

    async fn is_applied(&self, event_id: Uuid) -> Result<bool, DomainError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT event_id FROM booking_applied_events WHERE event_id = $1")
                .bind(event_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(unavailable)?;
        Ok(row.is_some())
    }
}
