//! PostgreSQL nonce and lease stores

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;

use crate::infra::{LeaseStore, NonceStore, Result};

#[derive(Clone)]
pub struct PgNonceStore {
    pool: PgPool,
}

impl PgNonceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NonceStore for PgNonceStore {
    async fn check_and_record(&self, nonce: &str, expires_at: DateTime<Utc>) -> Result<bool> {
        // An expired row is taken over; a live one blocks the insert.
        let recorded = sqlx::query(
            r#"
            INSERT INTO ingest_nonces (nonce, expires_at)
            VALUES ($1, $2)
            ON CONFLICT (nonce) DO UPDATE
                SET expires_at = EXCLUDED.expires_at
                WHERE ingest_nonces.expires_at <= NOW()
            "#,
        )
        .bind(nonce)
        .bind(expires_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(recorded == 1)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM ingest_nonces WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }
}

#[derive(Clone)]
pub struct PgLeaseStore {
    pool: PgPool,
}

impl PgLeaseStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LeaseStore for PgLeaseStore {
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let acquired = sqlx::query(
            r#"
            INSERT INTO ingest_leases (name, holder, expires_at)
            VALUES ($1, $2, NOW() + make_interval(secs => $3::double precision / 1000))
            ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE ingest_leases.holder = EXCLUDED.holder
                   OR ingest_leases.expires_at <= NOW()
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(ttl_ms)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(acquired == 1)
    }

    async fn release(&self, name: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM ingest_leases WHERE name = $1 AND holder = $2")
            .bind(name)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
