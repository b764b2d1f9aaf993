//! Database migrations.
//!
//! SQLx embedded migrations from `migrations/postgres`, applied on startup
//! or via `booking-ingest-admin migrate`.

use sqlx::PgPool;

static POSTGRES_MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/postgres");

pub async fn run_postgres(pool: &PgPool) -> anyhow::Result<()> {
    POSTGRES_MIGRATOR.run(pool).await?;
    Ok(())
}
