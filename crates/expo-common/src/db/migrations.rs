use deadpool_postgres::PoolError;
use thiserror::Error;
use tokio_postgres::Error as PgError;
use tracing::{info, instrument};

use crate::db::PgPool;

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("failed to get postgres connection: {0}")]
    Pool(#[from] PoolError),
    #[error("failed to run migration: {0}")]
    Postgres(#[from] PgError),
}

struct Migration {
    id: i32,
    description: &'static str,
    sql: &'static str,
}

const BOOTSTRAP: &str = "CREATE SCHEMA IF NOT EXISTS expo;
CREATE TABLE IF NOT EXISTS expo.schema_migrations (
    id INTEGER PRIMARY KEY,
    description TEXT NOT NULL,
    applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);";

const MIGRATIONS: &[Migration] = &[Migration {
    id: 1,
    description: "feedback records",
    sql: r#"
CREATE TABLE IF NOT EXISTS expo.feedback (
    seq BIGSERIAL UNIQUE,
    id UUID PRIMARY KEY,
    full_name TEXT NOT NULL CHECK (btrim(full_name) <> ''),
    email TEXT NOT NULL CHECK (btrim(email) <> ''),
    event_type TEXT NOT NULL CHECK (btrim(event_type) <> ''),
    satisfaction INTEGER NOT NULL,
    ease_of_use INTEGER NOT NULL,
    customer_service INTEGER NOT NULL,
    features INTEGER NOT NULL,
    recommendation TEXT NOT NULL CHECK (btrim(recommendation) <> ''),
    improvement TEXT,
    success_story TEXT,
    allow_public_use BOOLEAN NOT NULL DEFAULT FALSE,
    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
);
"#,
}];

#[instrument(skip(pool))]
pub async fn run_migrations(pool: &PgPool) -> Result<(), MigrationError> {
    let mut client = pool.get().await?;
    client.batch_execute(BOOTSTRAP).await?;

    for migration in MIGRATIONS {
        let already_applied: bool = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM expo.schema_migrations WHERE id = $1)",
                &[&migration.id],
            )
            .await?
            .get(0);

        if already_applied {
            continue;
        }

        let tx = client.transaction().await?;
        tx.batch_execute(migration.sql).await?;
        tx.execute(
            "INSERT INTO expo.schema_migrations (id, description) VALUES ($1, $2)",
            &[&migration.id, &migration.description],
        )
        .await?;
        tx.commit().await?;

        info!(
            id = migration.id,
            description = migration.description,
            "applied migration"
        );
    }

    Ok(())
}
