use crate::config::DatabaseConfig;
use sqlx::migrate::Migrator;
use sqlx::{postgres::PgPoolOptions, PgPool};
use thiserror::Error;
use tracing::{debug, info};

/// Schema migrations compiled into the binary
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Triggers that keep the ledger tables insert-only
const APPEND_ONLY_TRIGGERS: [&str; 3] = [
    "ledger_entries_append_only",
    "audit_log_append_only",
    "transactions_append_only",
];

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Failed to create database pool: {0}")]
    PoolCreation(sqlx::Error),

    #[error("Database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Schema check failed: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Open the ledger pool and make sure the server answers.
///
/// Fails with [`DatabaseError::Config`] when no `DATABASE_URL` was configured,
/// which only happens when the postgres backend is selected without one.
pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, DatabaseError> {
    let url = config
        .url
        .as_deref()
        .ok_or_else(|| DatabaseError::Config("DATABASE_URL is not set".to_string()))?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout())
        .idle_timeout(config.idle_timeout())
        .max_lifetime(config.max_lifetime())
        .test_before_acquire(config.test_before_acquire)
        .connect(url)
        .await
        .map_err(DatabaseError::PoolCreation)?;

    let (server_version,): (String,) = sqlx::query_as("SHOW server_version")
        .fetch_one(&pool)
        .await
        .map_err(DatabaseError::PoolCreation)?;
    debug!(server_version = %server_version, "Database reachable");

    Ok(pool)
}

/// Apply pending migrations, then confirm the append-only guards are installed
pub async fn run_migrations(pool: &PgPool) -> Result<(), DatabaseError> {
    MIGRATOR.run(pool).await?;
    verify_append_only(pool).await?;
    info!(
        migrations = MIGRATOR.iter().count(),
        "Ledger schema is up to date"
    );
    Ok(())
}

/// A ledger without its mutation triggers must not start taking writes
pub async fn verify_append_only(pool: &PgPool) -> Result<(), DatabaseError> {
    let installed: Vec<(String,)> = sqlx::query_as(
        "SELECT tgname::text FROM pg_trigger WHERE NOT tgisinternal AND tgname = ANY($1)",
    )
    .bind(&APPEND_ONLY_TRIGGERS[..])
    .fetch_all(pool)
    .await
    .map_err(|e| DatabaseError::Schema(e.to_string()))?;

    let missing: Vec<&str> = APPEND_ONLY_TRIGGERS
        .iter()
        .copied()
        .filter(|name| !installed.iter().any(|(found,)| found == name))
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(DatabaseError::Schema(format!(
            "missing append-only triggers: {}",
            missing.join(", ")
        )))
    }
}
