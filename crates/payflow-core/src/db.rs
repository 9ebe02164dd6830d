//! Pool bootstrap and embedded schema migrations (C12).

use crate::config::WorkflowEngineConfig;
use crate::error::WorkflowError;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Compiled in at build time; `migrate()` applies whatever hasn't run yet
/// against the target database, tracked in sqlx's own `_sqlx_migrations`
/// table.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn connect(config: &WorkflowEngineConfig) -> Result<PgPool, WorkflowError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections.max(1))
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url)
        .await
        .map_err(|e| WorkflowError::internal(anyhow::anyhow!("postgres connect failed: {e}")))
}

pub async fn migrate(pool: &PgPool) -> Result<(), WorkflowError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| WorkflowError::internal(anyhow::anyhow!("migration failed: {e}")))
}
