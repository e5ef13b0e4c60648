//! PhotoVault shared infrastructure
//!
//! Database pool construction and schema migrations used by every binary.

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Errors raised while preparing the database
#[derive(Debug, thiserror::Error)]
pub enum SharedError {
    #[error("Database connection failed: {0}")]
    Connect(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Create the request-path connection pool.
///
/// Webhook deliveries are short-lived and bursty, so the pool stays small and
/// fails fast when exhausted instead of queueing behind slow statements.
pub async fn create_pool(database_url: &str) -> Result<PgPool, SharedError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await?;

    tracing::info!("Database pool created");
    Ok(pool)
}

/// Create a single-connection pool with generous timeouts for migrations
pub async fn create_migration_pool(database_url: &str) -> Result<PgPool, SharedError> {
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .acquire_timeout(Duration::from_secs(30))
        .connect(database_url)
        .await?;

    Ok(pool)
}

/// Apply the embedded migrations in `crates/shared/migrations`
pub async fn run_migrations(pool: &PgPool) -> Result<(), SharedError> {
    tracing::info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(pool).await?;
    tracing::info!("Database migrations complete");
    Ok(())
}
