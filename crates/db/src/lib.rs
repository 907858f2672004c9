//! Storage for research results and the generation job queue.
//!
//! The rest of the workspace depends on the [`store::ResultStore`] and
//! [`queue::JobQueue`] contracts only. Two adapters implement them:
//! PostgreSQL (`PgResultStore`, `PgJobQueue`, backed by the repositories)
//! and in-process memory (`memory`).

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod queue;
pub mod repositories;
pub mod store;

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to verify the pool can reach the database.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}
