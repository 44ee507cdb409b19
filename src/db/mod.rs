pub mod backends;
pub mod chunks;
pub mod files;
pub mod models;

use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};

pub type DbPool = Pool<Postgres>;

pub use models::{Backend, BackendStatus, Chunk, ChunkBackend, File};

/// Create a database connection pool.
pub async fn create_pool(database_url: &str) -> anyhow::Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations using SQLx's built-in migration tracking.
/// Migrations are tracked in the `_sqlx_migrations` table and only run once.
pub async fn run_migrations(pool: &DbPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Aggregate counters surfaced by the control plane's `status` command.
pub struct Stats {
    pub total_files: i64,
    pub total_chunks: i64,
    pub total_backends: i64,
    pub online_backends: i64,
    pub total_stored_bytes: i64,
}

pub async fn get_stats(pool: &DbPool) -> anyhow::Result<Stats> {
    let total_files: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM files")
        .fetch_one(pool)
        .await?;

    let total_chunks: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM chunks")
        .fetch_one(pool)
        .await?;

    let total_backends: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM backends")
        .fetch_one(pool)
        .await?;

    let online_backends: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM backends WHERE status = 'online'")
            .fetch_one(pool)
            .await?;

    let total_stored_bytes: (Option<i64>,) =
        sqlx::query_as("SELECT CAST(COALESCE(SUM(storage_usage), 0) AS BIGINT) FROM backends")
            .fetch_one(pool)
            .await?;

    Ok(Stats {
        total_files: total_files.0,
        total_chunks: total_chunks.0,
        total_backends: total_backends.0,
        online_backends: online_backends.0,
        total_stored_bytes: total_stored_bytes.0.unwrap_or(0),
    })
}
