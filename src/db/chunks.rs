//! Queries over `chunks` and `chunk_backends`: content-addressed chunk
//! rows and their weak association to backend replicas.

use super::backends::adjust_load_and_usage;
use super::models::{Chunk, ChunkBackend};
use super::DbPool;
use uuid::Uuid;

/// Inserts one Chunk row. Each upload gets its own row per `(file_id,
/// chunk_number)` even when its `(checksum, size)` matches an existing
/// chunk elsewhere — deduplication happens at the backend-association
/// level, not at the row level: chunk rows are always per-file.
pub async fn insert_chunk(
    pool: &DbPool,
    file_id: Uuid,
    chunk_number: i32,
    checksum: &str,
    size: i64,
) -> anyhow::Result<Chunk> {
    let chunk = sqlx::query_as::<_, Chunk>(
        r#"
        INSERT INTO chunks (id, file_id, chunk_number, checksum, size)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id, file_id, chunk_number, checksum, size
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(file_id)
    .bind(chunk_number)
    .bind(checksum)
    .bind(size)
    .fetch_one(pool)
    .await?;

    Ok(chunk)
}

pub async fn get_chunks_for_file(pool: &DbPool, file_id: Uuid) -> anyhow::Result<Vec<Chunk>> {
    let chunks = sqlx::query_as::<_, Chunk>(
        r#"
        SELECT id, file_id, chunk_number, checksum, size
        FROM chunks WHERE file_id = $1 ORDER BY chunk_number ASC
        "#,
    )
    .bind(file_id)
    .fetch_all(pool)
    .await?;

    Ok(chunks)
}

pub async fn get_chunk(pool: &DbPool, id: Uuid) -> anyhow::Result<Option<Chunk>> {
    let chunk = sqlx::query_as::<_, Chunk>(
        r#"
        SELECT id, file_id, chunk_number, checksum, size
        FROM chunks WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(chunk)
}

/// Other chunks (any file) sharing this content address, for the dedup
/// probe. The caller re-verifies each candidate's backend associations are
/// actually online and actually hold the object before trusting this.
pub async fn find_chunks_by_content(
    pool: &DbPool,
    checksum: &str,
    size: i64,
) -> anyhow::Result<Vec<Chunk>> {
    let chunks = sqlx::query_as::<_, Chunk>(
        r#"
        SELECT id, file_id, chunk_number, checksum, size
        FROM chunks WHERE checksum = $1 AND size = $2
        "#,
    )
    .bind(checksum)
    .bind(size)
    .fetch_all(pool)
    .await?;

    Ok(chunks)
}

pub async fn get_backends_for_chunk(
    pool: &DbPool,
    chunk_id: Uuid,
) -> anyhow::Result<Vec<ChunkBackend>> {
    let associations = sqlx::query_as::<_, ChunkBackend>(
        r#"
        SELECT chunk_id, backend_id FROM chunk_backends WHERE chunk_id = $1
        "#,
    )
    .bind(chunk_id)
    .fetch_all(pool)
    .await?;

    Ok(associations)
}

pub async fn replica_count(pool: &DbPool, chunk_id: Uuid) -> anyhow::Result<i64> {
    let count: (i64,) =
        sqlx::query_as("SELECT COUNT(*) FROM chunk_backends WHERE chunk_id = $1")
            .bind(chunk_id)
            .fetch_one(pool)
            .await?;

    Ok(count.0)
}

/// Records one physical replica and atomically bumps the target backend's
/// `load`/`storage_usage` in the same transaction. Idempotent:
/// re-associating an existing pair is a no-op.
pub async fn add_association(
    pool: &DbPool,
    chunk_id: Uuid,
    backend_id: Uuid,
    chunk_size: i64,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    let inserted = sqlx::query(
        r#"
        INSERT INTO chunk_backends (chunk_id, backend_id)
        VALUES ($1, $2)
        ON CONFLICT (chunk_id, backend_id) DO NOTHING
        "#,
    )
    .bind(chunk_id)
    .bind(backend_id)
    .execute(&mut *tx)
    .await?;

    if inserted.rows_affected() > 0 {
        adjust_load_and_usage(&mut tx, backend_id, 1, chunk_size).await?;
        tracing::debug!(%chunk_id, %backend_id, "added chunk replica");
    }

    tx.commit().await?;
    Ok(())
}

/// Removes one physical replica (reconciler migration, evacuation) and
/// reverses the load/storage_usage accounting in the same transaction.
pub async fn remove_association(
    pool: &DbPool,
    chunk_id: Uuid,
    backend_id: Uuid,
    chunk_size: i64,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    let deleted = sqlx::query(
        "DELETE FROM chunk_backends WHERE chunk_id = $1 AND backend_id = $2",
    )
    .bind(chunk_id)
    .bind(backend_id)
    .execute(&mut *tx)
    .await?;

    if deleted.rows_affected() > 0 {
        adjust_load_and_usage(&mut tx, backend_id, -1, -chunk_size).await?;
        tracing::debug!(%chunk_id, %backend_id, "removed chunk replica");
    }

    tx.commit().await?;
    Ok(())
}

/// Chunks currently under-replicated (fewer than `min_replicas` associations
/// but at least one), for the reconciler's replica top-up pass.
pub async fn under_replicated_chunks(
    pool: &DbPool,
    min_replicas: i64,
) -> anyhow::Result<Vec<(Chunk, i64)>> {
    let rows: Vec<(Uuid, Uuid, i32, String, i64, i64)> = sqlx::query_as(
        r#"
        SELECT c.id, c.file_id, c.chunk_number, c.checksum, c.size,
               COUNT(cb.backend_id) AS replica_count
        FROM chunks c
        LEFT JOIN chunk_backends cb ON cb.chunk_id = c.id
        GROUP BY c.id, c.file_id, c.chunk_number, c.checksum, c.size
        HAVING COUNT(cb.backend_id) < $1 AND COUNT(cb.backend_id) > 0
        "#,
    )
    .bind(min_replicas)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, file_id, chunk_number, checksum, size, count)| {
            (
                Chunk {
                    id,
                    file_id,
                    chunk_number,
                    checksum,
                    size,
                },
                count,
            )
        })
        .collect())
}

/// Chunks with replicas only on a given (presumably long-offline) backend,
/// for the evacuation pass.
pub async fn chunks_with_only_backend(
    pool: &DbPool,
    backend_id: Uuid,
) -> anyhow::Result<Vec<Chunk>> {
    let chunks = sqlx::query_as::<_, Chunk>(
        r#"
        SELECT c.id, c.file_id, c.chunk_number, c.checksum, c.size
        FROM chunks c
        WHERE EXISTS (
            SELECT 1 FROM chunk_backends cb WHERE cb.chunk_id = c.id AND cb.backend_id = $1
        )
        "#,
    )
    .bind(backend_id)
    .fetch_all(pool)
    .await?;

    Ok(chunks)
}
