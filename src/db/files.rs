//! Queries over the `files` table.

use super::models::File;
use super::DbPool;
use chrono::Utc;
use uuid::Uuid;

pub async fn create_file(
    pool: &DbPool,
    name: &str,
    size: i64,
    owner: Uuid,
) -> anyhow::Result<File> {
    let file = sqlx::query_as::<_, File>(
        r#"
        INSERT INTO files (id, name, size, owner, upload_time, access_count, last_access_time)
        VALUES ($1, $2, $3, $4, NOW(), 0, NULL)
        RETURNING id, name, size, owner, upload_time, access_count, last_access_time
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(name)
    .bind(size)
    .bind(owner)
    .fetch_one(pool)
    .await?;

    Ok(file)
}

pub async fn get_file(pool: &DbPool, id: Uuid) -> anyhow::Result<Option<File>> {
    let file = sqlx::query_as::<_, File>(
        r#"
        SELECT id, name, size, owner, upload_time, access_count, last_access_time
        FROM files WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(file)
}

pub async fn list_files(pool: &DbPool, owner: Uuid) -> anyhow::Result<Vec<File>> {
    let files = sqlx::query_as::<_, File>(
        r#"
        SELECT id, name, size, owner, upload_time, access_count, last_access_time
        FROM files WHERE owner = $1 ORDER BY upload_time DESC
        "#,
    )
    .bind(owner)
    .fetch_all(pool)
    .await?;

    Ok(files)
}

/// Deletes the File row; `chunks` cascade-delete via their foreign key, and
/// each cascaded chunk takes its `chunk_backends` associations with it. The
/// physical objects on backends are not removed here — that is the
/// reconciler's and the control plane's job, not this primitive's.
pub async fn delete_file(pool: &DbPool, id: Uuid) -> anyhow::Result<bool> {
    let result = sqlx::query("DELETE FROM files WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

/// Bumps the caching heuristic bookkeeping on every read.
pub async fn record_access(pool: &DbPool, id: Uuid) -> anyhow::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE files
        SET access_count = access_count + 1, last_access_time = $2
        WHERE id = $1
        "#,
    )
    .bind(id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}
