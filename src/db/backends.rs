//! Queries over the `backends` table: CRUD, health-state transitions, and load/usage accounting.

use super::models::{Backend, BackendStatus};
use super::DbPool;
use chrono::{DateTime, Utc};
use uuid::Uuid;

const DEFAULT_MAX_CAPACITY: i64 = 1024 * 1024 * 1024 * 1024; // 1 TiB default.

/// Register a backend (bootstrap/seeding is an external collaborator, but the
/// row-creation primitive it drives lives here).
pub async fn create_backend(pool: &DbPool, url: &str) -> anyhow::Result<Backend> {
    let backend = sqlx::query_as::<_, Backend>(
        r#"
        INSERT INTO backends (id, url, status, load, storage_usage, max_capacity, consecutive_failures)
        VALUES ($1, $2, 'online', 0, 0, $3, 0)
        ON CONFLICT (url) DO UPDATE SET url = EXCLUDED.url
        RETURNING id, url, status, load, storage_usage, max_capacity,
                  last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(url)
    .bind(DEFAULT_MAX_CAPACITY)
    .fetch_one(pool)
    .await?;

    Ok(backend)
}

pub async fn get_backend(pool: &DbPool, id: Uuid) -> anyhow::Result<Option<Backend>> {
    let backend = sqlx::query_as::<_, Backend>(
        r#"
        SELECT id, url, status, load, storage_usage, max_capacity,
               last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        FROM backends WHERE id = $1
        "#,
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;

    Ok(backend)
}

pub async fn list_backends(pool: &DbPool) -> anyhow::Result<Vec<Backend>> {
    let backends = sqlx::query_as::<_, Backend>(
        r#"
        SELECT id, url, status, load, storage_usage, max_capacity,
               last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        FROM backends ORDER BY url
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(backends)
}

/// Online backends ordered by ascending load, for `select_targets`.
pub async fn list_online_by_ascending_load(pool: &DbPool) -> anyhow::Result<Vec<Backend>> {
    let backends = sqlx::query_as::<_, Backend>(
        r#"
        SELECT id, url, status, load, storage_usage, max_capacity,
               last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        FROM backends
        WHERE status = 'online'
        ORDER BY load ASC, id ASC
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(backends)
}

pub async fn list_offline(pool: &DbPool) -> anyhow::Result<Vec<Backend>> {
    let backends = sqlx::query_as::<_, Backend>(
        r#"
        SELECT id, url, status, load, storage_usage, max_capacity,
               last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        FROM backends WHERE status = 'offline'
        "#,
    )
    .fetch_all(pool)
    .await?;

    Ok(backends)
}

/// Record the outcome of a health probe and apply the state-machine
/// transition: a connectivity-class error trips the breaker immediately
/// when `threshold <= 1`, otherwise it takes `threshold` consecutive
/// failures of any kind.
pub async fn record_probe_result(
    pool: &DbPool,
    backend_id: Uuid,
    success: bool,
    latency_ms: i64,
    is_connectivity_error: bool,
    threshold: u32,
) -> anyhow::Result<Backend> {
    let now = Utc::now();

    if success {
        let backend = sqlx::query_as::<_, Backend>(
            r#"
            UPDATE backends
            SET last_check = $2,
                last_latency_ms = $3,
                consecutive_failures = 0,
                status = 'online',
                recovered_at = CASE WHEN status = 'offline' THEN $2 ELSE recovered_at END
            WHERE id = $1
            RETURNING id, url, status, load, storage_usage, max_capacity,
                      last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
            "#,
        )
        .bind(backend_id)
        .bind(now)
        .bind(latency_ms)
        .fetch_one(pool)
        .await?;

        return Ok(backend);
    }

    // Failure path: bump consecutive_failures first, then decide transition.
    let bumped: (i32, BackendStatus) = sqlx::query_as(
        r#"
        UPDATE backends
        SET last_check = $2,
            last_latency_ms = $3,
            consecutive_failures = consecutive_failures + 1
        WHERE id = $1
        RETURNING consecutive_failures, status
        "#,
    )
    .bind(backend_id)
    .bind(now)
    .bind(latency_ms)
    .fetch_one(pool)
    .await?;

    let (failures, status) = bumped;
    let should_trip = status == BackendStatus::Online
        && ((is_connectivity_error && threshold <= 1) || failures as u32 >= threshold);

    if should_trip {
        let backend = sqlx::query_as::<_, Backend>(
            r#"
            UPDATE backends
            SET status = 'offline', failed_at = $2
            WHERE id = $1
            RETURNING id, url, status, load, storage_usage, max_capacity,
                      last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
            "#,
        )
        .bind(backend_id)
        .bind(now)
        .fetch_one(pool)
        .await?;

        tracing::warn!(%backend_id, failures, "backend tripped offline");
        Ok(backend)
    } else {
        get_backend(pool, backend_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("backend {backend_id} disappeared mid-probe"))
    }
}

/// Passive recovery: a read succeeded against a currently-offline backend
/// during service traffic, as a side effect of a successful read.
pub async fn mark_online_passive(pool: &DbPool, backend_id: Uuid) -> anyhow::Result<()> {
    let now = Utc::now();
    sqlx::query(
        r#"
        UPDATE backends
        SET status = 'online', recovered_at = $2, consecutive_failures = 0
        WHERE id = $1 AND status = 'offline'
        "#,
    )
    .bind(backend_id)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(())
}

/// Control-plane mark-offline: sets the sentinel to suppress auto-recovery.
pub async fn mark_offline_administrative(
    pool: &DbPool,
    backend_id: Uuid,
) -> anyhow::Result<Backend> {
    use crate::config::ADMIN_OFFLINE_SENTINEL;

    let backend = sqlx::query_as::<_, Backend>(
        r#"
        UPDATE backends
        SET status = 'offline', failed_at = NOW(), consecutive_failures = $2
        WHERE id = $1
        RETURNING id, url, status, load, storage_usage, max_capacity,
                  last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        "#,
    )
    .bind(backend_id)
    .bind(ADMIN_OFFLINE_SENTINEL)
    .fetch_one(pool)
    .await?;

    Ok(backend)
}

/// Control-plane mark-online: only transitions on a successful probe, performed by the caller.
pub async fn mark_online_administrative(pool: &DbPool, backend_id: Uuid) -> anyhow::Result<Backend> {
    let backend = sqlx::query_as::<_, Backend>(
        r#"
        UPDATE backends
        SET status = 'online', recovered_at = NOW(), consecutive_failures = 0
        WHERE id = $1
        RETURNING id, url, status, load, storage_usage, max_capacity,
                  last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        "#,
    )
    .bind(backend_id)
    .fetch_one(pool)
    .await?;

    Ok(backend)
}

/// Adjust `load`/`storage_usage` by a signed delta. Used by the upload
/// coordinator and the reconciler alongside their chunk-association commits,
/// always inside the same transaction as the association change.
pub async fn adjust_load_and_usage(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    backend_id: Uuid,
    load_delta: i64,
    bytes_delta: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE backends
        SET load = load + $2, storage_usage = storage_usage + $3
        WHERE id = $1
        "#,
    )
    .bind(backend_id)
    .bind(load_delta)
    .bind(bytes_delta)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Recompute `load`/`storage_usage` for one backend from first principles
/// (the 15-minute metrics sweep), correcting any drift that accumulated
/// between sweeps.
pub async fn recompute_metrics(
    pool: &DbPool,
    backend_id: Uuid,
    latency_ms: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        UPDATE backends b
        SET load = COALESCE((SELECT COUNT(*) FROM chunk_backends cb WHERE cb.backend_id = b.id), 0),
            storage_usage = COALESCE(
                (SELECT SUM(c.size) FROM chunk_backends cb
                 JOIN chunks c ON c.id = cb.chunk_id
                 WHERE cb.backend_id = b.id),
                0
            ),
            last_latency_ms = $2,
            last_check = NOW()
        WHERE b.id = $1
        "#,
    )
    .bind(backend_id)
    .bind(latency_ms)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn backends_offline_since(
    pool: &DbPool,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<Vec<Backend>> {
    let backends = sqlx::query_as::<_, Backend>(
        r#"
        SELECT id, url, status, load, storage_usage, max_capacity,
               last_check, last_latency_ms, consecutive_failures, failed_at, recovered_at
        FROM backends
        WHERE status = 'offline' AND failed_at IS NOT NULL AND failed_at < $1
        "#,
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(backends)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_threshold_default_trips_immediately() {
        // Default threshold of 1: a
        // connectivity-class error trips on the very first failure.
        assert!(trips(true, 1, 1));
    }

    #[test]
    fn non_connectivity_error_waits_for_threshold() {
        assert!(!trips(false, 1, 2));
        assert!(trips(false, 2, 2));
    }

    // Local re-implementation of record_probe_result's `should_trip`
    // expression, for unit testing without a database.
    fn trips(is_connectivity_error: bool, failures: u32, threshold: u32) -> bool {
        (is_connectivity_error && threshold <= 1) || failures >= threshold
    }
}
