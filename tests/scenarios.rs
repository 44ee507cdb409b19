//! End-to-end scenarios against a real (ephemeral, per-test) Postgres
//! instance, exercising upload, dedup, failover, passive recovery, and
//! reconciliation together rather than one component at a time.

use bytes::Bytes;
use futures::StreamExt;
use sqlx::PgPool;
use std::sync::Arc;
use stratafs::db::{self, backends as backends_db};
use stratafs::storage::backend_client::test_util::InMemoryBackendClient;
use stratafs::storage::{
    BackendHandle, ChunkCache, DiskCache, DownloadCoordinator, Reconciler, UploadCoordinator,
};
use uuid::Uuid;

const PAYLOAD_UNIT: &[u8] = b"abcdefghijklmnop";
const CHUNK_SIZE: usize = 16;

/// One seeded backend, keeping the concrete in-memory client alongside its
/// `BackendHandle` so tests can drive fault injection directly without
/// downcasting a trait object.
struct SeededBackend {
    handle: BackendHandle,
    client: Arc<InMemoryBackendClient>,
}

async fn seed_backends(pool: &PgPool, n: usize) -> Vec<SeededBackend> {
    let mut seeded = Vec::with_capacity(n);
    for i in 0..n {
        let backend = backends_db::create_backend(pool, &format!("http://backend-{i}.local"))
            .await
            .unwrap();
        let client = Arc::new(InMemoryBackendClient::new(backend.url.clone()));
        client.create_bucket("stratafs").await.unwrap();
        seeded.push(SeededBackend {
            handle: BackendHandle {
                backend,
                client: client.clone(),
            },
            client,
        });
    }
    seeded
}

fn handles(seeded: &[SeededBackend]) -> Vec<BackendHandle> {
    seeded.iter().map(|s| s.handle.clone()).collect()
}

/// Re-reads every Backend row from the database, rebuilding `BackendHandle`s
/// around the same (still-reachable) in-memory clients. Used after a test
/// mutates backend state directly via the db layer.
async fn refresh(pool: &PgPool, seeded: &[SeededBackend]) -> Vec<BackendHandle> {
    let mut refreshed = Vec::with_capacity(seeded.len());
    for s in seeded {
        let backend = backends_db::get_backend(pool, s.handle.backend.id)
            .await
            .unwrap()
            .unwrap();
        refreshed.push(BackendHandle {
            backend,
            client: s.client.clone(),
        });
    }
    refreshed
}

/// A fresh `DownloadCoordinator` with its own empty disk/chunk caches. The
/// returned `TempDir` must be kept alive for as long as the coordinator is
/// used, since dropping it removes the disk cache directory.
fn fresh_downloader(
    pool: PgPool,
    bucket: &str,
    fallback_buckets: Vec<String>,
) -> (DownloadCoordinator, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let disk_cache = Arc::new(DiskCache::new(dir.path()).unwrap());
    let chunk_cache = Arc::new(ChunkCache::new());
    (
        DownloadCoordinator::new(pool, bucket, fallback_buckets, disk_cache, chunk_cache),
        dir,
    )
}

/// S1: round-trip upload/download of a 48-byte payload chunked at 16 bytes
/// across three backends, min_replicas=2.
#[sqlx::test]
async fn s1_round_trip(pool: PgPool) -> sqlx::Result<()> {
    let seeded = seed_backends(&pool, 3).await;
    let handles = handles(&seeded);
    let owner = Uuid::new_v4();
    let payload = Bytes::from(PAYLOAD_UNIT.repeat(3));

    let uploader = UploadCoordinator::new(pool.clone(), 2, "stratafs");
    let file = uploader
        .upload("payload.bin", owner, payload.clone(), CHUNK_SIZE, &handles)
        .await
        .expect("upload should succeed");

    let chunks = db::chunks::get_chunks_for_file(&pool, file.id).await.unwrap();
    assert_eq!(chunks.len(), 3);
    for chunk in &chunks {
        assert_eq!(chunk.size, 16);
        let replicas = db::chunks::replica_count(&pool, chunk.id).await.unwrap();
        assert_eq!(replicas, 2);
    }

    let (downloader, _dir) = fresh_downloader(pool.clone(), "stratafs", vec![]);
    let mut stream = Box::pin(downloader.download(file.id, &handles));
    let mut reconstructed = Vec::new();
    while let Some(chunk) = stream.next().await {
        reconstructed.extend_from_slice(&chunk.expect("chunk should download"));
    }

    assert_eq!(reconstructed, payload.to_vec());
    Ok(())
}

/// S2: uploading identical content as two distinct files produces two File
/// rows and six Chunk rows sharing one content address, but the physical
/// replica count stays at min_replicas per chunk, not six times over.
#[sqlx::test]
async fn s2_dedup(pool: PgPool) -> sqlx::Result<()> {
    let seeded = seed_backends(&pool, 3).await;
    let handles = handles(&seeded);
    let owner = Uuid::new_v4();
    let payload = Bytes::from(PAYLOAD_UNIT.repeat(3));

    let uploader = UploadCoordinator::new(pool.clone(), 2, "stratafs");
    let file_a = uploader
        .upload("a.bin", owner, payload.clone(), CHUNK_SIZE, &handles)
        .await
        .unwrap();
    let file_b = uploader
        .upload("b.bin", owner, payload.clone(), CHUNK_SIZE, &handles)
        .await
        .unwrap();

    let chunks_a = db::chunks::get_chunks_for_file(&pool, file_a.id).await.unwrap();
    let chunks_b = db::chunks::get_chunks_for_file(&pool, file_b.id).await.unwrap();
    assert_eq!(chunks_a.len() + chunks_b.len(), 6);

    let distinct_content: std::collections::HashSet<_> = chunks_a
        .iter()
        .chain(chunks_b.iter())
        .map(|c| (c.checksum.clone(), c.size))
        .collect();
    assert_eq!(distinct_content.len(), 1);

    let backends = backends_db::list_backends(&pool).await.unwrap();
    let total_usage: i64 = backends.iter().map(|b| b.storage_usage).sum();
    assert_eq!(total_usage, 2 * 16);

    Ok(())
}

/// S3/S4: with one backend offline, download still succeeds by failing
/// over to a surviving replica; if the "offline" backend is in fact
/// reachable, the read that lands on it passively recovers it.
#[sqlx::test]
async fn s3_s4_failover_and_passive_recovery(pool: PgPool) -> sqlx::Result<()> {
    let seeded = seed_backends(&pool, 3).await;
    let initial_handles = handles(&seeded);
    let owner = Uuid::new_v4();
    let payload = Bytes::from(PAYLOAD_UNIT.repeat(3));

    let uploader = UploadCoordinator::new(pool.clone(), 2, "stratafs");
    let file = uploader
        .upload("payload.bin", owner, payload.clone(), CHUNK_SIZE, &initial_handles)
        .await
        .unwrap();

    // Mark backend 0 offline administratively; it is in fact still
    // reachable (false positive), so a download landing on it should
    // passively recover it.
    backends_db::mark_offline_administrative(&pool, seeded[0].handle.backend.id)
        .await
        .unwrap();

    let offline_handles = refresh(&pool, &seeded).await;
    let (downloader, _dir) = fresh_downloader(pool.clone(), "stratafs", vec![]);
    let mut stream = Box::pin(downloader.download(file.id, &offline_handles));
    let mut reconstructed = Vec::new();
    while let Some(chunk) = stream.next().await {
        reconstructed.extend_from_slice(&chunk.expect("download must survive one offline backend"));
    }
    assert_eq!(reconstructed, payload.to_vec());

    let after_handles = refresh(&pool, &seeded).await;
    let backend_0 = after_handles
        .iter()
        .find(|h| h.backend.id == seeded[0].handle.backend.id)
        .unwrap();
    assert!(backend_0.backend.is_online());
    assert!(backend_0.backend.recovered_at.is_some());
    assert_eq!(backend_0.backend.consecutive_failures, 0);

    Ok(())
}

/// S5: after losing all-but-one replica of a chunk, the reconciler restores
/// the replica count and the recreated copy's bytes check out.
#[sqlx::test]
async fn s5_reconciliation_restores_replicas(pool: PgPool) -> sqlx::Result<()> {
    let seeded = seed_backends(&pool, 4).await;
    let handles = handles(&seeded);
    let owner = Uuid::new_v4();
    let payload = Bytes::from(PAYLOAD_UNIT.repeat(3));

    let uploader = UploadCoordinator::new(pool.clone(), 2, "stratafs");
    let file = uploader
        .upload("payload.bin", owner, payload.clone(), CHUNK_SIZE, &handles)
        .await
        .unwrap();

    let chunks = db::chunks::get_chunks_for_file(&pool, file.id).await.unwrap();
    let chunk_1 = &chunks[1];
    let associations = db::chunks::get_backends_for_chunk(&pool, chunk_1.id).await.unwrap();
    for assoc in associations.iter().skip(1) {
        db::chunks::remove_association(&pool, chunk_1.id, assoc.backend_id, chunk_1.size)
            .await
            .unwrap();
    }
    assert_eq!(db::chunks::replica_count(&pool, chunk_1.id).await.unwrap(), 1);

    let reconciler = Reconciler::new(pool.clone(), 2, "stratafs", 24 * 60 * 60);
    let report = reconciler.run(&handles, false, false).await.unwrap();
    assert!(report.replicas_created >= 1);

    assert_eq!(db::chunks::replica_count(&pool, chunk_1.id).await.unwrap(), 2);

    let new_associations = db::chunks::get_backends_for_chunk(&pool, chunk_1.id).await.unwrap();
    for assoc in &new_associations {
        let seeded_backend = seeded
            .iter()
            .find(|s| s.handle.backend.id == assoc.backend_id)
            .unwrap();
        let key = stratafs::storage::upload::object_key(chunk_1.file_id, chunk_1.chunk_number);
        let data = seeded_backend.client.get_object("stratafs", &key).await.unwrap();
        assert_eq!(stratafs::storage::chunker::checksum_of(&data), chunk_1.checksum);
    }

    Ok(())
}

/// S6: an overloaded backend's single-replica chunks are copied (not
/// moved) toward underloaded backends during a balance pass.
#[sqlx::test]
async fn s6_load_balance_copies_single_replica_chunks(pool: PgPool) -> sqlx::Result<()> {
    let seeded = seed_backends(&pool, 3).await;
    let handles = handles(&seeded);
    let owner = Uuid::new_v4();

    let uploader = UploadCoordinator::new(pool.clone(), 1, "stratafs");
    for i in 0..5 {
        let payload = Bytes::from(format!("unique-payload-{i}").into_bytes());
        uploader
            .upload(
                &format!("f{i}.bin"),
                owner,
                payload,
                1024,
                std::slice::from_ref(&handles[0]),
            )
            .await
            .unwrap();
    }

    let health = stratafs::storage::HealthMonitor::new(pool.clone(), &test_config());
    health.sweep_metrics(&handles).await.unwrap();

    let backends = backends_db::list_backends(&pool).await.unwrap();
    let overloaded = backends
        .iter()
        .find(|b| b.id == seeded[0].handle.backend.id)
        .unwrap();
    assert_eq!(overloaded.load, 5);

    let reconciler = Reconciler::new(pool.clone(), 1, "stratafs", 24 * 60 * 60);
    let report = reconciler.run(&handles, true, false).await.unwrap();

    // Every chunk here has exactly one replica, so a balance pass that
    // moves any of them must go through the copy path, never the move path.
    assert_eq!(report.chunks_migrated, 0);
    assert!(report.chunks_copied_for_balance > 0);

    Ok(())
}

fn test_config() -> stratafs::config::Config {
    stratafs::config::Config {
        database_url: String::new(),
        chunk_size: CHUNK_SIZE,
        min_replicas: 1,
        cache_dir: "./data/cache".into(),
        backend_call_timeout_ms: 5000,
        health_probe_interval_ms: 1000,
        health_failure_threshold: 1,
        metrics_sweep_interval_ms: 15 * 60 * 1000,
        auto_recover_after_secs: 15 * 60,
        long_offline_threshold_secs: 24 * 60 * 60,
        primary_bucket: "stratafs".into(),
        fallback_buckets: vec![],
    }
}
