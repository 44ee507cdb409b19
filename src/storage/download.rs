//! Reconstruction with latency-based source selection and failover.

use super::backend_client::BackendClient;
use super::cache::{is_disk_cache_candidate, ChunkCache, DiskCache};
use super::placement::nearest;
use super::upload::{object_key, BackendHandle};
use crate::db::models::{Backend, Chunk};
use crate::db::{backends as backends_db, chunks as chunks_db, files as files_db, DbPool};
use crate::error::DownloadError;
use async_stream::try_stream;
use bytes::Bytes;
use futures::Stream;
use std::sync::Arc;
use uuid::Uuid;

pub struct DownloadCoordinator {
    pool: DbPool,
    bucket: String,
    fallback_buckets: Vec<String>,
    disk_cache: Arc<DiskCache>,
    chunk_cache: Arc<ChunkCache>,
}

impl DownloadCoordinator {
    pub fn new(
        pool: DbPool,
        bucket: impl Into<String>,
        fallback_buckets: Vec<String>,
        disk_cache: Arc<DiskCache>,
        chunk_cache: Arc<ChunkCache>,
    ) -> Self {
        Self {
            pool,
            bucket: bucket.into(),
            fallback_buckets,
            disk_cache,
            chunk_cache,
        }
    }

    /// Streams a file's bytes chunk by chunk, buffering at most one chunk at
    /// a time. A whole-file disk cache hit short-circuits straight to a
    /// single yield; otherwise each chunk is served from the in-memory chunk
    /// cache when present, and fetched (with failover) when not. Every read
    /// bumps the File's access bookkeeping, and the reconstructed bytes are
    /// written into the disk cache afterward if they qualify.
    pub fn download<'a>(
        &'a self,
        file_id: Uuid,
        handles: &'a [BackendHandle],
    ) -> impl Stream<Item = Result<Bytes, DownloadError>> + 'a {
        try_stream! {
            let file = files_db::get_file(&self.pool, file_id)
                .await
                .map_err(|e| DownloadError::Store(crate::error::StoreError::Invariant(e.to_string())))?
                .ok_or(DownloadError::NotFound(file_id))?;

            if let Some(cached) = self.disk_cache.get(file_id) {
                let _ = files_db::record_access(&self.pool, file_id).await;
                yield cached;
                return;
            }

            let chunks = chunks_db::get_chunks_for_file(&self.pool, file_id)
                .await
                .map_err(|e| DownloadError::Store(crate::error::StoreError::Invariant(e.to_string())))?;

            let mut buffer = Vec::with_capacity(file.size.max(0) as usize);

            for chunk in &chunks {
                let data = match self.chunk_cache.get(chunk.id) {
                    Some(cached) => cached,
                    None => {
                        let fetched = self.fetch_chunk(chunk, handles).await?;
                        self.chunk_cache.put(chunk.id, fetched.clone());
                        fetched
                    }
                };
                buffer.extend_from_slice(&data);
                yield data;
            }

            let _ = files_db::record_access(&self.pool, file_id).await;
            let access_count = file.access_count + 1;
            if is_disk_cache_candidate(file.size, access_count, Some(chrono::Utc::now())) {
                let _ = self.disk_cache.put(file_id, &buffer);
            }
        }
    }

    /// Fetches and verifies one chunk's bytes, trying in order: this
    /// chunk's own online replicas (nearest-probed first), then other
    /// Chunks sharing the same `(checksum, size)` at their own keys (also
    /// online-only), then every offline candidate from either set as a last
    /// resort, then the configured fallback buckets. Every candidate read is
    /// SHA-256-verified against `chunk.checksum`; a mismatch is treated the
    /// same as the key being absent and the cascade continues.
    async fn fetch_chunk(
        &self,
        chunk: &Chunk,
        handles: &[BackendHandle],
    ) -> Result<Bytes, DownloadError> {
        let mut online: Vec<(String, Backend, Arc<dyn BackendClient>)> = Vec::new();
        let mut offline: Vec<(String, Backend, Arc<dyn BackendClient>)> = Vec::new();

        self.collect_candidates(chunk, handles, &mut online, &mut offline)
            .await?;

        if let Ok(alt_chunks) =
            chunks_db::find_chunks_by_content(&self.pool, &chunk.checksum, chunk.size).await
        {
            for alt in alt_chunks.iter().filter(|c| c.id != chunk.id) {
                self.collect_candidates(alt, handles, &mut online, &mut offline)
                    .await?;
            }
        }

        if online.is_empty() && offline.is_empty() {
            return Err(DownloadError::ChunkIrrecoverable(chunk.chunk_number));
        }

        let projected: Vec<(Backend, Arc<dyn BackendClient>)> =
            online.iter().map(|(_, b, c)| (b.clone(), c.clone())).collect();
        if let Some(fastest) = nearest(&projected).await {
            online.sort_by_key(|(_, b, _)| if b.id == fastest.id { 0 } else { 1 });
        }

        for (key, backend, client) in &online {
            match client.get_object(&self.bucket, key).await {
                Ok(bytes) if crate::storage::chunker::checksum_of(&bytes) == chunk.checksum => {
                    return Ok(bytes);
                }
                Ok(_) => {
                    tracing::warn!(backend_id = %backend.id, chunk_number = chunk.chunk_number, "checksum mismatch, skipping replica");
                }
                Err(_) => {
                    tracing::warn!(backend_id = %backend.id, chunk_number = chunk.chunk_number, "replica unreachable, failing over");
                }
            }
        }

        // Every online candidate failed: fall back to offline backends as a
        // last resort, since an offline mark can be a false positive.
        for (key, backend, client) in &offline {
            if let Ok(bytes) = client.get_object(&self.bucket, key).await {
                if crate::storage::chunker::checksum_of(&bytes) == chunk.checksum {
                    tracing::info!(backend_id = %backend.id, chunk_number = chunk.chunk_number, "passive recovery on successful read");
                    let _ = backends_db::mark_online_passive(&self.pool, backend.id).await;
                    return Ok(bytes);
                }
            }
        }

        // Primary bucket exhausted across every candidate: cascade through
        // fallback buckets before declaring the chunk unrecoverable.
        for fallback_bucket in &self.fallback_buckets {
            for (key, _, client) in online.iter().chain(offline.iter()) {
                if let Ok(bytes) = client.get_object(fallback_bucket, key).await {
                    if crate::storage::chunker::checksum_of(&bytes) == chunk.checksum {
                        tracing::warn!(chunk_number = chunk.chunk_number, bucket = %fallback_bucket, "served from fallback bucket");
                        return Ok(bytes);
                    }
                }
            }
        }

        tracing::error!(chunk_number = chunk.chunk_number, "chunk irrecoverable: all replicas and fallback buckets exhausted");
        Err(DownloadError::ChunkIrrecoverable(chunk.chunk_number))
    }

    /// Appends every backend handle associated with `source` (keyed under
    /// `source`'s own `<file_id>/<chunk_number>` key) into the online/offline
    /// candidate lists.
    async fn collect_candidates(
        &self,
        source: &Chunk,
        handles: &[BackendHandle],
        online: &mut Vec<(String, Backend, Arc<dyn BackendClient>)>,
        offline: &mut Vec<(String, Backend, Arc<dyn BackendClient>)>,
    ) -> Result<(), DownloadError> {
        let associations = chunks_db::get_backends_for_chunk(&self.pool, source.id)
            .await
            .map_err(|e| DownloadError::Store(crate::error::StoreError::Invariant(e.to_string())))?;
        let key = object_key(source.file_id, source.chunk_number);

        for handle in handles {
            if !associations.iter().any(|a| a.backend_id == handle.backend.id) {
                continue;
            }
            let entry = (key.clone(), handle.backend.clone(), handle.client.clone());
            if handle.backend.is_online() {
                online.push(entry);
            } else {
                offline.push(entry);
            }
        }

        Ok(())
    }
}
