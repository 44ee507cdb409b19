//! Upload coordination: chunk, deduplicate, place, and commit.

use super::backend_client::BackendClient;
use super::chunker::{chunk_fixed_size, PlannedChunk};
use super::placement::select_targets;
use crate::db::models::{Backend, File};
use crate::db::{chunks as chunks_db, files as files_db, DbPool};
use crate::error::UploadError;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// One S3-compatible node paired with the client used to talk to it.
#[derive(Clone)]
pub struct BackendHandle {
    pub backend: Backend,
    pub client: Arc<dyn BackendClient>,
}

pub struct UploadCoordinator {
    pool: DbPool,
    min_replicas: usize,
    bucket: String,
}

impl UploadCoordinator {
    pub fn new(pool: DbPool, min_replicas: usize, bucket: impl Into<String>) -> Self {
        Self {
            pool,
            min_replicas,
            bucket: bucket.into(),
        }
    }

    /// Ingests a complete in-memory byte stream. Bounded uploads only: no
    /// chunked transfer decoding happens in this layer. Empty input produces
    /// a File with zero Chunk rows. If any chunk can't reach
    /// `min_replicas`, the whole upload is rolled back: the File row is
    /// deleted (cascading its Chunk rows) and any objects already written
    /// for this file are best-effort cleaned up.
    pub async fn upload(
        &self,
        name: &str,
        owner: Uuid,
        data: Bytes,
        chunk_size: usize,
        handles: &[BackendHandle],
    ) -> Result<File, UploadError> {
        let planned = chunk_fixed_size(data.clone(), chunk_size)
            .map_err(|_| UploadError::NoBackends)?;

        let file = files_db::create_file(&self.pool, name, data.len() as i64, owner)
            .await
            .map_err(|e| UploadError::Store(crate::error::StoreError::Invariant(e.to_string())))?;

        for planned_chunk in &planned {
            if let Err(err) = self.place_chunk(file.id, planned_chunk, handles).await {
                tracing::error!(file_id = %file.id, chunk_number = planned_chunk.chunk_number, %err, "upload shortfall, rolling back");
                self.rollback(&file, &planned, handles).await;
                return Err(err);
            }
        }

        Ok(file)
    }

    /// Best-effort cleanup after a shortfall: deletes the File row (cascading
    /// its Chunk rows) and attempts to delete any objects already written
    /// under this file's chunk keys. Object deletion failures are not fatal
    /// — an orphaned object is cleaned up by a later reconcile pass.
    async fn rollback(&self, file: &File, planned: &[PlannedChunk], handles: &[BackendHandle]) {
        for planned_chunk in planned {
            let key = object_key(file.id, planned_chunk.chunk_number);
            for handle in handles {
                let _ = handle.client.delete_object(&self.bucket, &key).await;
            }
        }
        if let Err(err) = files_db::delete_file(&self.pool, file.id).await {
            tracing::warn!(file_id = %file.id, %err, "rollback: failed to delete file row");
        }
    }

    /// Places one chunk: attempts dedup reuse first, then writes fresh
    /// replicas up to `min_replicas`.
    async fn place_chunk(
        &self,
        file_id: Uuid,
        planned: &PlannedChunk,
        handles: &[BackendHandle],
    ) -> Result<(), UploadError> {
        let chunk = chunks_db::insert_chunk(
            &self.pool,
            file_id,
            planned.chunk_number,
            &planned.checksum,
            planned.size,
        )
        .await
        .map_err(|e| UploadError::Store(crate::error::StoreError::Invariant(e.to_string())))?;

        let mut reused: Vec<Uuid> = Vec::new();
        if let Ok(existing) =
            chunks_db::find_chunks_by_content(&self.pool, &planned.checksum, planned.size).await
        {
            reused = self
                .verify_and_reuse(&chunk, &existing, planned, handles)
                .await;
        }

        let have = reused.len();
        if have > 0 {
            tracing::debug!(
                chunk_number = planned.chunk_number,
                reused = have,
                "deduplicated chunk onto existing replicas"
            );
        }
        if have < self.min_replicas {
            self.write_fresh_replicas(&chunk, planned, handles, &reused, self.min_replicas - have)
                .await?;
        }

        let final_count = chunks_db::replica_count(&self.pool, chunk.id)
            .await
            .unwrap_or(0);
        if (final_count as usize) < self.min_replicas {
            tracing::error!(
                chunk_number = planned.chunk_number,
                final_count,
                min_replicas = self.min_replicas,
                "chunk fell short of the minimum replica count"
            );
            return Err(UploadError::ChunkReplicationShortfall(planned.chunk_number));
        }

        Ok(())
    }

    /// Deduplication: for every other Chunk row sharing this content
    /// address, re-verify each of its backend associations is actually
    /// online and actually holds the object — at that chunk's own key —
    /// before trusting it; stale metadata is never trusted blindly. A
    /// verified source is copied into this chunk's own key on the same
    /// backend, since each chunk's physical object always lives at its own
    /// `<file_id>/<chunk_number>` key.
    async fn verify_and_reuse(
        &self,
        new_chunk: &crate::db::models::Chunk,
        existing_chunks: &[crate::db::models::Chunk],
        planned: &PlannedChunk,
        handles: &[BackendHandle],
    ) -> Vec<Uuid> {
        let handle_by_id: HashMap<Uuid, &BackendHandle> =
            handles.iter().map(|h| (h.backend.id, h)).collect();
        let mut reused = Vec::new();
        let new_key = object_key(new_chunk.file_id, new_chunk.chunk_number);

        for existing in existing_chunks {
            if existing.id == new_chunk.id {
                continue;
            }
            let Ok(associations) = chunks_db::get_backends_for_chunk(&self.pool, existing.id).await
            else {
                continue;
            };
            let source_key = object_key(existing.file_id, existing.chunk_number);

            for assoc in associations {
                let Some(handle) = handle_by_id.get(&assoc.backend_id) else {
                    continue;
                };
                if !handle.backend.is_online() {
                    continue;
                }

                match handle.client.head_object(&self.bucket, &source_key).await {
                    Ok(Some(size)) if size == planned.size => {}
                    _ => continue,
                }

                let Ok(data) = handle.client.get_object(&self.bucket, &source_key).await else {
                    continue;
                };
                if crate::storage::chunker::checksum_of(&data) != planned.checksum {
                    continue;
                }
                if handle
                    .client
                    .put_object(&self.bucket, &new_key, data)
                    .await
                    .is_err()
                {
                    continue;
                }

                if chunks_db::add_association(&self.pool, new_chunk.id, assoc.backend_id, planned.size)
                    .await
                    .is_ok()
                {
                    reused.push(assoc.backend_id);
                }
            }
        }

        reused
    }

    async fn write_fresh_replicas(
        &self,
        chunk: &crate::db::models::Chunk,
        planned: &PlannedChunk,
        handles: &[BackendHandle],
        already_on: &[Uuid],
        needed: usize,
    ) -> Result<(), UploadError> {
        let backends: Vec<Backend> = handles.iter().map(|h| h.backend.clone()).collect();
        let targets = select_targets(&backends, needed, already_on)
            .map_err(|_| UploadError::NoBackends)?;

        let handle_by_id: HashMap<Uuid, &BackendHandle> =
            handles.iter().map(|h| (h.backend.id, h)).collect();
        let key = object_key(chunk.file_id, chunk.chunk_number);

        for target in targets {
            let Some(handle) = handle_by_id.get(&target.id) else {
                continue;
            };

            if handle
                .client
                .put_object(&self.bucket, &key, planned.data.clone())
                .await
                .is_err()
            {
                continue;
            }

            match handle.client.head_object(&self.bucket, &key).await {
                Ok(Some(size)) if size == planned.size => {}
                _ => {
                    tracing::warn!(backend_id = %target.id, chunk_number = planned.chunk_number, "post-write verification failed, skipping replica");
                    continue;
                }
            }

            let _ = chunks_db::add_association(&self.pool, chunk.id, target.id, planned.size).await;
        }

        Ok(())
    }
}

/// Object key for one chunk on any backend: `<file_id>/<chunk_number>`.
/// Every replica of a chunk — whether written fresh or copied in via
/// dedup reuse — lives under this same key.
pub fn object_key(file_id: Uuid, chunk_number: i32) -> String {
    format!("{file_id}/{chunk_number}")
}
