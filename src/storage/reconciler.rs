//! Background reconciler: replica top-up, load balancing across backends,
//! and evacuation of long-offline nodes.

use super::placement::select_targets;
use super::upload::{object_key, BackendHandle};
use crate::db::backends as backends_db;
use crate::db::chunks as chunks_db;
use crate::db::models::Backend;
use crate::db::DbPool;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

pub struct Reconciler {
    pool: DbPool,
    min_replicas: i64,
    bucket: String,
    long_offline_threshold_secs: i64,
}

#[derive(Debug, Default, Serialize)]
pub struct ReconcileReport {
    pub replicas_created: u64,
    pub chunks_still_short: u64,
    pub chunks_migrated: u64,
    pub chunks_copied_for_balance: u64,
    pub chunks_evacuated: u64,
    pub dry_run: bool,
}

impl Reconciler {
    pub fn new(
        pool: DbPool,
        min_replicas: i64,
        bucket: impl Into<String>,
        long_offline_threshold_secs: i64,
    ) -> Self {
        Self {
            pool,
            min_replicas,
            bucket: bucket.into(),
            long_offline_threshold_secs,
        }
    }

    /// Runs all three passes in sequence: top-up, then load balance, then
    /// long-offline evacuation. Every pass is idempotent — running twice in
    /// a row with no intervening activity produces a zeroed-out report the
    /// second time.
    pub async fn run(
        &self,
        handles: &[BackendHandle],
        balance_load: bool,
        dry_run: bool,
    ) -> anyhow::Result<ReconcileReport> {
        let mut report = ReconcileReport {
            dry_run,
            ..Default::default()
        };

        self.top_up_replicas(handles, dry_run, &mut report).await?;

        if balance_load {
            self.balance_load(handles, dry_run, &mut report).await?;
        }

        self.evacuate_long_offline(handles, dry_run, &mut report).await?;

        tracing::info!(
            dry_run,
            replicas_created = report.replicas_created,
            chunks_still_short = report.chunks_still_short,
            chunks_migrated = report.chunks_migrated,
            chunks_copied_for_balance = report.chunks_copied_for_balance,
            chunks_evacuated = report.chunks_evacuated,
            "reconcile pass complete"
        );

        Ok(report)
    }

    /// Every chunk with at least one online replica but fewer than
    /// `min_replicas` gets copied to additional online backends, sorted
    /// ascending by load.
    async fn top_up_replicas(
        &self,
        handles: &[BackendHandle],
        dry_run: bool,
        report: &mut ReconcileReport,
    ) -> anyhow::Result<()> {
        let handle_by_id: HashMap<Uuid, &BackendHandle> =
            handles.iter().map(|h| (h.backend.id, h)).collect();
        let backends: Vec<Backend> = handles.iter().map(|h| h.backend.clone()).collect();

        let short = chunks_db::under_replicated_chunks(&self.pool, self.min_replicas).await?;

        for (chunk, current_count) in short {
            let associations = chunks_db::get_backends_for_chunk(&self.pool, chunk.id).await?;
            let source = associations
                .iter()
                .filter_map(|a| handle_by_id.get(&a.backend_id))
                .find(|h| h.backend.is_online());

            let Some(source) = source else {
                report.chunks_still_short += 1;
                continue;
            };

            let gap = (self.min_replicas - current_count).max(0) as usize;
            let existing_ids: Vec<Uuid> = associations.iter().map(|a| a.backend_id).collect();
            let Ok(targets) = select_targets(&backends, gap, &existing_ids) else {
                report.chunks_still_short += 1;
                continue;
            };

            if targets.len() < gap {
                report.chunks_still_short += 1;
            }

            if dry_run {
                report.replicas_created += targets.len() as u64;
                continue;
            }

            let key = object_key(chunk.file_id, chunk.chunk_number);
            let Ok(data) = source.client.get_object(&self.bucket, &key).await else {
                report.chunks_still_short += 1;
                continue;
            };
            if crate::storage::chunker::checksum_of(&data) != chunk.checksum {
                report.chunks_still_short += 1;
                continue;
            }

            for target in targets {
                let Some(target_handle) = handle_by_id.get(&target.id) else {
                    continue;
                };
                if target_handle
                    .client
                    .put_object(&self.bucket, &key, data.clone())
                    .await
                    .is_ok()
                {
                    chunks_db::add_association(&self.pool, chunk.id, target.id, chunk.size).await?;
                    report.replicas_created += 1;
                }
            }
        }

        Ok(())
    }

    /// Moves chunks off overloaded backends (> 1.2x average load) onto
    /// underloaded ones (< 0.8x average), ascending by chunk size.
    /// Single-replica chunks are copied, not moved, to avoid a window with
    /// zero replicas; multi-replica chunks drop their old association after
    /// the copy succeeds.
    async fn balance_load(
        &self,
        handles: &[BackendHandle],
        dry_run: bool,
        report: &mut ReconcileReport,
    ) -> anyhow::Result<()> {
        let handle_by_id: HashMap<Uuid, &BackendHandle> =
            handles.iter().map(|h| (h.backend.id, h)).collect();
        let online: Vec<Backend> = handles
            .iter()
            .map(|h| h.backend.clone())
            .filter(|b| b.is_online())
            .collect();

        if online.is_empty() {
            return Ok(());
        }

        let avg_load = online.iter().map(|b| b.load as f64).sum::<f64>() / online.len() as f64;
        let overloaded: Vec<&Backend> =
            online.iter().filter(|b| b.load as f64 > avg_load * 1.2).collect();
        let underloaded: Vec<Backend> = online
            .iter()
            .filter(|b| (b.load as f64) < avg_load * 0.8)
            .cloned()
            .collect();

        if overloaded.is_empty() || underloaded.is_empty() {
            return Ok(());
        }

        for source in overloaded {
            let source_chunks = chunks_db::chunks_with_only_backend(&self.pool, source.id).await?;
            let mut movable: Vec<_> = source_chunks
                .into_iter()
                .map(|c| (c.size, c))
                .collect();
            movable.sort_by_key(|(size, _)| *size);

            for (_, chunk) in movable {
                let associations = chunks_db::get_backends_for_chunk(&self.pool, chunk.id).await?;
                let existing_ids: Vec<Uuid> = associations.iter().map(|a| a.backend_id).collect();
                let Ok(targets) = select_targets(&underloaded, 1, &existing_ids) else {
                    continue;
                };
                let Some(target) = targets.into_iter().next() else {
                    continue;
                };

                if dry_run {
                    if associations.len() > 1 {
                        report.chunks_migrated += 1;
                    } else {
                        report.chunks_copied_for_balance += 1;
                    }
                    continue;
                }

                let Some(source_handle) = handle_by_id.get(&source.id) else {
                    continue;
                };
                let Some(target_handle) = handle_by_id.get(&target.id) else {
                    continue;
                };

                let key = object_key(chunk.file_id, chunk.chunk_number);
                let Ok(data) = source_handle.client.get_object(&self.bucket, &key).await else {
                    continue;
                };

                if target_handle
                    .client
                    .put_object(&self.bucket, &key, data)
                    .await
                    .is_err()
                {
                    continue;
                }

                chunks_db::add_association(&self.pool, chunk.id, target.id, chunk.size).await?;

                if associations.len() > 1 {
                    chunks_db::remove_association(&self.pool, chunk.id, source.id, chunk.size)
                        .await?;
                    report.chunks_migrated += 1;
                } else {
                    report.chunks_copied_for_balance += 1;
                }
            }
        }

        Ok(())
    }

    /// Backends offline past the long-offline threshold get their
    /// sole-copy chunks evacuated so every chunk keeps at least 2 online
    /// replicas. Meant to run on a daily cadence from an external scheduler.
    async fn evacuate_long_offline(
        &self,
        handles: &[BackendHandle],
        dry_run: bool,
        report: &mut ReconcileReport,
    ) -> anyhow::Result<()> {
        let handle_by_id: HashMap<Uuid, &BackendHandle> =
            handles.iter().map(|h| (h.backend.id, h)).collect();
        let backends: Vec<Backend> = handles.iter().map(|h| h.backend.clone()).collect();

        let cutoff =
            chrono::Utc::now() - chrono::Duration::seconds(self.long_offline_threshold_secs);
        let long_offline = backends_db::backends_offline_since(&self.pool, cutoff).await?;

        for offline_backend in long_offline {
            let chunks =
                chunks_db::chunks_with_only_backend(&self.pool, offline_backend.id).await?;

            for chunk in chunks {
                let associations = chunks_db::get_backends_for_chunk(&self.pool, chunk.id).await?;
                let online_replica_count = associations
                    .iter()
                    .filter(|a| {
                        handle_by_id
                            .get(&a.backend_id)
                            .map_or(false, |h| h.backend.is_online())
                    })
                    .count();

                if online_replica_count >= 2 {
                    continue;
                }

                let needed = 2 - online_replica_count;
                let existing_ids: Vec<Uuid> = associations.iter().map(|a| a.backend_id).collect();
                let Ok(targets) = select_targets(&backends, needed, &existing_ids) else {
                    continue;
                };

                if dry_run {
                    report.chunks_evacuated += targets.len() as u64;
                    continue;
                }

                let source = associations
                    .iter()
                    .filter_map(|a| handle_by_id.get(&a.backend_id))
                    .find(|h| h.backend.is_online());
                let Some(source) = source else { continue };

                let key = object_key(chunk.file_id, chunk.chunk_number);
                let Ok(data) = source.client.get_object(&self.bucket, &key).await else {
                    continue;
                };

                for target in targets {
                    let Some(target_handle) = handle_by_id.get(&target.id) else {
                        continue;
                    };
                    if target_handle
                        .client
                        .put_object(&self.bucket, &key, data.clone())
                        .await
                        .is_ok()
                    {
                        chunks_db::add_association(&self.pool, chunk.id, target.id, chunk.size)
                            .await?;
                        report.chunks_evacuated += 1;
                    }
                }
            }
        }

        Ok(())
    }
}
