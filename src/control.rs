//! Minimal control plane: the small set of administrative
//! operations this crate exposes, independent of whatever outer surface
//! (CLI, RPC, HTTP) ends up calling them. Long-running operations are
//! tracked in an in-process task registry so a caller can poll progress
//! without blocking on the call that started them.

use crate::config::Config;
use crate::db::models::Backend;
use crate::db::{backends as backends_db, DbPool};
use crate::storage::reconciler::ReconcileReport;
use crate::storage::{BackendHandle, HealthMonitor, Reconciler};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed { summary: serde_json::Value },
    Failed { error: String },
}

/// In-process, UUID-keyed registry of control-plane operations. Not
/// persisted: a process restart forgets every task, which is acceptable
/// since every operation here is safe to simply re-run.
#[derive(Default)]
pub struct TaskRegistry {
    tasks: RwLock<HashMap<Uuid, TaskState>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.tasks.write().await.insert(id, TaskState::Pending);
        id
    }

    pub async fn set_running(&self, id: Uuid) {
        self.tasks.write().await.insert(id, TaskState::Running);
    }

    pub async fn set_completed(&self, id: Uuid, summary: serde_json::Value) {
        self.tasks
            .write()
            .await
            .insert(id, TaskState::Completed { summary });
    }

    pub async fn set_failed(&self, id: Uuid, error: String) {
        self.tasks.write().await.insert(id, TaskState::Failed { error });
    }

    pub async fn get(&self, id: Uuid) -> Option<TaskState> {
        self.tasks.read().await.get(&id).cloned()
    }
}

pub struct ControlPlane {
    pool: DbPool,
    config: Config,
    pub tasks: Arc<TaskRegistry>,
}

impl ControlPlane {
    pub fn new(pool: DbPool, config: Config) -> Self {
        Self {
            pool,
            config,
            tasks: Arc::new(TaskRegistry::new()),
        }
    }

    pub async fn list_backends(&self) -> anyhow::Result<Vec<Backend>> {
        backends_db::list_backends(&self.pool).await
    }

    pub async fn register_backend(&self, url: &str) -> anyhow::Result<Backend> {
        backends_db::create_backend(&self.pool, url).await
    }

    /// Administrative mark-offline: suppresses auto-recovery until an
    /// explicit mark-online.
    pub async fn mark_offline(&self, backend_id: Uuid) -> anyhow::Result<Backend> {
        tracing::info!(%backend_id, "administrative mark-offline");
        backends_db::mark_offline_administrative(&self.pool, backend_id).await
    }

    /// Administrative mark-online: only transitions after a successful
    /// probe against the backend, mirroring `mark_node_as_online`.
    pub async fn mark_online(&self, handle: &BackendHandle) -> anyhow::Result<Backend> {
        handle
            .client
            .list_buckets()
            .await
            .map_err(|e| anyhow::anyhow!("probe failed, refusing to mark online: {e}"))?;
        tracing::info!(backend_id = %handle.backend.id, "administrative mark-online");
        backends_db::mark_online_administrative(&self.pool, handle.backend.id).await
    }

    pub async fn stats(&self) -> anyhow::Result<crate::db::Stats> {
        crate::db::get_stats(&self.pool).await
    }

    pub async fn health_sweep(&self, handles: &[BackendHandle]) -> anyhow::Result<serde_json::Value> {
        let monitor = HealthMonitor::new(self.pool.clone(), &self.config);
        let outcomes = monitor.check_all(handles).await?;
        Ok(serde_json::to_value(outcomes)?)
    }

    pub async fn metrics_sweep(&self, handles: &[BackendHandle]) -> anyhow::Result<()> {
        let monitor = HealthMonitor::new(self.pool.clone(), &self.config);
        monitor.sweep_metrics(handles).await
    }

    pub async fn reconcile(
        &self,
        handles: &[BackendHandle],
        balance_load: bool,
        dry_run: bool,
    ) -> anyhow::Result<ReconcileReport> {
        let reconciler = Reconciler::new(
            self.pool.clone(),
            self.config.min_replicas as i64,
            self.config.primary_bucket.clone(),
            self.config.long_offline_threshold_secs,
        );
        reconciler.run(handles, balance_load, dry_run).await
    }

    /// Runs `reconcile` in the background and tracks it in the task
    /// registry, returning immediately with the task id.
    pub async fn spawn_reconcile(
        self: &Arc<Self>,
        handles: Vec<BackendHandle>,
        balance_load: bool,
        dry_run: bool,
    ) -> Uuid {
        let id = self.tasks.create().await;
        let control = self.clone();
        let tasks = self.tasks.clone();

        tokio::spawn(async move {
            tasks.set_running(id).await;

            match control.reconcile(&handles, balance_load, dry_run).await {
                Ok(report) => {
                    let summary = serde_json::to_value(report).unwrap_or(serde_json::json!({}));
                    tasks.set_completed(id, summary).await;
                }
                Err(err) => tasks.set_failed(id, err.to_string()).await,
            }
        });

        id
    }
}
