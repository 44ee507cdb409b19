//! Health monitor state machine: tracks each backend's online/offline
//! status from probe outcomes and applies the recovery policy.

use super::upload::BackendHandle;
use crate::config::Config;
use crate::db::backends as backends_db;
use crate::db::models::Backend;
use crate::db::DbPool;
use crate::error::BackendError;
use chrono::{Duration as ChronoDuration, Utc};
use std::time::Instant;

pub struct HealthMonitor {
    pool: DbPool,
    threshold: u32,
    auto_recover_after_secs: i64,
    long_offline_threshold_secs: i64,
}

/// Outcome of probing one backend, surfaced for logging/control-plane summaries.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProbeOutcome {
    pub backend_id: uuid::Uuid,
    pub success: bool,
    pub latency_ms: i64,
    pub transitioned_offline: bool,
}

impl HealthMonitor {
    pub fn new(pool: DbPool, config: &Config) -> Self {
        Self {
            pool,
            threshold: config.health_failure_threshold,
            auto_recover_after_secs: config.auto_recover_after_secs,
            long_offline_threshold_secs: config.long_offline_threshold_secs,
        }
    }

    /// One pass over every backend: probe with `list_buckets`, classify the
    /// error if any, and apply the online/offline transition. Connectivity
    /// errors trip the breaker on the very first failure when `threshold <= 1`.
    pub async fn check_all(&self, handles: &[BackendHandle]) -> anyhow::Result<Vec<ProbeOutcome>> {
        let mut outcomes = Vec::with_capacity(handles.len());

        for handle in handles {
            if !self.eligible_for_probe(&handle.backend) {
                continue;
            }

            let start = Instant::now();
            let result = handle.client.list_buckets().await;
            let latency_ms = start.elapsed().as_millis() as i64;

            let (success, is_connectivity_error) = match &result {
                Ok(_) => (true, false),
                Err(err) => (false, classify(err)),
            };

            let was_online = handle.backend.is_online();
            let updated = backends_db::record_probe_result(
                &self.pool,
                handle.backend.id,
                success,
                latency_ms,
                is_connectivity_error,
                self.threshold,
            )
            .await?;

            if was_online && !updated.is_online() {
                tracing::warn!(backend_id = %handle.backend.id, latency_ms, "backend went offline");
            } else if !was_online && updated.is_online() {
                tracing::info!(backend_id = %handle.backend.id, "backend recovered");
            } else {
                tracing::debug!(backend_id = %handle.backend.id, success, latency_ms, "probed backend");
            }

            outcomes.push(ProbeOutcome {
                backend_id: handle.backend.id,
                success,
                latency_ms,
                transitioned_offline: !success && !updated.is_online(),
            });
        }

        Ok(outcomes)
    }

    /// A backend administratively marked offline with the sentinel failure
    /// count is skipped by the passive/automatic probe cycle; only an
    /// explicit mark-online control command clears it.
    fn eligible_for_probe(&self, backend: &Backend) -> bool {
        if backend.is_online() {
            return true;
        }
        if backend.consecutive_failures == crate::config::ADMIN_OFFLINE_SENTINEL {
            return false;
        }
        match backend.failed_at {
            Some(failed_at) => {
                Utc::now() - failed_at >= ChronoDuration::seconds(self.auto_recover_after_secs)
            }
            None => true,
        }
    }

    /// The 15-minute metrics sweep: recomputes `load`/`storage_usage` from
    /// the association table so any drift self-corrects.
    pub async fn sweep_metrics(&self, handles: &[BackendHandle]) -> anyhow::Result<()> {
        for handle in handles {
            let start = Instant::now();
            let latency_ms = if handle.client.list_buckets().await.is_ok() {
                start.elapsed().as_millis() as i64
            } else {
                -1
            };
            backends_db::recompute_metrics(&self.pool, handle.backend.id, latency_ms).await?;
        }
        Ok(())
    }

    /// Backends offline for at least `long_offline_threshold_secs`, the
    /// trigger condition for the reconciler's evacuation pass.
    pub async fn long_offline_backends(&self) -> anyhow::Result<Vec<Backend>> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.long_offline_threshold_secs);
        backends_db::backends_offline_since(&self.pool, cutoff).await
    }
}

fn classify(err: &BackendError) -> bool {
    BackendError::is_connectivity_class(&err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_classified() {
        let err = BackendError::Transient {
            backend: "b1".into(),
            op: "probe",
            source: anyhow::anyhow!("connection refused"),
        };
        assert!(classify(&err));
    }

    #[test]
    fn unrelated_errors_are_not_connectivity_class() {
        let err = BackendError::Transient {
            backend: "b1".into(),
            op: "probe",
            source: anyhow::anyhow!("access denied"),
        };
        assert!(!classify(&err));
    }
}
