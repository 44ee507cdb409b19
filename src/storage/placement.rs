//! Load-aware placement policy.

use crate::db::models::Backend;
use crate::error::PlacementError;
use std::time::Instant;

/// Picks `count` distinct online backends, ascending by current `load`,
/// excluding anything in `exclude`. Ties break on backend id for
/// determinism. Returns fewer than `count` backends if fewer are online —
/// callers decide whether that's a shortfall.
pub fn select_targets(
    candidates: &[Backend],
    count: usize,
    exclude: &[uuid::Uuid],
) -> Result<Vec<Backend>, PlacementError> {
    let mut online: Vec<&Backend> = candidates
        .iter()
        .filter(|b| b.is_online() && !exclude.contains(&b.id))
        .collect();

    if online.is_empty() {
        return Err(PlacementError::NoBackends);
    }

    online.sort_by(|a, b| a.load.cmp(&b.load).then(a.id.cmp(&b.id)));
    Ok(online.into_iter().take(count).cloned().collect())
}

/// Probes each candidate backend's round-trip latency (via `list_buckets`,
/// the cheapest call every backend supports) and returns the fastest
/// responder. Falls back to the first candidate if every probe fails, since
/// a download must still attempt something.
pub async fn nearest(
    candidates: &[(Backend, std::sync::Arc<dyn crate::storage::backend_client::BackendClient>)],
) -> Option<Backend> {
    if candidates.is_empty() {
        return None;
    }

    let mut best: Option<(Backend, std::time::Duration)> = None;

    for (backend, client) in candidates {
        let start = Instant::now();
        if client.list_buckets().await.is_ok() {
            let elapsed = start.elapsed();
            if best.as_ref().map_or(true, |(_, d)| elapsed < *d) {
                best = Some((backend.clone(), elapsed));
            }
        }
    }

    best.map(|(backend, _)| backend)
        .or_else(|| candidates.first().map(|(b, _)| b.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::BackendStatus;
    use chrono::Utc;
    use uuid::Uuid;

    fn backend(load: i64, status: BackendStatus) -> Backend {
        Backend {
            id: Uuid::new_v4(),
            url: "http://example".into(),
            status,
            load,
            storage_usage: 0,
            max_capacity: 0,
            last_check: Some(Utc::now()),
            last_latency_ms: None,
            consecutive_failures: 0,
            failed_at: None,
            recovered_at: None,
        }
    }

    #[test]
    fn selects_ascending_by_load() {
        let a = backend(5, BackendStatus::Online);
        let b = backend(1, BackendStatus::Online);
        let c = backend(3, BackendStatus::Online);
        let picked = select_targets(&[a.clone(), b.clone(), c.clone()], 2, &[]).unwrap();
        assert_eq!(picked[0].id, b.id);
        assert_eq!(picked[1].id, c.id);
    }

    #[test]
    fn skips_offline_backends() {
        let online = backend(1, BackendStatus::Online);
        let offline = backend(0, BackendStatus::Offline);
        let picked = select_targets(&[online.clone(), offline], 2, &[]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, online.id);
    }

    #[test]
    fn no_online_backends_errors() {
        let offline = backend(0, BackendStatus::Offline);
        assert!(select_targets(&[offline], 1, &[]).is_err());
    }

    #[test]
    fn excluded_backends_are_skipped() {
        let a = backend(1, BackendStatus::Online);
        let b = backend(2, BackendStatus::Online);
        let picked = select_targets(&[a.clone(), b.clone()], 2, &[a.id]).unwrap();
        assert_eq!(picked.len(), 1);
        assert_eq!(picked[0].id, b.id);
    }
}
