//! Two-tier cache: a whole-file disk cache plus a per-chunk in-memory
//! cache, writing to disk through the same sharded, atomic-rename path
//! a blob store uses.

use bytes::Bytes;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use uuid::Uuid;

const DISK_CACHE_SIZE_LIMIT: i64 = 100 * 1024 * 1024; // 100 MiB
const DISK_CACHE_MIN_ACCESS_COUNT: i64 = 3;
const DISK_CACHE_RECENT_WINDOW: chrono::Duration = chrono::Duration::hours(24);
const CHUNK_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Whether a File is a candidate for the whole-file disk cache: under the
/// size limit, and either accessed often or accessed recently.
pub fn is_disk_cache_candidate(
    size: i64,
    access_count: i64,
    last_access_time: Option<chrono::DateTime<chrono::Utc>>,
) -> bool {
    if size >= DISK_CACHE_SIZE_LIMIT {
        return false;
    }

    let accessed_recently = last_access_time
        .map(|t| chrono::Utc::now() - t < DISK_CACHE_RECENT_WINDOW)
        .unwrap_or(false);

    access_count >= DISK_CACHE_MIN_ACCESS_COUNT || accessed_recently
}

/// Cache hit rate as exposed by the control plane: the first access that
/// populates the cache doesn't count as a hit.
pub fn hit_rate(access_count: i64) -> f64 {
    if access_count <= 0 {
        return 0.0;
    }
    (access_count - 1).max(0) as f64 / access_count as f64
}

/// Whole-file disk cache. Sharded by the first two characters of the file
/// id to avoid overloading a single directory, written atomically via a
/// temp-file rename.
pub struct DiskCache {
    base_path: PathBuf,
}

impl DiskCache {
    pub fn new(base_path: impl AsRef<Path>) -> std::io::Result<Self> {
        let base_path = base_path.as_ref().to_path_buf();
        fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    fn path_for(&self, file_id: Uuid) -> PathBuf {
        let id = file_id.simple().to_string();
        self.base_path.join(&id[..2]).join(id)
    }

    pub fn get(&self, file_id: Uuid) -> Option<Bytes> {
        let hit = fs::read(self.path_for(file_id)).ok().map(Bytes::from);
        tracing::debug!(%file_id, hit = hit.is_some(), "disk cache lookup");
        hit
    }

    pub fn put(&self, file_id: Uuid, data: &[u8]) -> std::io::Result<()> {
        let path = self.path_for(file_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &path)?;
        tracing::debug!(%file_id, len = data.len(), "wrote file to disk cache");
        Ok(())
    }

    pub fn evict(&self, file_id: Uuid) -> std::io::Result<()> {
        let path = self.path_for(file_id);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Per-chunk in-memory cache with a 24h TTL per entry.
#[derive(Default)]
pub struct ChunkCache {
    entries: Mutex<HashMap<Uuid, (Bytes, Instant)>>,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, chunk_id: Uuid) -> Option<Bytes> {
        let mut entries = self.entries.lock().unwrap();
        let result = match entries.get(&chunk_id) {
            Some((data, inserted_at)) if inserted_at.elapsed() < CHUNK_CACHE_TTL => {
                Some(data.clone())
            }
            Some(_) => {
                entries.remove(&chunk_id);
                None
            }
            None => None,
        };
        tracing::debug!(%chunk_id, hit = result.is_some(), "chunk cache lookup");
        result
    }

    pub fn put(&self, chunk_id: Uuid, data: Bytes) {
        self.entries
            .lock()
            .unwrap()
            .insert(chunk_id, (data, Instant::now()));
    }

    pub fn evict_expired(&self) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < CHUNK_CACHE_TTL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_cache_candidate_by_access_count() {
        assert!(is_disk_cache_candidate(1024, 3, None));
        assert!(!is_disk_cache_candidate(1024, 2, None));
    }

    #[test]
    fn disk_cache_candidate_by_recency() {
        assert!(is_disk_cache_candidate(1024, 0, Some(chrono::Utc::now())));
        let stale = chrono::Utc::now() - chrono::Duration::hours(25);
        assert!(!is_disk_cache_candidate(1024, 0, Some(stale)));
    }

    #[test]
    fn disk_cache_excludes_large_files() {
        assert!(!is_disk_cache_candidate(200 * 1024 * 1024, 100, None));
    }

    #[test]
    fn hit_rate_excludes_first_access() {
        assert_eq!(hit_rate(1), 0.0);
        assert_eq!(hit_rate(2), 0.5);
        assert_eq!(hit_rate(4), 0.75);
    }

    #[test]
    fn disk_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = DiskCache::new(dir.path()).unwrap();
        let id = Uuid::new_v4();
        assert!(cache.get(id).is_none());
        cache.put(id, b"hello").unwrap();
        assert_eq!(cache.get(id).unwrap(), Bytes::from_static(b"hello"));
        cache.evict(id).unwrap();
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn chunk_cache_roundtrip() {
        let cache = ChunkCache::new();
        let id = Uuid::new_v4();
        assert!(cache.get(id).is_none());
        cache.put(id, Bytes::from_static(b"data"));
        assert_eq!(cache.get(id).unwrap(), Bytes::from_static(b"data"));
    }
}
