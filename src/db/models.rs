//! Database models for the storage coordinator's metadata store.
//!
//! These structs map directly to the schema in `./migrations` and carry the
//! invariants: Backend load/storage_usage, File size, Chunk
//! content-addressing, and the Chunk<->Backend weak association.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A Backend (a.k.a. node): a single S3-compatible object-storage endpoint.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Backend {
    pub id: Uuid,
    pub url: String,
    pub status: BackendStatus,
    /// Chunk associations currently pointing at this backend.
    pub load: i64,
    pub storage_usage: i64,
    pub max_capacity: i64,
    pub last_check: Option<DateTime<Utc>>,
    pub last_latency_ms: Option<i64>,
    pub consecutive_failures: i32,
    pub failed_at: Option<DateTime<Utc>>,
    pub recovered_at: Option<DateTime<Utc>>,
}

impl Backend {
    pub fn is_online(&self) -> bool {
        matches!(self.status, BackendStatus::Online)
    }

    /// Fraction of `max_capacity` currently used, for operator visibility.
    pub fn capacity_used_percent(&self) -> f64 {
        if self.max_capacity <= 0 {
            return 0.0;
        }
        (self.storage_usage as f64 / self.max_capacity as f64) * 100.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum BackendStatus {
    Online,
    Offline,
}

/// A File: immutable after creation except for deletion.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct File {
    pub id: Uuid,
    pub name: String,
    pub size: i64,
    pub owner: Uuid,
    pub upload_time: DateTime<Utc>,
    /// Caching heuristic bookkeeping.
    pub access_count: i64,
    pub last_access_time: Option<DateTime<Utc>>,
}

/// A Chunk: a content-addressed, 0-indexed byte range of a File.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Chunk {
    pub id: Uuid,
    pub file_id: Uuid,
    pub chunk_number: i32,
    pub checksum: String,
    pub size: i64,
}

/// A Chunk<->Backend association row: a physical replica.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ChunkBackend {
    pub chunk_id: Uuid,
    pub backend_id: Uuid,
}
