//! Error taxonomy for the storage coordinator.
//!
//! Each component family gets its own `thiserror` enum so call sites match on
//! kind rather than string content. The one exception is connectivity-class
//! classification in the health monitor, which genuinely inspects error text
//! (see `BackendError::is_connectivity_class`).

use uuid::Uuid;

/// Errors surfaced by a `BackendClient` implementation.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient error on backend {backend} during {op}: {source}")]
    Transient {
        backend: String,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("key {key} not found on backend {backend}")]
    NotFound { backend: String, key: String },

    #[error("checksum mismatch reading chunk {chunk_id} from backend {backend}")]
    ChecksumMismatch { backend: String, chunk_id: Uuid },

    #[error("bucket could not be created or accessed on backend {backend}: {reason}")]
    ConfigError { backend: String, reason: String },
}

impl BackendError {
    /// Classifies a raw error message the way the health monitor does: a
    /// connectivity-class failure is one whose text mentions connect,
    /// connection, timeout, or endpoint trouble.
    pub fn is_connectivity_class(message: &str) -> bool {
        let lower = message.to_lowercase();
        ["connect", "connection", "timeout", "endpoint"]
            .iter()
            .any(|needle| lower.contains(needle))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChunkerError {
    #[error("chunk size must be positive")]
    InvalidChunkSize,
}

#[derive(Debug, thiserror::Error)]
pub enum PlacementError {
    #[error("no online backends available")]
    NoBackends,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no backends available to place chunks")]
    NoBackends,

    #[error("chunk {0} could not reach the minimum replica count")]
    ChunkReplicationShortfall(i32),

    #[error("could not verify deduplicated chunk {0} against any backend")]
    DedupVerificationFail(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("file {0} not found")]
    NotFound(Uuid),

    #[error("chunk {0} could not be recovered from any source")]
    ChunkIrrecoverable(i32),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the metadata store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("invariant violation: {0}")]
    Invariant(String),
}
