pub mod backend_client;
pub mod cache;
pub mod chunker;
pub mod download;
pub mod health;
pub mod placement;
pub mod reconciler;
pub mod upload;

pub use backend_client::BackendClient;
pub use cache::{ChunkCache, DiskCache};
pub use chunker::{chunk_fixed_size, PlannedChunk};
pub use download::DownloadCoordinator;
pub use health::HealthMonitor;
pub use reconciler::Reconciler;
pub use upload::{BackendHandle, UploadCoordinator};
