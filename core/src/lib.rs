pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod net;
pub mod output;
pub mod planner;
pub mod progress;
pub mod resume;
pub mod store;
pub mod task;
pub mod view;
pub mod worker;

pub use crate::chunk::{Chunk, ChunkSizeTier, ChunkState};
pub use crate::config::EngineConfig;
pub use crate::engine::{DownloadEngine, DownloadReport};
pub use crate::error::{CoreError, CoreResult};
pub use crate::net::{DownloadRequest, NetClient, ReqwestNetClient};
pub use crate::progress::ProgressSnapshot;
pub use crate::store::{JsonFileStore, MemoryStore, ResumeStore};
#[cfg(feature = "sqlite")]
pub use crate::store::SqliteStore;
pub use crate::task::{CancelHandle, DownloadTask, TaskId, TaskState};
pub use crate::view::{ChunkedProgress, ProgressView};

#[cfg(test)]
mod tests;
