use std::time::Duration;

use crate::chunk::ChunkSizeTier;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub user_agent: String,
    pub max_chunks: ChunkSizeTier,
    pub min_chunk_size_bytes: u64,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub buffer_size: usize,
    /// A checkpoint is saved once this many bytes are unsaved, or once
    /// `checkpoint_period` has passed with any bytes unsaved.
    pub checkpoint_bytes: u64,
    pub checkpoint_period: Duration,
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Option<Duration>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            user_agent: "rangefetch/0.1".to_string(),
            max_chunks: ChunkSizeTier::Recommended,
            min_chunk_size_bytes: 1,
            retry_count: 5,
            retry_backoff: Duration::from_secs(3),
            buffer_size: 64 * 1024,
            checkpoint_bytes: 1024 * 1024,
            checkpoint_period: Duration::from_secs(5),
            poll_interval: Duration::from_millis(200),
            connect_timeout: Duration::from_secs(30),
            request_timeout: None,
        }
    }
}
