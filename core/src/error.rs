use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid task state: {0}")]
    InvalidState(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("chunk {index} failed with {committed_bytes} bytes committed: {reason}")]
    ChunkFailed {
        index: usize,
        committed_bytes: u64,
        reason: String,
    },
    #[error("integrity mismatch: expected {expected} bytes, committed {committed}")]
    IntegrityMismatch { expected: u64, committed: u64 },
}

pub type CoreResult<T> = Result<T, CoreError>;
