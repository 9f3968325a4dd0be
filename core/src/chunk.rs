use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(
    Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
pub enum ChunkSizeTier {
    Single = 1,
    Minimal = 2,
    #[default]
    Recommended = 3,
    Ludicrous = 4,
}

impl ChunkSizeTier {
    pub fn max_chunks(&self) -> usize {
        *self as usize
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkSizeTier::Single => "single",
            ChunkSizeTier::Minimal => "minimal",
            ChunkSizeTier::Recommended => "recommended",
            ChunkSizeTier::Ludicrous => "ludicrous",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "single" | "1" => Some(ChunkSizeTier::Single),
            "minimal" | "2" => Some(ChunkSizeTier::Minimal),
            "recommended" | "3" => Some(ChunkSizeTier::Recommended),
            "ludicrous" | "4" => Some(ChunkSizeTier::Ludicrous),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkSizeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    InFlight,
    Completed,
    Failed,
}

impl ChunkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChunkState::Pending => "pending",
            ChunkState::InFlight => "in_flight",
            ChunkState::Completed => "completed",
            ChunkState::Failed => "failed",
        }
    }
}

impl fmt::Display for ChunkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub index: usize,
    pub range_start: u64,
    pub range_end: Option<u64>,
    pub bytes_committed: u64,
    pub state: ChunkState,
}

impl Chunk {
    pub fn new(index: usize, range_start: u64, range_end: u64) -> Self {
        Self {
            index,
            range_start,
            range_end: Some(range_end),
            bytes_committed: 0,
            state: ChunkState::Pending,
        }
    }

    pub fn open_ended(index: usize) -> Self {
        Self {
            index,
            range_start: 0,
            range_end: None,
            bytes_committed: 0,
            state: ChunkState::Pending,
        }
    }

    pub fn span(&self) -> Option<u64> {
        self.range_end
            .map(|end| end.saturating_sub(self.range_start))
    }

    pub fn remaining_start(&self) -> u64 {
        self.range_start.saturating_add(self.bytes_committed)
    }

    pub fn remaining(&self) -> Option<u64> {
        self.span()
            .map(|span| span.saturating_sub(self.bytes_committed))
    }

    pub fn is_fully_committed(&self) -> bool {
        matches!(self.remaining(), Some(0))
    }
}
