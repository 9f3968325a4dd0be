use crate::chunk::{Chunk, ChunkSizeTier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeSupport {
    Supported,
    Unsupported,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub total_bytes: Option<u64>,
    pub chunks: Vec<Chunk>,
    pub provisional: bool,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn partition(&self) -> Vec<(u64, Option<u64>)> {
        self.chunks
            .iter()
            .map(|chunk| (chunk.range_start, chunk.range_end))
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct ChunkPlanner {
    min_chunk_size: u64,
}

impl Default for ChunkPlanner {
    fn default() -> Self {
        Self { min_chunk_size: 1 }
    }
}

impl ChunkPlanner {
    pub fn new(min_chunk_size: u64) -> Self {
        Self {
            min_chunk_size: min_chunk_size.max(1),
        }
    }

    pub fn plan(
        &self,
        total_bytes: Option<u64>,
        tier: ChunkSizeTier,
        support: RangeSupport,
    ) -> ChunkPlan {
        let Some(total_bytes) = total_bytes else {
            return ChunkPlan {
                total_bytes: None,
                chunks: vec![Chunk::open_ended(0)],
                provisional: false,
            };
        };

        let count = if support == RangeSupport::Unsupported {
            1
        } else {
            self.chunk_count(total_bytes, tier)
        };

        ChunkPlan {
            total_bytes: Some(total_bytes),
            chunks: split_range(total_bytes, count),
            provisional: count > 1 && support == RangeSupport::Unknown,
        }
    }

    pub fn single(total_bytes: u64) -> ChunkPlan {
        ChunkPlan {
            total_bytes: Some(total_bytes),
            chunks: split_range(total_bytes, 1),
            provisional: false,
        }
    }

    fn chunk_count(&self, total_bytes: u64, tier: ChunkSizeTier) -> usize {
        let by_size = total_bytes.div_ceil(self.min_chunk_size).max(1);
        by_size.min(tier.max_chunks() as u64) as usize
    }
}

fn split_range(total_bytes: u64, count: usize) -> Vec<Chunk> {
    let count = count.max(1) as u64;
    let base = total_bytes / count;
    let remainder = total_bytes % count;

    let mut chunks = Vec::with_capacity(count as usize);
    let mut start = 0u64;
    for index in 0..count {
        let mut len = base;
        if index < remainder {
            len += 1;
        }
        let end = start + len;
        chunks.push(Chunk::new(index as usize, start, end));
        start = end;
    }
    chunks
}
