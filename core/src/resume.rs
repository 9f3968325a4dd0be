use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use url::Url;

use crate::chunk::{Chunk, ChunkState};
use crate::net::ResponseMeta;
use crate::planner::ChunkPlan;

/// Identifies the remote resource across runs: the URL without its fragment,
/// plus the strongest validator the server handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceIdentity {
    pub key: String,
    pub validator: Option<String>,
}

impl ResourceIdentity {
    pub fn new(url: &str, probe: Option<&ResponseMeta>) -> Self {
        let key = match Url::parse(url) {
            Ok(mut parsed) => {
                parsed.set_fragment(None);
                parsed.to_string()
            }
            Err(_) => url.trim().to_string(),
        };
        let validator = probe.and_then(|meta| {
            meta.etag
                .clone()
                .or_else(|| meta.last_modified.clone())
        });
        Self { key, validator }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkCheckpoint {
    pub range_start: u64,
    pub range_end: u64,
    pub bytes_committed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResumeRecord {
    pub key: String,
    pub validator: Option<String>,
    pub total_bytes: u64,
    pub ranges_unsupported: bool,
    pub chunks: Vec<ChunkCheckpoint>,
    pub updated_at: u64,
}

impl ResumeRecord {
    pub fn from_chunks(
        identity: &ResourceIdentity,
        total_bytes: u64,
        ranges_unsupported: bool,
        chunks: &[Chunk],
    ) -> Option<Self> {
        let checkpoints = chunks
            .iter()
            .map(|chunk| {
                chunk.range_end.map(|range_end| ChunkCheckpoint {
                    range_start: chunk.range_start,
                    range_end,
                    bytes_committed: chunk.bytes_committed,
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self {
            key: identity.key.clone(),
            validator: identity.validator.clone(),
            total_bytes,
            ranges_unsupported,
            chunks: checkpoints,
            updated_at: now_epoch(),
        })
    }

    pub fn committed_bytes(&self) -> u64 {
        self.chunks.iter().map(|chunk| chunk.bytes_committed).sum()
    }

    fn furthest_committed_offset(&self) -> u64 {
        self.chunks
            .iter()
            .filter(|chunk| chunk.bytes_committed > 0)
            .map(|chunk| chunk.range_start + chunk.bytes_committed)
            .max()
            .unwrap_or(0)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Incompatible {
    #[error("record belongs to {stored}, not {current}")]
    IdentityMismatch { stored: String, current: String },
    #[error("resource validator changed from {stored:?} to {current:?}")]
    ValidatorMismatch {
        stored: Option<String>,
        current: Option<String>,
    },
    #[error("resource length changed from {stored} to {current:?}")]
    LengthMismatch { stored: u64, current: Option<u64> },
    #[error("stored partition has {stored} chunks, current plan has {planned}")]
    PartitionMismatch { stored: usize, planned: usize },
    #[error("chunk {index} claims {committed} bytes in a {span} byte span")]
    CommittedOverflow { index: usize, committed: u64, span: u64 },
    #[error("output file holds {actual:?} bytes, record needs {needed}")]
    OutputMissing { needed: u64, actual: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub chunks: Vec<Chunk>,
    pub resumed: bool,
    pub discarded: Option<Incompatible>,
}

impl Resolution {
    fn fresh(plan: &ChunkPlan, discarded: Option<Incompatible>) -> Self {
        Self {
            chunks: plan.chunks.clone(),
            resumed: false,
            discarded,
        }
    }
}

pub struct ResumeCoordinator;

impl ResumeCoordinator {
    pub fn resolve(
        should_resume: bool,
        identity: &ResourceIdentity,
        plan: &ChunkPlan,
        stored: Option<&ResumeRecord>,
        output_len: Option<u64>,
    ) -> Resolution {
        let Some(record) = stored else {
            return Resolution::fresh(plan, None);
        };
        if !should_resume {
            return Resolution::fresh(plan, None);
        }
        if let Err(reason) = Self::check(identity, plan, record, output_len) {
            return Resolution::fresh(plan, Some(reason));
        }

        let chunks = plan
            .chunks
            .iter()
            .zip(&record.chunks)
            .map(|(chunk, checkpoint)| {
                let mut chunk = chunk.clone();
                chunk.bytes_committed = checkpoint.bytes_committed;
                if chunk.is_fully_committed() {
                    chunk.state = ChunkState::Completed;
                }
                chunk
            })
            .collect();

        Resolution {
            chunks,
            resumed: true,
            discarded: None,
        }
    }

    fn check(
        identity: &ResourceIdentity,
        plan: &ChunkPlan,
        record: &ResumeRecord,
        output_len: Option<u64>,
    ) -> Result<(), Incompatible> {
        if record.key != identity.key {
            return Err(Incompatible::IdentityMismatch {
                stored: record.key.clone(),
                current: identity.key.clone(),
            });
        }
        if record.validator != identity.validator {
            return Err(Incompatible::ValidatorMismatch {
                stored: record.validator.clone(),
                current: identity.validator.clone(),
            });
        }
        if plan.total_bytes != Some(record.total_bytes) {
            return Err(Incompatible::LengthMismatch {
                stored: record.total_bytes,
                current: plan.total_bytes,
            });
        }

        let stored: Vec<(u64, Option<u64>)> = record
            .chunks
            .iter()
            .map(|chunk| (chunk.range_start, Some(chunk.range_end)))
            .collect();
        if stored != plan.partition() {
            return Err(Incompatible::PartitionMismatch {
                stored: record.chunks.len(),
                planned: plan.chunk_count(),
            });
        }

        for (index, chunk) in record.chunks.iter().enumerate() {
            let span = chunk.range_end.saturating_sub(chunk.range_start);
            if chunk.bytes_committed > span {
                return Err(Incompatible::CommittedOverflow {
                    index,
                    committed: chunk.bytes_committed,
                    span,
                });
            }
        }

        let needed = record.furthest_committed_offset();
        if needed > 0 && output_len.map_or(true, |len| len < needed) {
            return Err(Incompatible::OutputMissing {
                needed,
                actual: output_len,
            });
        }
        Ok(())
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
