use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::chunk::Chunk;
use crate::view::ProgressView;

pub type ProgressCallback = Arc<dyn Fn(ProgressSnapshot) + Send + Sync>;
pub type ChunkCountCallback = Arc<dyn Fn(usize) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub chunk_index: usize,
    pub bytes_read_this_tick: u64,
    pub total_bytes_read: u64,
    /// `-1` while the resource length is unknown.
    pub total_bytes_expected: i64,
}

#[derive(Debug, Clone, Copy, Default)]
struct ChunkCounter {
    span: Option<u64>,
    committed: u64,
}

#[derive(Debug)]
pub struct ProgressAggregator {
    chunks: Mutex<Vec<ChunkCounter>>,
    committed: AtomicU64,
    expected: AtomicI64,
}

impl ProgressAggregator {
    pub fn new(total_bytes_expected: i64) -> Self {
        Self {
            chunks: Mutex::new(Vec::new()),
            committed: AtomicU64::new(0),
            expected: AtomicI64::new(total_bytes_expected),
        }
    }

    pub fn reset(&self, chunks: &[Chunk]) {
        if let Ok(mut counters) = self.chunks.lock() {
            *counters = chunks
                .iter()
                .map(|chunk| ChunkCounter {
                    span: chunk.span(),
                    committed: chunk.bytes_committed,
                })
                .collect();
            let total = counters.iter().map(|counter| counter.committed).sum();
            self.committed.store(total, Ordering::SeqCst);
        }
    }

    pub fn record(&self, chunk_index: usize, bytes: u64) -> u64 {
        if let Ok(mut counters) = self.chunks.lock() {
            if let Some(counter) = counters.get_mut(chunk_index) {
                counter.committed = counter.committed.saturating_add(bytes);
                return self.committed.fetch_add(bytes, Ordering::SeqCst) + bytes;
            }
        }
        self.committed.load(Ordering::SeqCst)
    }

    pub fn chunk_committed(&self, chunk_index: usize) -> u64 {
        self.chunks
            .lock()
            .ok()
            .and_then(|counters| counters.get(chunk_index).map(|counter| counter.committed))
            .unwrap_or(0)
    }

    pub fn chunk_progress(&self, chunk_index: usize) -> f64 {
        let Some(counter) = self
            .chunks
            .lock()
            .ok()
            .and_then(|counters| counters.get(chunk_index).copied())
        else {
            return 0.0;
        };
        let span = counter
            .span
            .or_else(|| u64::try_from(self.total_expected()).ok());
        fraction(counter.committed, span)
    }

    pub fn total_committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn total_expected(&self) -> i64 {
        self.expected.load(Ordering::SeqCst)
    }

    pub fn learn_total(&self, total_bytes: u64) -> bool {
        let total = i64::try_from(total_bytes).unwrap_or(i64::MAX);
        self.expected
            .compare_exchange(-1, total, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn overall_progress(&self) -> f64 {
        let expected = u64::try_from(self.total_expected()).ok();
        fraction(self.total_committed(), expected)
    }
}

fn fraction(committed: u64, total: Option<u64>) -> f64 {
    match total {
        None => 0.0,
        Some(0) => 1.0,
        Some(total) => (committed as f64 / total as f64).min(1.0),
    }
}

#[derive(Clone)]
pub struct ProgressReporter {
    aggregator: Arc<ProgressAggregator>,
    callback: Option<ProgressCallback>,
    view: Option<Arc<dyn ProgressView>>,
}

impl fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("aggregator", &self.aggregator)
            .field("callback", &self.callback.is_some())
            .field("view", &self.view.is_some())
            .finish()
    }
}

impl ProgressReporter {
    pub fn new(
        aggregator: Arc<ProgressAggregator>,
        callback: Option<ProgressCallback>,
        view: Option<Arc<dyn ProgressView>>,
    ) -> Self {
        Self {
            aggregator,
            callback,
            view,
        }
    }

    pub fn aggregator(&self) -> &Arc<ProgressAggregator> {
        &self.aggregator
    }

    pub fn commit(&self, chunk_index: usize, bytes: u64) -> ProgressSnapshot {
        let total = self.aggregator.record(chunk_index, bytes);
        let snapshot = ProgressSnapshot {
            chunk_index,
            bytes_read_this_tick: bytes,
            total_bytes_read: total,
            total_bytes_expected: self.aggregator.total_expected(),
        };
        if let Some(callback) = &self.callback {
            callback(snapshot);
        }
        if let Some(view) = &self.view {
            view.set_progress(self.aggregator.chunk_progress(chunk_index), chunk_index);
        }
        snapshot
    }

    pub fn install(&self, chunks: &[Chunk]) {
        self.aggregator.reset(chunks);
        if let Some(view) = &self.view {
            view.set_chunks(chunks.len());
            for chunk in chunks {
                let progress = self.aggregator.chunk_progress(chunk.index);
                if progress > 0.0 {
                    view.set_progress(progress, chunk.index);
                }
            }
        }
    }
}
