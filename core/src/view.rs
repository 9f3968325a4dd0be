use std::sync::Mutex;

pub trait ProgressView: Send + Sync {
    fn set_chunks(&self, count: usize);
    fn set_progress(&self, fraction: f64, chunk_index: usize);
    fn progress_at_chunk_index(&self, chunk_index: usize) -> f64;
    fn overall_progress(&self) -> f64;
}

#[derive(Debug, Default)]
pub struct ChunkedProgress {
    chunks: Mutex<Vec<f64>>,
}

impl ChunkedProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().map(|chunks| chunks.len()).unwrap_or(0)
    }
}

impl ProgressView for ChunkedProgress {
    fn set_chunks(&self, count: usize) {
        if let Ok(mut chunks) = self.chunks.lock() {
            *chunks = vec![0.0; count];
        }
    }

    fn set_progress(&self, fraction: f64, chunk_index: usize) {
        if let Ok(mut chunks) = self.chunks.lock() {
            if let Some(slot) = chunks.get_mut(chunk_index) {
                *slot = fraction.clamp(0.0, 1.0);
            }
        }
    }

    fn progress_at_chunk_index(&self, chunk_index: usize) -> f64 {
        self.chunks
            .lock()
            .ok()
            .and_then(|chunks| chunks.get(chunk_index).copied())
            .unwrap_or(0.0)
    }

    fn overall_progress(&self) -> f64 {
        let Ok(chunks) = self.chunks.lock() else {
            return 0.0;
        };
        if chunks.is_empty() {
            return 0.0;
        }
        chunks.iter().sum::<f64>() / chunks.len() as f64
    }
}
