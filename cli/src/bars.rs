use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use rangefetch_core::{ProgressSnapshot, ProgressView};

const BAR_SCALE: u64 = 1000;

fn chunk_style() -> ProgressStyle {
    ProgressStyle::with_template("  #{prefix:<2} [{bar:30.cyan/blue}] {percent:>3}%")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("━━╌")
}

fn total_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.green/white}] {bytes}/{total_bytes} @ {bytes_per_sec} eta {eta} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("━━╌")
}

/// Terminal view: one bar per chunk plus a byte-count bar for the whole file.
pub struct BarView {
    multi: MultiProgress,
    total: ProgressBar,
    chunks: Mutex<Vec<(ProgressBar, f64)>>,
}

impl BarView {
    pub fn new(name: &str) -> Self {
        let multi = MultiProgress::new();
        let total = multi.add(ProgressBar::new(0));
        total.set_style(total_style());
        total.set_message(name.to_string());
        Self {
            multi,
            total,
            chunks: Mutex::new(Vec::new()),
        }
    }

    /// Feeds the byte-count bar from the task's progress callback.
    pub fn record(&self, snapshot: ProgressSnapshot) {
        if let Ok(total) = u64::try_from(snapshot.total_bytes_expected) {
            if self.total.length() != Some(total) {
                self.total.set_length(total);
            }
        }
        self.total.set_position(snapshot.total_bytes_read);
    }

    pub fn finish(&self, message: &str) {
        if let Ok(mut chunks) = self.chunks.lock() {
            for (bar, _) in chunks.drain(..) {
                bar.finish_and_clear();
                self.multi.remove(&bar);
            }
        }
        self.total.finish_with_message(message.to_string());
    }
}

impl ProgressView for BarView {
    fn set_chunks(&self, count: usize) {
        let Ok(mut chunks) = self.chunks.lock() else {
            return;
        };
        for (bar, _) in chunks.drain(..) {
            bar.finish_and_clear();
            self.multi.remove(&bar);
        }
        // A single chunk is already shown by the total bar.
        if count < 2 {
            chunks.extend((0..count).map(|_| (ProgressBar::hidden(), 0.0)));
            return;
        }
        for index in 0..count {
            let bar = self.multi.add(ProgressBar::new(BAR_SCALE));
            bar.set_style(chunk_style());
            bar.set_prefix(index.to_string());
            chunks.push((bar, 0.0));
        }
    }

    fn set_progress(&self, fraction: f64, chunk_index: usize) {
        if let Ok(mut chunks) = self.chunks.lock() {
            if let Some((bar, value)) = chunks.get_mut(chunk_index) {
                *value = fraction.clamp(0.0, 1.0);
                bar.set_position((*value * BAR_SCALE as f64) as u64);
            }
        }
    }

    fn progress_at_chunk_index(&self, chunk_index: usize) -> f64 {
        self.chunks
            .lock()
            .ok()
            .and_then(|chunks| chunks.get(chunk_index).map(|(_, value)| *value))
            .unwrap_or(0.0)
    }

    fn overall_progress(&self) -> f64 {
        let Ok(chunks) = self.chunks.lock() else {
            return 0.0;
        };
        if chunks.is_empty() {
            return 0.0;
        }
        chunks.iter().map(|(_, value)| value).sum::<f64>() / chunks.len() as f64
    }
}
