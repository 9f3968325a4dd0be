use std::io::{self, ErrorKind, Read};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::chunk::Chunk;
use crate::net::{ByteRange, DownloadRequest, DownloadResponse, NetClient};
use crate::output::OutputFile;
use crate::progress::ProgressReporter;
use crate::task::CancelHandle;

const STOP_NONE: u8 = 0;
const STOP_SIBLING_FAILED: u8 = 1;
const STOP_DEGRADE: u8 = 2;

#[derive(Debug, Clone)]
pub struct StopFlag {
    cancel: CancelHandle,
    round: Arc<AtomicU8>,
}

impl StopFlag {
    pub fn new(cancel: CancelHandle) -> Self {
        Self {
            cancel,
            round: Arc::new(AtomicU8::new(STOP_NONE)),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.round.load(Ordering::SeqCst) != STOP_NONE
    }

    pub fn stop_for_failure(&self) {
        let _ = self.round.compare_exchange(
            STOP_NONE,
            STOP_SIBLING_FAILED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn stop_for_degrade(&self) {
        let _ = self
            .round
            .compare_exchange(STOP_NONE, STOP_DEGRADE, Ordering::SeqCst, Ordering::SeqCst);
    }

    fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_stopped() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep((deadline - now).min(Duration::from_millis(50)));
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Completed,
    RangeUnsupported { status: u16 },
    Stopped,
    Failed { reason: String, attempts: u32 },
}

#[derive(Debug)]
enum FetchError {
    Transient(String),
    Terminal(String),
}

enum AttemptEnd {
    Completed,
    Stopped,
    RangeUnsupported(u16),
}

#[derive(Clone)]
pub struct WorkerContext {
    pub net: Arc<dyn NetClient>,
    pub request: DownloadRequest,
    pub output: Arc<OutputFile>,
    pub reporter: ProgressReporter,
    pub stop: StopFlag,
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub buffer_size: usize,
    /// The plan has a single chunk, so a 200 reply is streamed as the whole
    /// resource instead of being reported as missing range support.
    pub single_stream: bool,
}

#[derive(Debug, Clone)]
pub struct ChunkWorker {
    index: usize,
    range_start: u64,
    range_end: Option<u64>,
}

impl ChunkWorker {
    pub fn new(chunk: &Chunk) -> Self {
        Self {
            index: chunk.index,
            range_start: chunk.range_start,
            range_end: chunk.range_end,
        }
    }

    pub fn run(&self, ctx: &WorkerContext) -> ChunkOutcome {
        let mut last_error = None;
        let mut attempts = 0u32;

        for attempt in 0..=ctx.retry_count {
            if ctx.stop.is_stopped() {
                return ChunkOutcome::Stopped;
            }
            attempts = attempt + 1;
            match self.attempt(ctx) {
                Ok(AttemptEnd::Completed) => return ChunkOutcome::Completed,
                Ok(AttemptEnd::Stopped) => return ChunkOutcome::Stopped,
                Ok(AttemptEnd::RangeUnsupported(status)) => {
                    return ChunkOutcome::RangeUnsupported { status }
                }
                Err(FetchError::Terminal(reason)) => {
                    return ChunkOutcome::Failed { reason, attempts }
                }
                Err(FetchError::Transient(reason)) => {
                    warn!(chunk = self.index, attempt = attempts, error = %reason, "chunk fetch failed");
                    last_error = Some(reason);
                }
            }
            if attempt < ctx.retry_count && !ctx.stop.sleep(ctx.retry_backoff) {
                return ChunkOutcome::Stopped;
            }
        }

        ChunkOutcome::Failed {
            reason: format!(
                "retries exhausted: {}",
                last_error.unwrap_or_else(|| "unknown error".to_string())
            ),
            attempts,
        }
    }

    fn attempt(&self, ctx: &WorkerContext) -> Result<AttemptEnd, FetchError> {
        let aggregator = ctx.reporter.aggregator();
        let start = self
            .range_start
            .saturating_add(aggregator.chunk_committed(self.index));
        if let Some(end) = self.range_end {
            if start >= end {
                return Ok(AttemptEnd::Completed);
            }
        }

        let range = match self.range_end {
            Some(end) => Some(ByteRange {
                start,
                end: Some(end - 1),
            }),
            None if start > 0 => Some(ByteRange { start, end: None }),
            None => None,
        };
        let range_header = range
            .map(|r| r.header_value())
            .unwrap_or_else(|| "none".to_string());
        debug!(chunk = self.index, range = %range_header, "requesting chunk");

        let DownloadResponse { meta, mut body } = ctx
            .net
            .get(&ctx.request.with_range(range))
            .map_err(|err| FetchError::Transient(err.to_string()))?;

        match meta.status_code {
            206 => {
                let served = match (meta.content_range, self.range_end) {
                    (Some(served), _) => Some(served),
                    (None, None) => None,
                    (None, Some(_)) => {
                        return Err(FetchError::Terminal(format!(
                            "206 for chunk {} carried no Content-Range",
                            self.index
                        )));
                    }
                };
                if let Some(served) = served {
                    if served.start != start {
                        return Err(FetchError::Terminal(format!(
                            "server sent range starting at {} for a request starting at {}",
                            served.start, start
                        )));
                    }
                    match (self.range_end, served.total) {
                        (None, Some(total)) => {
                            aggregator.learn_total(total);
                        }
                        (None, None) => {}
                        (Some(_), total) => {
                            let expected = u64::try_from(aggregator.total_expected()).ok();
                            if total != expected {
                                return Err(FetchError::Terminal(format!(
                                    "server reports total {} but {} was planned",
                                    total.map_or_else(|| "*".to_string(), |t| t.to_string()),
                                    expected.map_or_else(|| "unknown".to_string(), |t| t.to_string()),
                                )));
                            }
                        }
                    }
                }
                self.stream(ctx, body.as_mut(), start, 0, self.range_end)
            }
            200 => {
                if !ctx.single_stream {
                    return Ok(AttemptEnd::RangeUnsupported(200));
                }
                if let (None, Some(len)) = (self.range_end, meta.content_length) {
                    aggregator.learn_total(len);
                }
                // The body restarts at byte 0; everything before `start` is
                // already on disk.
                self.stream(ctx, body.as_mut(), start, start, None)
            }
            status => Err(FetchError::Terminal(format!(
                "unexpected status {} for chunk {}",
                status, self.index
            ))),
        }
    }

    fn stream(
        &self,
        ctx: &WorkerContext,
        body: &mut dyn Read,
        start: u64,
        skip: u64,
        limit: Option<u64>,
    ) -> Result<AttemptEnd, FetchError> {
        if skip > 0 {
            let skipped = io::copy(&mut (&mut *body).take(skip), &mut io::sink())
                .map_err(|err| FetchError::Transient(err.to_string()))?;
            if skipped < skip {
                return Err(FetchError::Transient(format!(
                    "stream ended after {} of {} committed bytes",
                    skipped, skip
                )));
            }
        }

        let mut writer = ctx
            .output
            .writer_at(start)
            .map_err(|err| FetchError::Terminal(err.to_string()))?;
        let mut buffer = vec![0u8; ctx.buffer_size.max(1)];

        loop {
            if ctx.stop.is_stopped() {
                return Ok(AttemptEnd::Stopped);
            }
            let want = match limit {
                Some(end) => {
                    let left = end.saturating_sub(writer.offset());
                    if left == 0 {
                        return Ok(AttemptEnd::Completed);
                    }
                    left.min(buffer.len() as u64) as usize
                }
                None => buffer.len(),
            };
            let read = match body.read(&mut buffer[..want]) {
                Ok(read) => read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FetchError::Transient(err.to_string())),
            };
            if read == 0 {
                break;
            }
            writer
                .write_block(&buffer[..read])
                .map_err(|err| FetchError::Terminal(err.to_string()))?;
            ctx.reporter.commit(self.index, read as u64);
        }

        match limit {
            Some(end) if writer.offset() < end => Err(FetchError::Transient(format!(
                "stream ended at byte {} of chunk ending at {}",
                writer.offset(),
                end
            ))),
            _ => Ok(AttemptEnd::Completed),
        }
    }
}
