use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use tracing::{debug, error, info, info_span, warn, Span};

use crate::chunk::{Chunk, ChunkState};
use crate::config::EngineConfig;
use crate::error::{CoreError, CoreResult};
use crate::net::{ByteRange, DownloadResponse, NetClient, ReqwestNetClient, ResponseMeta};
use crate::output::OutputFile;
use crate::planner::{ChunkPlanner, RangeSupport};
use crate::progress::{ProgressAggregator, ProgressReporter};
use crate::resume::{ResourceIdentity, ResumeCoordinator, ResumeRecord};
use crate::store::{MemoryStore, ResumeStore};
use crate::task::{DownloadTask, TaskId, TaskState};
use crate::worker::{ChunkOutcome, ChunkWorker, StopFlag, WorkerContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub task_id: TaskId,
    pub state: TaskState,
    pub path: PathBuf,
    pub total_bytes: Option<u64>,
    pub committed_bytes: u64,
    pub chunk_count: usize,
    pub resumed: bool,
    pub degraded: bool,
}

#[derive(Debug)]
enum RoundEnd {
    Completed,
    Cancelled,
    RangeUnsupported { index: usize, status: u16 },
    Failed { index: usize, reason: String },
}

struct Session {
    identity: ResourceIdentity,
    total_bytes: Option<u64>,
    chunks: Vec<Chunk>,
    ranges_unsupported: bool,
    resumed: bool,
    degraded: bool,
    output: Arc<OutputFile>,
    reporter: ProgressReporter,
    last_checkpoint: u64,
    last_checkpoint_at: Instant,
}

impl Session {
    fn aggregator(&self) -> &Arc<ProgressAggregator> {
        self.reporter.aggregator()
    }

    fn capture(&mut self) {
        let aggregator = Arc::clone(self.reporter.aggregator());
        for chunk in &mut self.chunks {
            chunk.bytes_committed = aggregator.chunk_committed(chunk.index);
        }
    }

    fn report(&self, task: &DownloadTask, state: TaskState) -> DownloadReport {
        DownloadReport {
            task_id: task.id(),
            state,
            path: self.output.path().to_path_buf(),
            total_bytes: self.total_bytes,
            committed_bytes: self.aggregator().total_committed(),
            chunk_count: self.chunks.len(),
            resumed: self.resumed,
            degraded: self.degraded,
        }
    }
}

pub struct DownloadEngine {
    pub config: EngineConfig,
    store: Arc<Mutex<Box<dyn ResumeStore>>>,
    net: Arc<dyn NetClient>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> CoreResult<Self> {
        let net = ReqwestNetClient::new(&config)?;
        Ok(Self {
            config,
            store: Arc::new(Mutex::new(Box::new(MemoryStore::default()))),
            net: Arc::new(net),
        })
    }

    pub fn with_store(mut self, store: Box<dyn ResumeStore>) -> Self {
        self.store = Arc::new(Mutex::new(store));
        self
    }

    pub fn with_net_client(mut self, net: Box<dyn NetClient>) -> Self {
        self.net = Arc::from(net);
        self
    }

    pub fn resume_record(&self, url: &str) -> CoreResult<Option<ResumeRecord>> {
        let identity = ResourceIdentity::new(url, None);
        self.store
            .lock()
            .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))?
            .load(&identity.key)
    }

    /// Drives `task` to a terminal state on the calling thread.
    ///
    /// Cancellation is not an error: the report comes back with
    /// [`TaskState::Cancelled`] and the checkpoint is kept for a later resume.
    pub fn run(&self, task: &DownloadTask) -> CoreResult<DownloadReport> {
        task.transition(TaskState::Planning)?;

        let span = info_span!("download", task = %task.id(), url = %task.request().url);
        let _entered = span.enter();

        match self.execute(task, &span) {
            Ok(report) => {
                info!(
                    state = %report.state,
                    committed = report.committed_bytes,
                    chunks = report.chunk_count,
                    "download finished"
                );
                Ok(report)
            }
            Err(err) => {
                let _ = task.transition(TaskState::Failed);
                error!(error = %err, "download failed");
                Err(err)
            }
        }
    }

    fn execute(&self, task: &DownloadTask, span: &Span) -> CoreResult<DownloadReport> {
        let probe = self.probe(task);
        let identity = ResourceIdentity::new(&task.request().url, probe.as_ref());
        let total_bytes = probe.as_ref().and_then(|meta| meta.content_length);
        let stored = self.load_record(&identity.key);

        let mut support = match probe.as_ref().and_then(|meta| meta.accept_ranges) {
            Some(true) => RangeSupport::Supported,
            Some(false) => RangeSupport::Unsupported,
            None => RangeSupport::Unknown,
        };
        if let Some(record) = &stored {
            if task.should_resume()
                && record.ranges_unsupported
                && Some(record.total_bytes) == total_bytes
            {
                support = RangeSupport::Unsupported;
            }
        }

        let tier = task.maximum_chunk_size().unwrap_or(self.config.max_chunks);
        let plan = ChunkPlanner::new(self.config.min_chunk_size_bytes).plan(total_bytes, tier, support);
        let resolution = ResumeCoordinator::resolve(
            task.should_resume(),
            &identity,
            &plan,
            stored.as_ref(),
            OutputFile::existing_len(task.dest_path()),
        );
        if let Some(reason) = &resolution.discarded {
            info!(%reason, "stored checkpoint does not match, starting over");
        }
        if stored.is_some() && !resolution.resumed {
            self.discard_record(&identity.key)?;
        }

        let output = OutputFile::prepare(task.dest_path(), total_bytes, resolution.resumed)?;
        task.set_total_bytes_expected(total_bytes);
        let aggregator = Arc::new(ProgressAggregator::new(task.total_bytes_expected()));
        let reporter = ProgressReporter::new(aggregator, task.progress_callback(), task.view());
        reporter.install(&resolution.chunks);

        let mut session = Session {
            identity,
            total_bytes,
            chunks: resolution.chunks,
            ranges_unsupported: support == RangeSupport::Unsupported,
            resumed: resolution.resumed,
            degraded: false,
            output: Arc::new(output),
            reporter,
            last_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        };
        session.last_checkpoint = session.aggregator().total_committed();

        if task.is_cancel_requested() {
            self.checkpoint(&mut session)?;
            task.transition(TaskState::Cancelled)?;
            return Ok(session.report(task, TaskState::Cancelled));
        }

        task.transition(TaskState::Downloading)?;
        info!(
            chunks = session.chunks.len(),
            total = ?total_bytes,
            resumed = session.resumed,
            committed = session.last_checkpoint,
            provisional = plan.provisional,
            "download started"
        );

        loop {
            match self.run_round(task, &mut session, span) {
                RoundEnd::Completed => break,
                RoundEnd::Cancelled => {
                    self.checkpoint(&mut session)?;
                    task.transition(TaskState::Cancelled)?;
                    return Ok(session.report(task, TaskState::Cancelled));
                }
                RoundEnd::RangeUnsupported { index, status } if !session.degraded && session.chunks.len() > 1 => {
                    info!(chunk = index, status, "server ignored range request");
                    self.degrade(task, &mut session)?;
                }
                RoundEnd::RangeUnsupported { index, status } => {
                    return self.fail(
                        &mut session,
                        index,
                        format!("server answered a single-stream request with status {}", status),
                    );
                }
                RoundEnd::Failed { index, reason } => {
                    return self.fail(&mut session, index, reason);
                }
            }
        }

        self.finish(task, &mut session)
    }

    fn probe(&self, task: &DownloadTask) -> Option<ResponseMeta> {
        let head = match self.net.head(task.request()) {
            Ok(meta) if (200..300).contains(&meta.status_code) => {
                debug!(
                    status = meta.status_code,
                    length = ?meta.content_length,
                    ranges = ?meta.accept_ranges,
                    "probe"
                );
                Some(meta)
            }
            Ok(meta) => {
                debug!(status = meta.status_code, "probe rejected");
                None
            }
            Err(err) => {
                debug!(error = %err, "probe failed");
                None
            }
        };
        if head.as_ref().map_or(false, |meta| meta.content_length.is_some()) {
            return head;
        }
        self.probe_with_get(task).or(head)
    }

    fn probe_with_get(&self, task: &DownloadTask) -> Option<ResponseMeta> {
        let request = task
            .request()
            .with_range(Some(ByteRange { start: 0, end: None }));
        let DownloadResponse { meta, body } = match self.net.get(&request) {
            Ok(response) => response,
            Err(err) => {
                debug!(error = %err, "ranged probe failed");
                return None;
            }
        };
        drop(body);

        let (content_length, accept_ranges) = match meta.status_code {
            206 => (meta.content_range.and_then(|range| range.total), Some(true)),
            200 => (meta.content_length, Some(false)),
            status => {
                debug!(status, "ranged probe rejected");
                return None;
            }
        };
        debug!(
            status = meta.status_code,
            length = ?content_length,
            "ranged probe"
        );
        Some(ResponseMeta {
            content_length,
            accept_ranges,
            ..meta
        })
    }

    fn run_round(&self, task: &DownloadTask, session: &mut Session, span: &Span) -> RoundEnd {
        let stop = StopFlag::new(task.cancel_handle());
        let ctx = WorkerContext {
            net: Arc::clone(&self.net),
            request: task.request().clone(),
            output: Arc::clone(&session.output),
            reporter: session.reporter.clone(),
            stop: stop.clone(),
            retry_count: self.config.retry_count,
            retry_backoff: self.config.retry_backoff,
            buffer_size: self.config.buffer_size,
            single_stream: session.chunks.len() == 1,
        };

        let (tx, rx) = mpsc::channel();
        let mut handles = Vec::new();
        for chunk in session
            .chunks
            .iter_mut()
            .filter(|chunk| chunk.state != ChunkState::Completed)
        {
            chunk.state = ChunkState::InFlight;
            let worker = ChunkWorker::new(chunk);
            let index = chunk.index;
            let ctx = ctx.clone();
            let tx = tx.clone();
            let span = span.clone();
            handles.push(thread::spawn(move || {
                let _entered = span.enter();
                let outcome = worker.run(&ctx);
                let _ = tx.send((index, outcome));
            }));
        }
        drop(tx);

        let mut end: Option<RoundEnd> = None;
        loop {
            match rx.recv_timeout(self.config.poll_interval) {
                Ok((index, outcome)) => {
                    if let Some(chunk) = session.chunks.get_mut(index) {
                        chunk.state = match &outcome {
                            ChunkOutcome::Completed => ChunkState::Completed,
                            ChunkOutcome::Failed { .. } => ChunkState::Failed,
                            ChunkOutcome::RangeUnsupported { .. } | ChunkOutcome::Stopped => {
                                ChunkState::Pending
                            }
                        };
                    }
                    match outcome {
                        ChunkOutcome::Completed => debug!(chunk = index, "chunk completed"),
                        ChunkOutcome::Stopped => debug!(chunk = index, "chunk stopped"),
                        ChunkOutcome::RangeUnsupported { status } => {
                            if end.is_none() {
                                stop.stop_for_degrade();
                                end = Some(RoundEnd::RangeUnsupported { index, status });
                            }
                        }
                        ChunkOutcome::Failed { reason, attempts } => {
                            warn!(chunk = index, attempts, error = %reason, "chunk failed");
                            if end.is_none() {
                                stop.stop_for_failure();
                                end = Some(RoundEnd::Failed { index, reason });
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.maybe_checkpoint(session);
        }

        for handle in handles {
            let _ = handle.join();
        }

        let unfinished = session
            .chunks
            .iter()
            .find(|chunk| chunk.state != ChunkState::Completed)
            .map(|chunk| chunk.index);
        match (end, unfinished) {
            (Some(RoundEnd::Failed { index, reason }), _) => RoundEnd::Failed { index, reason },
            (None, None) => RoundEnd::Completed,
            _ if task.is_cancel_requested() => RoundEnd::Cancelled,
            (Some(end), _) => end,
            (None, Some(index)) => RoundEnd::Failed {
                index,
                reason: "worker exited without reporting".to_string(),
            },
        }
    }

    fn degrade(&self, task: &DownloadTask, session: &mut Session) -> CoreResult<()> {
        let Some(total) = session.total_bytes else {
            return Err(CoreError::InvalidState(
                "multi-chunk plan without a known length".to_string(),
            ));
        };
        let prefix = session
            .chunks
            .first()
            .filter(|chunk| chunk.range_start == 0)
            .map(|chunk| session.aggregator().chunk_committed(chunk.index))
            .unwrap_or(0);

        let mut chunks = ChunkPlanner::single(total).chunks;
        if let Some(chunk) = chunks.first_mut() {
            chunk.bytes_committed = prefix.min(total);
            if chunk.is_fully_committed() {
                chunk.state = ChunkState::Completed;
            }
        }
        info!(
            from = session.chunks.len(),
            kept = prefix,
            "falling back to a single stream"
        );

        session.chunks = chunks;
        session.ranges_unsupported = true;
        session.degraded = true;
        session.reporter.install(&session.chunks);
        if let Some(callback) = task.chunk_count_callback() {
            callback(session.chunks.len());
        }
        self.checkpoint(session)
    }

    fn finish(&self, task: &DownloadTask, session: &mut Session) -> CoreResult<DownloadReport> {
        session.output.sync()?;
        let committed = session.aggregator().total_committed();
        match session.total_bytes {
            Some(expected) if committed != expected => {
                self.checkpoint_quietly(session);
                return Err(CoreError::IntegrityMismatch {
                    expected,
                    committed,
                });
            }
            Some(_) => {}
            None => {
                session.total_bytes = Some(committed);
                session.aggregator().learn_total(committed);
                task.set_total_bytes_expected(Some(committed));
            }
        }

        self.discard_record(&session.identity.key)?;
        task.transition(TaskState::Completed)?;
        Ok(session.report(task, TaskState::Completed))
    }

    fn fail(&self, session: &mut Session, index: usize, reason: String) -> CoreResult<DownloadReport> {
        self.checkpoint_quietly(session);
        Err(CoreError::ChunkFailed {
            index,
            committed_bytes: session.aggregator().chunk_committed(index),
            reason,
        })
    }

    /// Flushes the output and then persists the committed counters. Counters
    /// are read before the flush so every counted byte is on disk when the
    /// record lands.
    fn checkpoint(&self, session: &mut Session) -> CoreResult<()> {
        let Some(total) = session.total_bytes else {
            return Ok(());
        };
        session.capture();
        session.output.sync()?;
        let Some(record) = ResumeRecord::from_chunks(
            &session.identity,
            total,
            session.ranges_unsupported,
            &session.chunks,
        ) else {
            return Ok(());
        };
        self.store
            .lock()
            .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))?
            .save(&record)?;
        session.last_checkpoint = record.committed_bytes();
        session.last_checkpoint_at = Instant::now();
        debug!(committed = session.last_checkpoint, "checkpoint saved");
        Ok(())
    }

    fn checkpoint_quietly(&self, session: &mut Session) {
        if let Err(err) = self.checkpoint(session) {
            warn!(error = %err, "checkpoint failed");
        }
    }

    fn maybe_checkpoint(&self, session: &mut Session) {
        let pending = session
            .aggregator()
            .total_committed()
            .saturating_sub(session.last_checkpoint);
        let due = pending >= self.config.checkpoint_bytes
            || (pending > 0 && session.last_checkpoint_at.elapsed() >= self.config.checkpoint_period);
        if due {
            self.checkpoint_quietly(session);
        }
    }

    fn load_record(&self, key: &str) -> Option<ResumeRecord> {
        let loaded = self
            .store
            .lock()
            .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))
            .and_then(|store| store.load(key));
        match loaded {
            Ok(record) => record,
            Err(err) => {
                warn!(error = %err, "ignoring unreadable checkpoint");
                None
            }
        }
    }

    fn discard_record(&self, key: &str) -> CoreResult<()> {
        self.store
            .lock()
            .map_err(|_| CoreError::Storage("store lock poisoned".to_string()))?
            .discard(key)
    }
}
