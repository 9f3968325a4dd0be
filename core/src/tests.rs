use std::fs;
use std::io::{self, Cursor, ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::chunk::ChunkSizeTier;
use crate::config::EngineConfig;
use crate::engine::DownloadEngine;
use crate::error::{CoreError, CoreResult};
use crate::net::{ByteRange, ContentRange, DownloadRequest, DownloadResponse, NetClient, ResponseMeta};
use crate::output::OutputFile;
use crate::planner::{ChunkPlanner, RangeSupport};
use crate::resume::{ResourceIdentity, ResumeRecord};
use crate::store::{MemoryStore, ResumeStore};
use crate::task::{CancelHandle, DownloadTask, TaskState};
use crate::view::{ChunkedProgress, ProgressView};

const URL: &str = "https://files.example.com/archive.bin";
const ETAG: &str = "\"v1\"";

fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Pauses the request starting at `range_start` after `after` bytes, waits
/// until `gate_bytes` have been served from offset 0, then cancels the task.
struct CancelPlan {
    range_start: u64,
    after: usize,
    gate_bytes: u64,
    handle: CancelHandle,
}

struct MockState {
    body: Vec<u8>,
    ranges: bool,
    accept_ranges: Option<bool>,
    head_status: u16,
    head_length: Option<Option<u64>>,
    /// When false, GET replies carry neither `Content-Length` nor a
    /// `Content-Range` total.
    declare_length: bool,
    range_total: Option<u64>,
    omit_content_range: bool,
    status: Option<u16>,
    failing_gets: AtomicU32,
    flaky_bodies: AtomicU32,
    flaky_after: usize,
    /// Bodies stall after this many bytes until the worker gives up on them.
    hold_after: Option<usize>,
    held: Arc<AtomicUsize>,
    /// `(start, holders)`: the GET starting at `start` answers 404 once
    /// `holders` other bodies are stalled.
    fail_start: Option<(u64, usize)>,
    cancel: Mutex<Option<CancelPlan>>,
    head_start_served: Arc<AtomicU64>,
    requests: Mutex<Vec<Option<ByteRange>>>,
}

#[derive(Clone)]
struct MockNet {
    state: Arc<MockState>,
}

impl MockNet {
    fn new(body: Vec<u8>) -> Self {
        Self {
            state: Arc::new(MockState {
                body,
                ranges: true,
                accept_ranges: Some(true),
                head_status: 200,
                head_length: None,
                declare_length: true,
                range_total: None,
                omit_content_range: false,
                status: None,
                failing_gets: AtomicU32::new(0),
                flaky_bodies: AtomicU32::new(0),
                flaky_after: 0,
                hold_after: None,
                held: Arc::new(AtomicUsize::new(0)),
                fail_start: None,
                cancel: Mutex::new(None),
                head_start_served: Arc::new(AtomicU64::new(0)),
                requests: Mutex::new(Vec::new()),
            }),
        }
    }

    fn configure(mut self, f: impl FnOnce(&mut MockState)) -> Self {
        let state = Arc::get_mut(&mut self.state).expect("configure before sharing");
        f(state);
        self
    }

    fn cancel_when(&self, plan: CancelPlan) {
        *self.state.cancel.lock().unwrap() = Some(plan);
    }

    fn requests(&self) -> Vec<Option<ByteRange>> {
        self.state.requests.lock().unwrap().clone()
    }

    fn boxed(&self) -> Box<dyn NetClient> {
        Box::new(self.clone())
    }
}

fn bare(status: u16) -> DownloadResponse {
    DownloadResponse {
        meta: ResponseMeta {
            status_code: status,
            ..ResponseMeta::default()
        },
        body: Box::new(io::empty()),
    }
}

impl NetClient for MockNet {
    fn head(&self, _req: &DownloadRequest) -> CoreResult<ResponseMeta> {
        if !(200..300).contains(&self.state.head_status) {
            return Ok(ResponseMeta {
                status_code: self.state.head_status,
                ..ResponseMeta::default()
            });
        }
        let length = self
            .state
            .head_length
            .unwrap_or(Some(self.state.body.len() as u64));
        Ok(ResponseMeta {
            status_code: 200,
            content_length: length,
            accept_ranges: self.state.accept_ranges,
            etag: Some(ETAG.to_string()),
            ..ResponseMeta::default()
        })
    }

    fn get(&self, req: &DownloadRequest) -> CoreResult<DownloadResponse> {
        self.state.requests.lock().unwrap().push(req.range);

        let failing = &self.state.failing_gets;
        if failing
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CoreError::Network("connection reset by peer".to_string()));
        }
        if let Some(status) = self.state.status {
            return Ok(bare(status));
        }

        let len = self.state.body.len() as u64;
        let (status, start, end) = match req.range {
            Some(range) if self.state.ranges => {
                let end = range.end.map(|end| end + 1).unwrap_or(len).min(len);
                (206, range.start.min(end), end)
            }
            _ => (200, 0, len),
        };
        if let Some((fail_start, holders)) = self.state.fail_start {
            if fail_start == start {
                let deadline = Instant::now() + Duration::from_secs(5);
                while self.state.held.load(Ordering::SeqCst) < holders && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(2));
                }
                return Ok(bare(404));
            }
        }

        let bytes = self.state.body[start as usize..end as usize].to_vec();
        let declared = self.state.declare_length;
        let meta = ResponseMeta {
            status_code: status,
            content_length: declared.then_some(end - start),
            content_range: (status == 206 && !self.state.omit_content_range).then(|| ContentRange {
                start,
                end: end.saturating_sub(1),
                total: self.state.range_total.or(declared.then_some(len)),
            }),
            etag: Some(ETAG.to_string()),
            ..ResponseMeta::default()
        };

        let flaky = self
            .state
            .flaky_bodies
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let cancel = {
            let mut slot = self.state.cancel.lock().unwrap();
            if slot.as_ref().map_or(false, |plan| plan.range_start == start) {
                slot.take()
            } else {
                None
            }
        };
        let served = (start == 0).then(|| Arc::clone(&self.state.head_start_served));

        Ok(DownloadResponse {
            meta,
            body: Box::new(MockBody {
                inner: Cursor::new(bytes),
                served: 0,
                fail_after: flaky.then_some(self.state.flaky_after),
                hold: self
                    .state
                    .hold_after
                    .map(|after| (after, Arc::clone(&self.state.held))),
                holding: false,
                cancel,
                gate: Arc::clone(&self.state.head_start_served),
                counter: served,
            }),
        })
    }
}

struct MockBody {
    inner: Cursor<Vec<u8>>,
    served: usize,
    fail_after: Option<usize>,
    hold: Option<(usize, Arc<AtomicUsize>)>,
    holding: bool,
    cancel: Option<CancelPlan>,
    gate: Arc<AtomicU64>,
    counter: Option<Arc<AtomicU64>>,
}

impl Read for MockBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(limit) = self.fail_after {
            if self.served >= limit {
                return Err(io::Error::new(ErrorKind::ConnectionReset, "stream reset"));
            }
        }
        if let Some((after, held)) = &self.hold {
            if self.served >= *after {
                if !self.holding {
                    self.holding = true;
                    held.fetch_add(1, Ordering::SeqCst);
                }
                thread::sleep(Duration::from_millis(1));
                return Err(io::Error::new(ErrorKind::Interrupted, "stalled"));
            }
        }
        if let Some(plan) = &self.cancel {
            if self.served >= plan.after {
                let deadline = Instant::now() + Duration::from_secs(5);
                while self.gate.load(Ordering::SeqCst) < plan.gate_bytes && Instant::now() < deadline {
                    thread::sleep(Duration::from_millis(2));
                }
                plan.handle.cancel();
                return Err(io::Error::new(ErrorKind::Interrupted, "paused"));
            }
        }

        let mut cap = buf.len();
        if let Some(limit) = self.fail_after {
            cap = cap.min(limit - self.served);
        }
        if let Some((after, _)) = &self.hold {
            cap = cap.min(after - self.served);
        }
        if let Some(plan) = &self.cancel {
            cap = cap.min(plan.after - self.served);
        }
        let read = self.inner.read(&mut buf[..cap])?;
        self.served += read;
        if let Some(counter) = &self.counter {
            counter.fetch_add(read as u64, Ordering::SeqCst);
        }
        Ok(read)
    }
}

fn test_config() -> EngineConfig {
    EngineConfig {
        retry_count: 3,
        retry_backoff: Duration::from_millis(5),
        poll_interval: Duration::from_millis(10),
        ..EngineConfig::default()
    }
}

fn engine(net: &MockNet) -> DownloadEngine {
    DownloadEngine::new(test_config())
        .unwrap()
        .with_net_client(net.boxed())
}

fn starts(requests: &[Option<ByteRange>]) -> Vec<u64> {
    let mut starts: Vec<u64> = requests
        .iter()
        .map(|range| range.map(|range| range.start).unwrap_or(0))
        .collect();
    starts.sort_unstable();
    starts
}

fn read(path: &Path) -> Vec<u8> {
    fs::read(path).unwrap()
}

#[test]
fn downloads_in_three_chunks() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone());

    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ticks);
    let view = Arc::new(ChunkedProgress::new());
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false)
        .on_progress(move |snapshot| sink.lock().unwrap().push(snapshot))
        .with_view(view.clone() as Arc<dyn ProgressView>);

    let report = engine(&net).run(&task).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(task.state(), TaskState::Completed);
    assert_eq!(report.chunk_count, 3);
    assert_eq!(report.committed_bytes, 1000);
    assert!(!report.degraded);
    assert_eq!(task.total_bytes_expected(), 1000);
    assert_eq!(read(&dest), body);
    assert_eq!(starts(&net.requests()), vec![0, 334, 667]);

    let ticks = ticks.lock().unwrap();
    assert_eq!(ticks.iter().map(|t| t.bytes_read_this_tick).sum::<u64>(), 1000);
    assert_eq!(ticks.iter().map(|t| t.total_bytes_read).max(), Some(1000));
    assert!(ticks.iter().all(|t| t.total_bytes_expected == 1000));

    assert_eq!(view.chunk_count(), 3);
    assert_eq!(view.overall_progress(), 1.0);
}

#[test]
fn completed_download_discards_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000));
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), true);

    engine.run(&task).unwrap();

    assert_eq!(engine.resume_record(URL).unwrap(), None);
}

#[test]
fn running_a_task_twice_is_rejected() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(10));
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false);

    engine.run(&task).unwrap();
    let err = engine.run(&task).unwrap_err();

    assert!(matches!(err, CoreError::InvalidState(_)));
    assert_eq!(task.state(), TaskState::Completed);
}

#[test]
fn resume_fetches_only_missing_bytes() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);

    let mut partial = vec![0u8; 1000];
    partial[..200].copy_from_slice(&body[..200]);
    fs::write(&dest, &partial).unwrap();

    let identity = ResourceIdentity {
        key: URL.to_string(),
        validator: Some(ETAG.to_string()),
    };
    let mut chunks = ChunkPlanner::default()
        .plan(Some(1000), ChunkSizeTier::Recommended, RangeSupport::Supported)
        .chunks;
    chunks[0].bytes_committed = 200;
    let mut store = MemoryStore::default();
    store
        .save(&ResumeRecord::from_chunks(&identity, 1000, false, &chunks).unwrap())
        .unwrap();

    let net = MockNet::new(body.clone());
    let engine = engine(&net).with_store(Box::new(store));
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, true);

    let report = engine.run(&task).unwrap();

    assert!(report.resumed);
    assert_eq!(report.committed_bytes, 1000);
    assert_eq!(read(&dest), body);
    let mut requests = net.requests();
    requests.sort_by_key(|range| range.map(|range| range.start));
    assert_eq!(
        requests,
        vec![
            Some(ByteRange { start: 200, end: Some(333) }),
            Some(ByteRange { start: 334, end: Some(666) }),
            Some(ByteRange { start: 667, end: Some(999) }),
        ]
    );
}

#[test]
fn resume_disabled_starts_over() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    fs::write(&dest, vec![7u8; 1000]).unwrap();

    let identity = ResourceIdentity {
        key: URL.to_string(),
        validator: Some(ETAG.to_string()),
    };
    let mut chunks = ChunkPlanner::default()
        .plan(Some(1000), ChunkSizeTier::Recommended, RangeSupport::Supported)
        .chunks;
    chunks[0].bytes_committed = 334;
    let mut store = MemoryStore::default();
    store
        .save(&ResumeRecord::from_chunks(&identity, 1000, false, &chunks).unwrap())
        .unwrap();

    let net = MockNet::new(body.clone());
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false);
    let report = engine(&net).with_store(Box::new(store)).run(&task).unwrap();

    assert!(!report.resumed);
    assert_eq!(read(&dest), body);
    assert_eq!(starts(&net.requests()), vec![0, 334, 667]);
}

#[test]
fn server_ignoring_ranges_degrades_to_one_chunk() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.ranges = false;
        state.accept_ranges = None;
    });

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let view = Arc::new(ChunkedProgress::new());
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false)
        .on_chunk_count_change(move |count| sink.lock().unwrap().push(count))
        .with_view(view.clone() as Arc<dyn ProgressView>);

    let report = engine(&net).run(&task).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert!(report.degraded);
    assert_eq!(report.chunk_count, 1);
    assert_eq!(*changes.lock().unwrap(), vec![1]);
    assert_eq!(view.chunk_count(), 1);
    assert_eq!(view.overall_progress(), 1.0);
    assert_eq!(read(&dest), body);
}

#[test]
fn degrade_keeps_committed_prefix() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);

    let mut partial = vec![0u8; 1000];
    partial[..200].copy_from_slice(&body[..200]);
    fs::write(&dest, &partial).unwrap();

    let identity = ResourceIdentity {
        key: URL.to_string(),
        validator: Some(ETAG.to_string()),
    };
    let mut chunks = ChunkPlanner::default()
        .plan(Some(1000), ChunkSizeTier::Recommended, RangeSupport::Unknown)
        .chunks;
    chunks[0].bytes_committed = 200;
    let mut store = MemoryStore::default();
    store
        .save(&ResumeRecord::from_chunks(&identity, 1000, false, &chunks).unwrap())
        .unwrap();

    let net = MockNet::new(body.clone()).configure(|state| {
        state.ranges = false;
        state.accept_ranges = None;
    });
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let ticks = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&ticks);
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .on_chunk_count_change(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .on_progress(move |snapshot| sink.lock().unwrap().push(snapshot));

    let report = engine(&net).with_store(Box::new(store)).run(&task).unwrap();

    assert!(report.degraded);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(read(&dest), body);
    // Only the 800 bytes after the kept prefix were written.
    let ticks = ticks.lock().unwrap();
    assert_eq!(ticks.iter().map(|t| t.bytes_read_this_tick).sum::<u64>(), 800);
    assert_eq!(
        net.requests().last().copied().flatten(),
        Some(ByteRange { start: 200, end: Some(999) })
    );
}

#[test]
fn short_single_stream_is_an_integrity_mismatch() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let net = MockNet::new(content(900)).configure(|state| {
        state.ranges = false;
        state.accept_ranges = Some(false);
        state.head_length = Some(Some(1000));
    });
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false);

    let err = engine.run(&task).unwrap_err();

    assert!(matches!(
        err,
        CoreError::IntegrityMismatch {
            expected: 1000,
            committed: 900
        }
    ));
    assert_eq!(task.state(), TaskState::Failed);
    assert_eq!(net.requests().len(), 1);
}

#[test]
fn transient_errors_are_retried() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.failing_gets = AtomicU32::new(2);
    });
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    let report = engine(&net).run(&task).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(net.requests().len(), 3);
    assert_eq!(read(&dest), body);
}

#[test]
fn broken_stream_resumes_from_committed_offset() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.flaky_bodies = AtomicU32::new(1);
        state.flaky_after = 100;
    });
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    engine(&net).run(&task).unwrap();

    assert_eq!(read(&dest), body);
    assert_eq!(
        net.requests(),
        vec![
            Some(ByteRange { start: 0, end: Some(999) }),
            Some(ByteRange { start: 100, end: Some(999) }),
        ]
    );
}

#[test]
fn terminal_status_fails_and_keeps_checkpoint() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000)).configure(|state| {
        state.status = Some(404);
    });
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false);

    let err = engine.run(&task).unwrap_err();

    assert!(matches!(err, CoreError::ChunkFailed { committed_bytes: 0, .. }));
    assert_eq!(task.state(), TaskState::Failed);
    let record = engine.resume_record(URL).unwrap().unwrap();
    assert_eq!(record.total_bytes, 1000);
    assert_eq!(record.chunks.len(), 3);
}

#[test]
fn retries_exhausted_reports_chunk_failure() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000)).configure(|state| {
        state.failing_gets = AtomicU32::new(100);
    });
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    let err = engine(&net).run(&task).unwrap_err();

    match err {
        CoreError::ChunkFailed { index, reason, .. } => {
            assert_eq!(index, 0);
            assert!(reason.contains("retries exhausted"));
        }
        other => panic!("unexpected error: {other}"),
    }
    // One first try plus three retries.
    assert_eq!(net.requests().len(), 4);
}

#[test]
fn cancel_then_resume_fetches_remaining_span() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone());
    let engine = engine(&net);

    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .with_maximum_chunk_size(ChunkSizeTier::Minimal);
    net.cancel_when(CancelPlan {
        range_start: 500,
        after: 100,
        gate_bytes: 500,
        handle: task.cancel_handle(),
    });

    let report = engine.run(&task).unwrap();

    assert_eq!(report.state, TaskState::Cancelled);
    assert_eq!(task.state(), TaskState::Cancelled);
    assert_eq!(report.committed_bytes, 600);
    let record = engine.resume_record(URL).unwrap().unwrap();
    let committed: Vec<u64> = record.chunks.iter().map(|c| c.bytes_committed).collect();
    assert_eq!(committed, vec![500, 100]);
    assert_eq!(&read(&dest)[..600], &body[..600]);

    let before = net.requests().len();
    let resumed = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .with_maximum_chunk_size(ChunkSizeTier::Minimal);
    let report = engine.run(&resumed).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert!(report.resumed);
    assert_eq!(read(&dest), body);
    assert_eq!(
        net.requests()[before..].to_vec(),
        vec![Some(ByteRange { start: 600, end: Some(999) })]
    );
    assert_eq!(engine.resume_record(URL).unwrap(), None);
}

#[test]
fn cancel_before_start_leaves_task_cancelled() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000));
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false);
    task.cancel();

    let report = engine(&net).run(&task).unwrap();

    assert_eq!(report.state, TaskState::Cancelled);
    assert_eq!(report.committed_bytes, 0);
    assert!(net.requests().is_empty());
}

#[test]
fn unknown_length_streams_to_end() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("stream.bin");
    let body = content(777);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.head_length = Some(None);
        state.accept_ranges = None;
        state.ranges = false;
        state.declare_length = false;
    });
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .with_maximum_chunk_size(ChunkSizeTier::Ludicrous);

    let report = engine.run(&task).unwrap();

    assert_eq!(report.chunk_count, 1);
    assert_eq!(report.total_bytes, Some(777));
    assert_eq!(task.total_bytes_expected(), 777);
    assert_eq!(read(&dest), body);
    // The open ranged probe learns nothing, so one plain GET streams it all.
    assert_eq!(
        net.requests(),
        vec![Some(ByteRange { start: 0, end: None }), None]
    );
    assert_eq!(engine.resume_record(URL).unwrap(), None);
}

#[test]
fn zero_length_resource_completes_without_fetching() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("empty.bin");
    let net = MockNet::new(Vec::new());
    let view = Arc::new(ChunkedProgress::new());
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false)
        .with_view(view.clone() as Arc<dyn ProgressView>);

    let report = engine(&net).run(&task).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert_eq!(report.committed_bytes, 0);
    assert_eq!(report.chunk_count, 1);
    assert_eq!(OutputFile::existing_len(&dest), Some(0));
    assert!(net.requests().is_empty());
}

#[test]
fn rejected_head_falls_back_to_ranged_get() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.head_status = 405;
    });
    let engine = engine(&net);

    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .with_maximum_chunk_size(ChunkSizeTier::Minimal);
    net.cancel_when(CancelPlan {
        range_start: 500,
        after: 100,
        gate_bytes: 500,
        handle: task.cancel_handle(),
    });

    let report = engine.run(&task).unwrap();

    assert_eq!(report.state, TaskState::Cancelled);
    assert_eq!(report.chunk_count, 2);
    assert_eq!(report.total_bytes, Some(1000));
    assert_eq!(net.requests()[0], Some(ByteRange { start: 0, end: None }));
    let record = engine.resume_record(URL).unwrap().unwrap();
    assert_eq!(record.validator.as_deref(), Some(ETAG));
    let committed: Vec<u64> = record.chunks.iter().map(|c| c.bytes_committed).collect();
    assert_eq!(committed, vec![500, 100]);

    let before = net.requests().len();
    let resumed = DownloadTask::new(DownloadRequest::new(URL), &dest, true)
        .with_maximum_chunk_size(ChunkSizeTier::Minimal);
    let report = engine.run(&resumed).unwrap();

    assert_eq!(report.state, TaskState::Completed);
    assert!(report.resumed);
    assert_eq!(read(&dest), body);
    assert_eq!(
        net.requests()[before..].to_vec(),
        vec![
            Some(ByteRange { start: 0, end: None }),
            Some(ByteRange { start: 600, end: Some(999) }),
        ]
    );
}

#[test]
fn content_range_total_must_match_planned_length() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000)).configure(|state| {
        state.range_total = Some(2000);
    });
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    let err = engine(&net).run(&task).unwrap_err();

    match err {
        CoreError::ChunkFailed { index, reason, .. } => {
            assert_eq!(index, 0);
            assert!(reason.contains("total 2000"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    // Terminal, so no retries.
    assert_eq!(net.requests().len(), 1);
}

#[test]
fn partial_reply_without_content_range_fails_chunk() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000)).configure(|state| {
        state.omit_content_range = true;
    });
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    let err = engine(&net).run(&task).unwrap_err();

    match err {
        CoreError::ChunkFailed { index, reason, .. } => {
            assert_eq!(index, 0);
            assert!(reason.contains("Content-Range"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(net.requests().len(), 1);
}

#[derive(Default)]
struct Recorded {
    current: Vec<f64>,
    per_chunk: Vec<Vec<f64>>,
    overall: Vec<f64>,
}

/// Keeps every value the engine pushes, in arrival order.
#[derive(Default)]
struct RecordingView {
    inner: Mutex<Recorded>,
}

impl ProgressView for RecordingView {
    fn set_chunks(&self, count: usize) {
        let mut recorded = self.inner.lock().unwrap();
        recorded.current = vec![0.0; count];
        recorded.per_chunk = vec![Vec::new(); count];
        recorded.overall.clear();
    }

    fn set_progress(&self, fraction: f64, chunk_index: usize) {
        let mut recorded = self.inner.lock().unwrap();
        if chunk_index >= recorded.current.len() {
            return;
        }
        recorded.current[chunk_index] = fraction;
        recorded.per_chunk[chunk_index].push(fraction);
        let mean = recorded.current.iter().sum::<f64>() / recorded.current.len() as f64;
        recorded.overall.push(mean);
    }

    fn progress_at_chunk_index(&self, chunk_index: usize) -> f64 {
        let recorded = self.inner.lock().unwrap();
        recorded.current.get(chunk_index).copied().unwrap_or(0.0)
    }

    fn overall_progress(&self) -> f64 {
        self.inner.lock().unwrap().overall.last().copied().unwrap_or(0.0)
    }
}

fn non_decreasing(values: &[f64]) -> bool {
    values.windows(2).all(|pair| pair[0] <= pair[1])
}

#[test]
fn progress_never_goes_backwards() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000));
    let engine = DownloadEngine::new(EngineConfig {
        buffer_size: 16,
        ..test_config()
    })
    .unwrap()
    .with_net_client(net.boxed());
    let view = Arc::new(RecordingView::default());
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), false)
        .with_view(view.clone() as Arc<dyn ProgressView>);

    engine.run(&task).unwrap();

    let recorded = view.inner.lock().unwrap();
    assert_eq!(recorded.per_chunk.len(), 3);
    for history in &recorded.per_chunk {
        // 16-byte blocks over a 333/334-byte span.
        assert!(history.len() >= 20);
        assert!(non_decreasing(history));
        assert_eq!(history.last().copied(), Some(1.0));
    }
    assert!(non_decreasing(&recorded.overall));
    assert_eq!(recorded.overall.last().copied(), Some(1.0));
}

#[test]
fn failed_chunk_stops_stalled_siblings() {
    let dir = tempfile::TempDir::new().unwrap();
    let dest = dir.path().join("archive.bin");
    let body = content(1000);
    let net = MockNet::new(body.clone()).configure(|state| {
        state.hold_after = Some(100);
        state.fail_start = Some((667, 2));
    });
    let engine = engine(&net);
    let task = DownloadTask::new(DownloadRequest::new(URL), &dest, false);

    let err = engine.run(&task).unwrap_err();

    match err {
        CoreError::ChunkFailed {
            index,
            committed_bytes,
            reason,
        } => {
            assert_eq!(index, 2);
            assert_eq!(committed_bytes, 0);
            assert!(reason.contains("404"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(task.state(), TaskState::Failed);
    // Both siblings were mid-body when the failure arrived.
    assert_eq!(net.state.held.load(Ordering::SeqCst), 2);
    assert_eq!(net.requests().len(), 3);

    let record = engine.resume_record(URL).unwrap().unwrap();
    let committed: Vec<u64> = record.chunks.iter().map(|c| c.bytes_committed).collect();
    assert_eq!(committed, vec![100, 100, 0]);
    let written = read(&dest);
    assert_eq!(&written[..100], &body[..100]);
    assert_eq!(&written[334..434], &body[334..434]);
}

#[test]
fn slow_transfer_checkpoints_after_period() {
    let dir = tempfile::TempDir::new().unwrap();
    let net = MockNet::new(content(1000)).configure(|state| {
        state.hold_after = Some(100);
    });
    let engine = DownloadEngine::new(EngineConfig {
        checkpoint_period: Duration::from_millis(20),
        ..test_config()
    })
    .unwrap()
    .with_net_client(net.boxed());
    let task = DownloadTask::new(DownloadRequest::new(URL), dir.path().join("a.bin"), true)
        .with_maximum_chunk_size(ChunkSizeTier::Single);

    let (saved, report) = thread::scope(|scope| {
        let run = scope.spawn(|| engine.run(&task));
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut saved = None;
        while Instant::now() < deadline {
            if let Some(record) = engine.resume_record(URL).unwrap() {
                if record.committed_bytes() == 100 {
                    saved = Some((record, task.state()));
                    break;
                }
            }
            thread::sleep(Duration::from_millis(5));
        }
        task.cancel();
        (saved, run.join().unwrap())
    });

    // Far below `checkpoint_bytes`, yet saved while still downloading.
    let (record, state) = saved.expect("no checkpoint while stalled");
    assert_eq!(state, TaskState::Downloading);
    assert_eq!(record.chunks[0].bytes_committed, 100);
    assert_eq!(report.unwrap().state, TaskState::Cancelled);
}
