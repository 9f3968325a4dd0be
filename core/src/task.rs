use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::chunk::ChunkSizeTier;
use crate::error::{CoreError, CoreResult};
use crate::net::DownloadRequest;
use crate::progress::{ChunkCountCallback, ProgressCallback, ProgressSnapshot};
use crate::view::ProgressView;

pub type TaskId = Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum TaskState {
    Idle,
    Planning,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Planning => "planning",
            TaskState::Downloading => "downloading",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "idle" => Some(TaskState::Idle),
            "planning" => Some(TaskState::Planning),
            "downloading" => Some(TaskState::Downloading),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    fn can_move_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Idle, TaskState::Planning)
                | (TaskState::Planning, TaskState::Downloading)
                | (TaskState::Planning, TaskState::Failed)
                | (TaskState::Planning, TaskState::Cancelled)
                | (TaskState::Downloading, TaskState::Completed)
                | (TaskState::Downloading, TaskState::Failed)
                | (TaskState::Downloading, TaskState::Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

pub struct DownloadTask {
    id: TaskId,
    request: DownloadRequest,
    dest_path: PathBuf,
    should_resume: bool,
    maximum_chunk_size: Option<ChunkSizeTier>,
    total_bytes_expected: AtomicI64,
    state: Mutex<TaskState>,
    cancel: CancelHandle,
    progress_callback: Option<ProgressCallback>,
    chunk_count_callback: Option<ChunkCountCallback>,
    view: Option<Arc<dyn ProgressView>>,
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("url", &self.request.url)
            .field("dest_path", &self.dest_path)
            .field("should_resume", &self.should_resume)
            .field("maximum_chunk_size", &self.maximum_chunk_size)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl DownloadTask {
    pub fn new(request: DownloadRequest, dest_path: impl Into<PathBuf>, should_resume: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            request,
            dest_path: dest_path.into(),
            should_resume,
            maximum_chunk_size: None,
            total_bytes_expected: AtomicI64::new(-1),
            state: Mutex::new(TaskState::Idle),
            cancel: CancelHandle::default(),
            progress_callback: None,
            chunk_count_callback: None,
            view: None,
        }
    }

    pub fn with_maximum_chunk_size(mut self, tier: ChunkSizeTier) -> Self {
        self.maximum_chunk_size = Some(tier);
        self
    }

    pub fn on_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ProgressSnapshot) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Arc::new(callback));
        self
    }

    pub fn on_chunk_count_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.chunk_count_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_view(mut self, view: Arc<dyn ProgressView>) -> Self {
        self.view = Some(view);
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn request(&self) -> &DownloadRequest {
        &self.request
    }

    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    pub fn should_resume(&self) -> bool {
        self.should_resume
    }

    pub fn maximum_chunk_size(&self) -> Option<ChunkSizeTier> {
        self.maximum_chunk_size
    }

    pub fn total_bytes_expected(&self) -> i64 {
        self.total_bytes_expected.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> TaskState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(TaskState::Failed)
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn progress_callback(&self) -> Option<ProgressCallback> {
        self.progress_callback.clone()
    }

    pub(crate) fn chunk_count_callback(&self) -> Option<ChunkCountCallback> {
        self.chunk_count_callback.clone()
    }

    pub(crate) fn view(&self) -> Option<Arc<dyn ProgressView>> {
        self.view.clone()
    }

    pub(crate) fn set_total_bytes_expected(&self, total: Option<u64>) {
        let value = total
            .map(|total| i64::try_from(total).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        self.total_bytes_expected.store(value, Ordering::SeqCst);
    }

    pub(crate) fn transition(&self, next: TaskState) -> CoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| CoreError::InvalidState("task state lock poisoned".to_string()))?;
        if !state.can_move_to(next) {
            return Err(CoreError::InvalidState(format!(
                "cannot move task from {} to {}",
                state, next
            )));
        }
        *state = next;
        Ok(())
    }
}
