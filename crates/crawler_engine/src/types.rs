use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crawler_core::{TaskId, TaskStatus};
use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}

/// What the host asks the engine to run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TaskRequest {
    pub task_id: TaskId,
    pub plugin_id: String,
    /// Images directory; defaults to `<default_images_dir>/<plugin_id>`.
    pub output_dir: Option<PathBuf>,
    /// Per-task user-configured headers. Names are matched case-insensitively.
    pub http_headers: BTreeMap<String, String>,
    pub output_album_id: Option<String>,
    pub max_concurrency: Option<usize>,
    pub interval_ms: Option<u64>,
    /// Free-form plugin configuration handed to the script.
    pub user_config: serde_json::Value,
}

impl TaskRequest {
    pub fn new(task_id: impl Into<TaskId>, plugin_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            plugin_id: plugin_id.into(),
            ..Self::default()
        }
    }
}

/// One image download, created per script call and consumed by admission and the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadJob {
    pub url: String,
    pub task_id: TaskId,
    pub plugin_id: String,
    pub destination_dir: PathBuf,
    pub http_headers: BTreeMap<String, String>,
    pub download_start_time: u64,
    pub output_album_id: Option<String>,
    pub file_name_hint: Option<String>,
}

/// Placeholder for an image whose download failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedImageRecord {
    pub id: u64,
    pub task_id: TaskId,
    pub plugin_id: String,
    pub url: String,
    /// Fixed at creation; retries never change it.
    pub order: u64,
    pub created_at: u64,
    pub last_error: Option<String>,
    pub last_attempted_at: Option<u64>,
    #[serde(default)]
    pub output_album_id: Option<String>,
}

/// Returned by `prepare_download`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareOutcome {
    pub use_native_interception: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadState {
    Preparing,
    Downloading,
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            DownloadState::Preparing => "preparing",
            DownloadState::Downloading => "downloading",
            DownloadState::Processing => "processing",
            DownloadState::Completed => "completed",
            DownloadState::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadStateEvent {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub url: String,
    pub start_time: u64,
    pub state: DownloadState,
    pub error: Option<String>,
}

/// A download currently between admission and completion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveDownload {
    pub task_id: TaskId,
    pub plugin_id: String,
    pub url: String,
    pub start_time: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    TaskStatus {
        task_id: TaskId,
        status: TaskStatus,
        progress: f64,
        error: Option<String>,
    },
    TaskProgress {
        task_id: TaskId,
        progress: f64,
    },
    TaskRemoved {
        task_id: TaskId,
    },
    DownloadState(DownloadStateEvent),
    ArchiverLog {
        task_id: Option<TaskId>,
        archive_path: PathBuf,
        message: String,
    },
}

/// Receives engine events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

pub struct ChannelEventSink {
    tx: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
}

impl ChannelEventSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelEventSink {
    fn emit(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}
