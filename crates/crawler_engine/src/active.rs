use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use crawler_core::TaskId;
use tokio_util::sync::CancellationToken;

use crate::headers::HeaderRules;
use crate::script::CrawlPlugin;
use crate::{now_ms, CrawlError, DownloadJob, TaskRequest};

/// Context of the task that currently holds the execution slot.
///
/// The HTTP client and its cookie jar belong to this run only and are
/// dropped with it.
pub struct ActiveTask {
    pub request: TaskRequest,
    pub client: reqwest::Client,
    pub headers: HeaderRules,
    pub images_dir: PathBuf,
    pub cancel: CancellationToken,
    pub plugin: Arc<dyn CrawlPlugin>,
}

impl ActiveTask {
    pub fn task_id(&self) -> &str {
        &self.request.task_id
    }

    pub fn plugin_id(&self) -> &str {
        &self.request.plugin_id
    }

    pub fn download_job(&self, url: &str, file_name_hint: Option<&str>) -> DownloadJob {
        DownloadJob {
            url: url.to_string(),
            task_id: self.request.task_id.clone(),
            plugin_id: self.request.plugin_id.clone(),
            destination_dir: self.images_dir.clone(),
            http_headers: self.request.http_headers.clone(),
            download_start_time: now_ms(),
            output_album_id: self.request.output_album_id.clone(),
            file_name_hint: file_name_hint.map(str::to_string),
        }
    }
}

/// Process-wide "current task", shared by the proxy and the download path.
///
/// Set when a task is promoted, cleared when its run ends.
#[derive(Clone, Default)]
pub struct ActiveTaskSlot {
    inner: Arc<RwLock<Option<Arc<ActiveTask>>>>,
}

impl ActiveTaskSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<ActiveTask>> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// The active task, if it is `task_id`.
    pub fn require(&self, task_id: &str) -> Result<Arc<ActiveTask>, CrawlError> {
        self.current()
            .filter(|task| task.task_id() == task_id)
            .ok_or_else(|| CrawlError::TaskNotRunning(task_id.to_string()))
    }

    pub fn current_id(&self) -> Option<TaskId> {
        self.current().map(|task| task.task_id().to_string())
    }

    pub(crate) fn set(&self, task: Arc<ActiveTask>) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    /// Clears the slot if it still belongs to `task_id`.
    pub(crate) fn clear(&self, task_id: &str) -> Option<Arc<ActiveTask>> {
        let mut slot = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.as_ref().is_some_and(|task| task.task_id() == task_id) {
            slot.take()
        } else {
            None
        }
    }
}
