use std::path::{Path, PathBuf};
use std::sync::Arc;

use engine_logging::{engine_error, engine_task_log};

use crate::catalog::{Catalog, CatalogImage};
use crate::failures::FailureTracker;
use crate::filename::{safe_image_filename, unique_path};
use crate::persist::ensure_output_dir;
use crate::{
    CrawlError, DownloadJob, DownloadState, DownloadStateEvent, EngineEvent, EventSink,
};

/// Per-file tail of every download: catalog registration, failure placeholders
/// and the download-state events the UI follows.
pub struct Registrar {
    catalog: Arc<dyn Catalog>,
    failures: FailureTracker,
    sink: Arc<dyn EventSink>,
}

impl Registrar {
    pub fn new(catalog: Arc<dyn Catalog>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            failures: FailureTracker::new(catalog.clone()),
            catalog,
            sink,
        }
    }

    pub fn failures(&self) -> &FailureTracker {
        &self.failures
    }

    pub fn sink(&self) -> &Arc<dyn EventSink> {
        &self.sink
    }

    pub fn emit_state(&self, job: &DownloadJob, state: DownloadState, error: Option<String>) {
        self.sink.emit(EngineEvent::DownloadState(DownloadStateEvent {
            task_id: job.task_id.clone(),
            plugin_id: job.plugin_id.clone(),
            url: job.url.clone(),
            start_time: job.download_start_time,
            state,
            error,
        }));
    }

    /// Registers a file that already sits at its final path.
    pub fn complete(&self, job: &DownloadJob, path: &Path) -> Result<(), CrawlError> {
        self.register(job, &job.url, path)?;
        self.emit_state(job, DownloadState::Completed, None);
        Ok(())
    }

    /// Copies a file extracted from an archive into the job's images directory and
    /// registers it under `entry_url`. Extracted files are local and skip admission.
    pub async fn register_extracted(
        &self,
        job: &DownloadJob,
        source: &Path,
        entry_url: &str,
    ) -> Result<PathBuf, CrawlError> {
        ensure_output_dir(&job.destination_dir)?;
        let hint = source.file_name().and_then(|name| name.to_str());
        let target = unique_path(&job.destination_dir, &safe_image_filename(hint, entry_url));
        tokio::fs::copy(source, &target).await?;
        self.register(job, entry_url, &target)?;
        Ok(target)
    }

    /// Turns a failed attempt into a placeholder and tells the UI.
    pub fn fail(&self, job: &DownloadJob, error: &CrawlError) {
        let message = error.to_string();
        if let Err(err) = self.failures.record_failure(job, &message) {
            engine_error!("could not record failed download {}: {}", job.url, err);
        }
        self.emit_state(job, DownloadState::Failed, Some(message));
    }

    fn register(&self, job: &DownloadJob, url: &str, path: &Path) -> Result<(), CrawlError> {
        self.catalog.register_image(CatalogImage {
            task_id: job.task_id.clone(),
            plugin_id: job.plugin_id.clone(),
            url: url.to_string(),
            path: path.to_path_buf(),
            order: job.download_start_time,
            output_album_id: job.output_album_id.clone(),
        })?;
        engine_task_log!(log::Level::Debug, job.task_id, "registered {}", path.display());
        Ok(())
    }
}
