use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use engine_logging::engine_task_log;

use crate::catalog::{Catalog, NewFailedImage};
use crate::{now_ms, CrawlError, DownloadJob, FailedImageRecord};

/// Bookkeeping for failed downloads: records placeholders and builds retry jobs.
///
/// Direct downloads are cleared by the catalog once the retried image is registered.
/// Archives register their entries under other URLs and are cleared with [`clear`](Self::clear).
#[derive(Clone)]
pub struct FailureTracker {
    catalog: Arc<dyn Catalog>,
}

impl FailureTracker {
    pub fn new(catalog: Arc<dyn Catalog>) -> Self {
        Self { catalog }
    }

    /// Appends a record for `job`, or refreshes the existing one for the same task and URL.
    pub fn record_failure(
        &self,
        job: &DownloadJob,
        error: &str,
    ) -> Result<FailedImageRecord, CrawlError> {
        let now = now_ms();
        let record = match self.catalog.find_failed_image(&job.task_id, &job.url)? {
            Some(mut existing) => {
                existing.last_error = Some(error.to_string());
                existing.last_attempted_at = Some(now);
                self.catalog.update_failed_image(&existing)?;
                existing
            }
            None => self.catalog.add_failed_image(NewFailedImage {
                task_id: job.task_id.clone(),
                plugin_id: job.plugin_id.clone(),
                url: job.url.clone(),
                order: job.download_start_time,
                created_at: now,
                last_error: Some(error.to_string()),
                output_album_id: job.output_album_id.clone(),
            })?,
        };
        engine_task_log!(
            log::Level::Warn,
            job.task_id,
            "download failed for {} (placeholder {}): {}",
            job.url,
            record.id,
            error
        );
        Ok(record)
    }

    pub fn failed_images(&self, task_id: &str) -> Result<Vec<FailedImageRecord>, CrawlError> {
        Ok(self.catalog.failed_images(task_id)?)
    }

    pub fn get(&self, failed_id: u64) -> Result<FailedImageRecord, CrawlError> {
        self.catalog
            .get_failed_image(failed_id)?
            .ok_or(CrawlError::FailedImageNotFound(failed_id))
    }

    /// Removes the record for `task_id` and `url`, if any.
    pub fn clear(&self, task_id: &str, url: &str) -> Result<bool, CrawlError> {
        let Some(record) = self.catalog.find_failed_image(task_id, url)? else {
            return Ok(false);
        };
        let removed = self.catalog.remove_failed_image(record.id)?;
        if removed {
            engine_task_log!(log::Level::Debug, task_id, "cleared placeholder {}", record.id);
        }
        Ok(removed)
    }

    /// Marks a record as being retried and returns it.
    pub fn begin_retry(&self, failed_id: u64) -> Result<FailedImageRecord, CrawlError> {
        let mut record = self.get(failed_id)?;
        record.last_attempted_at = Some(now_ms());
        self.catalog.update_failed_image(&record)?;
        Ok(record)
    }

    /// The single download job a retry re-issues. It keeps the record's `order`
    /// as its start time so the image lands in its original position.
    pub fn retry_job(
        record: &FailedImageRecord,
        destination_dir: PathBuf,
        http_headers: BTreeMap<String, String>,
    ) -> DownloadJob {
        DownloadJob {
            url: record.url.clone(),
            task_id: record.task_id.clone(),
            plugin_id: record.plugin_id.clone(),
            destination_dir,
            http_headers,
            download_start_time: record.order,
            output_album_id: record.output_album_id.clone(),
            file_name_hint: None,
        }
    }
}
