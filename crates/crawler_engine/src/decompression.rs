use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crawler_core::TaskId;
use engine_logging::{engine_debug, engine_info, engine_task_log, engine_warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::archive::{is_image_path, ArchiveExtractor};
use crate::registrar::Registrar;
use crate::temp_dir::TempDirGuard;
use crate::{CrawlError, DownloadJob, DownloadState, EngineEvent};

/// Task and plugin id used for archives imported from the local filesystem.
pub const LOCAL_IMPORT_ID: &str = "local-import";

/// Result of a local import. The receiver owns the guard and must keep it alive
/// until every image has been copied somewhere permanent.
#[derive(Debug)]
pub struct ImportedArchive {
    pub images: Vec<PathBuf>,
    pub guard: TempDirGuard,
}

pub type ImportReply = oneshot::Sender<Result<ImportedArchive, CrawlError>>;

pub struct DecompressionJob {
    pub archive_path: PathBuf,
    pub original_url: String,
    pub task_id: TaskId,
    pub plugin_id: String,
    /// Jobs whose token is cancelled before they are dequeued are dropped.
    pub cancel: CancellationToken,
    pub kind: DecompressionKind,
}

pub enum DecompressionKind {
    /// Extract next to the archive, then register every image like a direct download.
    CrawlerDownload {
        images_dir: PathBuf,
        http_headers: BTreeMap<String, String>,
        output_album_id: Option<String>,
        download_start_time: u64,
        temp_dir_guard: Option<TempDirGuard>,
    },
    /// Extract into a fresh guarded directory and reply exactly once.
    LocalImport { reply: ImportReply },
}

impl DecompressionJob {
    fn download_job(&self) -> Option<DownloadJob> {
        match &self.kind {
            DecompressionKind::CrawlerDownload {
                images_dir,
                http_headers,
                output_album_id,
                download_start_time,
                ..
            } => Some(DownloadJob {
                url: self.original_url.clone(),
                task_id: self.task_id.clone(),
                plugin_id: self.plugin_id.clone(),
                destination_dir: images_dir.clone(),
                http_headers: http_headers.clone(),
                download_start_time: *download_start_time,
                output_album_id: output_album_id.clone(),
                file_name_hint: None,
            }),
            DecompressionKind::LocalImport { .. } => None,
        }
    }
}

/// Sending side of the single decompression queue shared by both job kinds.
#[derive(Clone)]
pub struct DecompressionQueue {
    tx: mpsc::UnboundedSender<DecompressionJob>,
}

impl DecompressionQueue {
    pub fn submit(&self, job: DecompressionJob) -> Result<(), CrawlError> {
        self.tx.send(job).map_err(|rejected| {
            if let DecompressionKind::LocalImport { reply } = rejected.0.kind {
                let _ = reply.send(Err(CrawlError::EngineStopped));
            }
            CrawlError::EngineStopped
        })
    }
}

/// Single consumer of the decompression queue. Runs apart from admission so a
/// slow archive never holds up unrelated downloads.
pub struct DecompressionWorker {
    extractor: Arc<dyn ArchiveExtractor>,
    registrar: Arc<Registrar>,
    temp_root: PathBuf,
}

impl DecompressionWorker {
    pub fn new(
        extractor: Arc<dyn ArchiveExtractor>,
        registrar: Arc<Registrar>,
        temp_root: PathBuf,
    ) -> Self {
        Self {
            extractor,
            registrar,
            temp_root,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> (DecompressionQueue, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx, shutdown));
        (DecompressionQueue { tx }, handle)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<DecompressionJob>, shutdown: CancellationToken) {
        engine_debug!("decompression worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.handle(job).await;
        }

        // Drain: queued jobs are still extracted unless their task was cancelled.
        rx.close();
        while let Ok(job) = rx.try_recv() {
            self.handle(job).await;
        }
        engine_debug!("decompression worker stopped");
    }

    async fn handle(&self, job: DecompressionJob) {
        if job.cancel.is_cancelled() {
            self.discard(job);
        } else {
            self.process(job).await;
        }
    }

    async fn process(&self, job: DecompressionJob) {
        let download_job = job.download_job();
        match job.kind {
            DecompressionKind::CrawlerDownload {
                temp_dir_guard, ..
            } => {
                let Some(download_job) = download_job else {
                    return;
                };
                let Some(dir) = job.archive_path.parent().map(Path::to_path_buf) else {
                    self.registrar.fail(
                        &download_job,
                        &CrawlError::ExtractionFailed("archive has no parent directory".into()),
                    );
                    return;
                };
                self.extract_and_register(&download_job, &job.archive_path, &dir)
                    .await;
                // The scratch directory lives until every file has been copied out.
                drop(temp_dir_guard);
            }
            DecompressionKind::LocalImport { reply } => {
                let result = self.import(&job.archive_path).await;
                if let Err(err) = &result {
                    self.archiver_log(None, &job.archive_path, err.to_string());
                }
                if reply.send(result).is_err() {
                    engine_warn!(
                        "{} for import of {}",
                        CrawlError::ReplyChannelClosed,
                        job.archive_path.display()
                    );
                }
            }
        }
    }

    async fn extract_and_register(&self, job: &DownloadJob, archive: &Path, dir: &Path) {
        let files = match self.extract(archive, dir).await {
            Ok(files) => files,
            Err(err) => {
                self.archiver_log(Some(&job.task_id), archive, err.to_string());
                self.registrar.fail(job, &err);
                return;
            }
        };

        let mut registered = 0usize;
        for file in files.iter().filter(|file| is_image_path(file)) {
            let relative = file.strip_prefix(dir).unwrap_or(file);
            let entry_url = format!(
                "{}#{}",
                job.url,
                relative.to_string_lossy().replace('\\', "/")
            );
            match self.registrar.register_extracted(job, file, &entry_url).await {
                Ok(_) => registered += 1,
                Err(err) => self.archiver_log(
                    Some(&job.task_id),
                    archive,
                    format!("could not register {}: {err}", relative.display()),
                ),
            }
        }

        if registered == 0 {
            let err = CrawlError::ExtractionFailed("archive contained no usable images".into());
            self.archiver_log(Some(&job.task_id), archive, err.to_string());
            self.registrar.fail(job, &err);
            return;
        }
        engine_task_log!(
            log::Level::Info,
            job.task_id,
            "registered {} images from {}",
            registered,
            job.url
        );
        // Entries are registered under `<url>#<entry>`, so the archive's own
        // placeholder is not matched by the catalog.
        if let Err(err) = self.registrar.failures().clear(&job.task_id, &job.url) {
            engine_warn!("could not clear placeholder for {}: {}", job.url, err);
        }
        self.registrar.emit_state(job, DownloadState::Completed, None);
    }

    async fn import(&self, archive: &Path) -> Result<ImportedArchive, CrawlError> {
        let guard = TempDirGuard::create_in(&self.temp_root)?;
        match self.extract(archive, guard.path()).await {
            Ok(files) => Ok(ImportedArchive {
                images: files.into_iter().filter(|file| is_image_path(file)).collect(),
                guard,
            }),
            Err(err) => {
                // Remove the directory before the caller hears about the failure.
                drop(guard);
                Err(err)
            }
        }
    }

    async fn extract(&self, archive: &Path, destination: &Path) -> Result<Vec<PathBuf>, CrawlError> {
        let extractor = self.extractor.clone();
        let archive = archive.to_path_buf();
        let destination = destination.to_path_buf();
        tokio::task::spawn_blocking(move || extractor.extract(&archive, &destination))
            .await
            .map_err(|err| CrawlError::ExtractionFailed(err.to_string()))?
            .map_err(CrawlError::from)
    }

    /// Drops a job whose task was cancelled before the job was dequeued. Crawler
    /// archives become placeholders so they can be retried later.
    fn discard(&self, job: DecompressionJob) {
        let reason = CrawlError::ExtractionFailed("cancelled before extraction".to_string());
        engine_info!(
            "dropping decompression job for {}: {}",
            job.archive_path.display(),
            reason
        );
        let download_job = job.download_job();
        match job.kind {
            DecompressionKind::CrawlerDownload { .. } => {
                if let Some(download_job) = download_job {
                    self.registrar.fail(&download_job, &reason);
                }
            }
            DecompressionKind::LocalImport { reply } => {
                if reply.send(Err(reason)).is_err() {
                    engine_warn!("{}", CrawlError::ReplyChannelClosed);
                }
            }
        }
    }

    fn archiver_log(&self, task_id: Option<&str>, archive: &Path, message: String) {
        engine_warn!("archive {}: {}", archive.display(), message);
        self.registrar.sink().emit(EngineEvent::ArchiverLog {
            task_id: task_id.map(str::to_string),
            archive_path: archive.to_path_buf(),
            message,
        });
    }
}
