use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crawler_core::TaskId;
use engine_logging::{engine_debug, engine_task_log};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::active::ActiveTaskSlot;
use crate::admission::{AdmissionLimits, AdmissionTicket, DownloadAdmission};
use crate::archive::is_archive_url;
use crate::config::EngineConfig;
use crate::decompression::{
    DecompressionJob, DecompressionKind, DecompressionQueue, ImportedArchive, LOCAL_IMPORT_ID,
};
use crate::failures::FailureTracker;
use crate::fetch::{build_task_client, DownloadExecutor};
use crate::filename::{safe_image_filename, unique_path};
use crate::persist::ensure_output_dir;
use crate::registrar::Registrar;
use crate::temp_dir::TempDirGuard;
use crate::{
    ActiveDownload, CrawlError, DownloadJob, DownloadState, FailureKind, FetchError,
    PrepareOutcome, TaskRequest,
};

/// URLs of this form are refused before admission; the rest is the reason.
pub const REJECT_PREFIX: &str = "reject:";

const RETRY_LIMITS: AdmissionLimits = AdmissionLimits {
    max_concurrency: 1,
    interval_ms: 0,
};

#[derive(Debug, Clone, Copy)]
struct Route {
    allow_native: bool,
    archive: bool,
}

/// Downloads between admission and completion.
#[derive(Clone, Default)]
struct ActiveDownloads {
    entries: Arc<Mutex<BTreeMap<u64, ActiveDownload>>>,
    next_id: Arc<AtomicU64>,
}

impl ActiveDownloads {
    fn entries(&self) -> MutexGuard<'_, BTreeMap<u64, ActiveDownload>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn track(&self, job: &DownloadJob) -> TrackedDownload {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().insert(
            id,
            ActiveDownload {
                task_id: job.task_id.clone(),
                plugin_id: job.plugin_id.clone(),
                url: job.url.clone(),
                start_time: job.download_start_time,
            },
        );
        TrackedDownload {
            id,
            registry: self.clone(),
        }
    }

    fn snapshot(&self) -> Vec<ActiveDownload> {
        self.entries().values().cloned().collect()
    }
}

struct TrackedDownload {
    id: u64,
    registry: ActiveDownloads,
}

impl Drop for TrackedDownload {
    fn drop(&mut self) {
        self.registry.entries().remove(&self.id);
    }
}

/// Admission for retries of tasks that are not running. A task's gate stays open
/// while at least one of its retries holds a lease.
#[derive(Clone)]
struct RetryGates {
    admission: DownloadAdmission,
    leases: Arc<Mutex<HashMap<TaskId, usize>>>,
}

impl RetryGates {
    fn new() -> Self {
        Self {
            admission: DownloadAdmission::new(false),
            leases: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn leases(&self) -> MutexGuard<'_, HashMap<TaskId, usize>> {
        self.leases.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, task_id: &str) -> RetryLease {
        let mut leases = self.leases();
        let count = leases.entry(task_id.to_string()).or_insert(0);
        if *count == 0 {
            self.admission
                .open(task_id, RETRY_LIMITS, CancellationToken::new());
        }
        *count += 1;
        RetryLease {
            gates: self.clone(),
            task_id: task_id.to_string(),
        }
    }

    fn release(&self, task_id: &str) {
        let mut leases = self.leases();
        let Some(count) = leases.get_mut(task_id) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            leases.remove(task_id);
            self.admission.close(task_id);
        }
    }
}

struct RetryLease {
    gates: RetryGates,
    task_id: TaskId,
}

impl Drop for RetryLease {
    fn drop(&mut self) {
        self.gates.release(&self.task_id);
    }
}

/// A download handed to the host's native download path. The ticket keeps the
/// admission slot until the host reports the download finished.
struct Interception {
    job: DownloadJob,
    destination: PathBuf,
    _ticket: AdmissionTicket,
    _tracked: TrackedDownload,
}

/// Everything between a script's download call and the catalog.
pub(crate) struct Downloader {
    config: EngineConfig,
    admission: DownloadAdmission,
    retry_gates: RetryGates,
    executor: Arc<dyn DownloadExecutor>,
    registrar: Arc<Registrar>,
    decompression: DecompressionQueue,
    slot: ActiveTaskSlot,
    interceptions: Mutex<HashMap<String, Interception>>,
    active: ActiveDownloads,
}

impl Downloader {
    pub(crate) fn new(
        config: EngineConfig,
        admission: DownloadAdmission,
        executor: Arc<dyn DownloadExecutor>,
        registrar: Arc<Registrar>,
        decompression: DecompressionQueue,
        slot: ActiveTaskSlot,
    ) -> Self {
        Self {
            config,
            admission,
            retry_gates: RetryGates::new(),
            executor,
            registrar,
            decompression,
            slot,
            interceptions: Mutex::new(HashMap::new()),
            active: ActiveDownloads::default(),
        }
    }

    pub(crate) fn admission(&self) -> &DownloadAdmission {
        &self.admission
    }

    pub(crate) fn failures(&self) -> &FailureTracker {
        self.registrar.failures()
    }

    pub(crate) fn active_downloads(&self) -> Vec<ActiveDownload> {
        self.active.snapshot()
    }

    fn interceptions(&self) -> MutexGuard<'_, HashMap<String, Interception>> {
        self.interceptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admits and runs one image download for the running task.
    pub(crate) async fn prepare_download(
        self: &Arc<Self>,
        task_id: &str,
        plugin_id: &str,
        url: &str,
        file_name: Option<&str>,
    ) -> Result<PrepareOutcome, CrawlError> {
        if let Some(reason) = url.strip_prefix(REJECT_PREFIX) {
            engine_task_log!(log::Level::Info, task_id, "rejected {}", url);
            return Err(CrawlError::Rejected(reason.trim().to_string()));
        }
        let task = self.slot.require(task_id)?;
        let mut job = task.download_job(url, file_name);
        job.plugin_id = plugin_id.to_string();
        let route = Route {
            allow_native: true,
            archive: is_archive_url(url),
        };
        self.admit_and_run(&self.admission, task.client.clone(), job, task.cancel.clone(), route)
            .await
    }

    /// Admits and downloads an archive, then queues it for extraction.
    pub(crate) async fn download_archive(
        self: &Arc<Self>,
        task_id: &str,
        url: &str,
    ) -> Result<(), CrawlError> {
        if let Some(reason) = url.strip_prefix(REJECT_PREFIX) {
            return Err(CrawlError::Rejected(reason.trim().to_string()));
        }
        let task = self.slot.require(task_id)?;
        let job = task.download_job(url, None);
        let route = Route {
            allow_native: false,
            archive: true,
        };
        self.admit_and_run(&self.admission, task.client.clone(), job, task.cancel.clone(), route)
            .await
            .map(|_| ())
    }

    /// Re-issues the download behind a failed-image record.
    ///
    /// A running task's retry shares its gate, client and cancellation. Otherwise a
    /// fresh client and a single-slot retry gate are used.
    pub(crate) async fn retry_failed(
        self: &Arc<Self>,
        failed_id: u64,
        known_request: Option<TaskRequest>,
    ) -> Result<(), CrawlError> {
        let record = self.failures().begin_retry(failed_id)?;
        let route = Route {
            allow_native: false,
            archive: is_archive_url(&record.url),
        };
        engine_task_log!(log::Level::Info, record.task_id, "retrying {}", record.url);

        if let Ok(task) = self.slot.require(&record.task_id) {
            let job = FailureTracker::retry_job(
                &record,
                task.images_dir.clone(),
                task.request.http_headers.clone(),
            );
            return self
                .admit_and_run(&self.admission, task.client.clone(), job, task.cancel.clone(), route)
                .await
                .map(|_| ());
        }

        let request = known_request
            .unwrap_or_else(|| TaskRequest::new(record.task_id.clone(), record.plugin_id.clone()));
        let job = FailureTracker::retry_job(
            &record,
            self.config.images_dir(&request),
            request.http_headers.clone(),
        );
        let client = build_task_client(&self.config.fetch)?;
        let _lease = self.retry_gates.acquire(&record.task_id);
        self.admit_and_run(&self.retry_gates.admission, client, job, CancellationToken::new(), route)
            .await
            .map(|_| ())
    }

    /// Submits a local archive for extraction and waits for the single reply.
    pub(crate) async fn extract_for_import(
        &self,
        archive_path: PathBuf,
    ) -> Result<ImportedArchive, CrawlError> {
        let (reply, rx) = oneshot::channel();
        self.decompression.submit(DecompressionJob {
            original_url: archive_path.to_string_lossy().into_owned(),
            archive_path,
            task_id: LOCAL_IMPORT_ID.to_string(),
            plugin_id: LOCAL_IMPORT_ID.to_string(),
            cancel: CancellationToken::new(),
            kind: DecompressionKind::LocalImport { reply },
        })?;
        rx.await.map_err(|_| CrawlError::ReplyChannelClosed)?
    }

    /// Destination the host should write a natively intercepted download to.
    pub(crate) fn native_download_destination(&self, url: &str) -> Option<PathBuf> {
        let interceptions = self.interceptions();
        let entry = interceptions.get(url)?;
        self.registrar
            .emit_state(&entry.job, DownloadState::Downloading, None);
        Some(entry.destination.clone())
    }

    /// Completes a natively intercepted download and frees its admission slot.
    pub(crate) fn native_download_finished(
        &self,
        url: &str,
        result: Result<(), String>,
    ) -> Result<(), CrawlError> {
        let entry = self
            .interceptions()
            .remove(url)
            .ok_or_else(|| CrawlError::UnknownDownload(url.to_string()))?;
        let Interception {
            job, destination, ..
        } = entry;
        match result {
            Ok(()) => self.finish_image(&job, &destination),
            Err(message) => {
                let err = CrawlError::FetchFailed(FetchError::new(FailureKind::Network, message));
                self.registrar.fail(&job, &err);
                Err(err)
            }
        }
    }

    /// Drops pending interceptions of a task whose run ended.
    pub(crate) fn abandon_interceptions(&self, task_id: &str) {
        let abandoned: Vec<Interception> = {
            let mut interceptions = self.interceptions();
            let urls: Vec<String> = interceptions
                .iter()
                .filter(|(_, entry)| entry.job.task_id == task_id)
                .map(|(url, _)| url.clone())
                .collect();
            urls.iter()
                .filter_map(|url| interceptions.remove(url))
                .collect()
        };
        for entry in abandoned {
            let err = CrawlError::FetchFailed(FetchError::new(
                FailureKind::Cancelled,
                "native download never finished",
            ));
            self.registrar.fail(&entry.job, &err);
        }
    }

    async fn admit_and_run(
        self: &Arc<Self>,
        admission: &DownloadAdmission,
        client: reqwest::Client,
        job: DownloadJob,
        cancel: CancellationToken,
        route: Route,
    ) -> Result<PrepareOutcome, CrawlError> {
        self.registrar
            .emit_state(&job, DownloadState::Preparing, None);
        let ticket = match admission.prepare(&job.task_id).await {
            Ok(ticket) => ticket,
            Err(err) => {
                self.registrar
                    .emit_state(&job, DownloadState::Failed, Some(err.to_string()));
                return Err(err);
            }
        };

        if route.allow_native && !route.archive && ticket.native_interception() {
            return self.intercept(job, ticket);
        }

        // The fetch runs on its own task: cancelling the calling script must never
        // abort a byte stream that is already underway.
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let _tracked = this.active.track(&job);
            this.registrar
                .emit_state(&job, DownloadState::Downloading, None);
            if route.archive {
                this.fetch_archive(&client, job, ticket, cancel).await
            } else {
                this.fetch_image(&client, job, ticket).await
            }
        });
        handle
            .await
            .map_err(|err| CrawlError::Io(io::Error::other(err.to_string())))??;
        Ok(PrepareOutcome {
            use_native_interception: false,
        })
    }

    /// Parks `job` until the host reports its native download finished.
    /// Pending downloads are keyed by URL, so a second request for the same URL is refused.
    fn intercept(
        &self,
        job: DownloadJob,
        ticket: AdmissionTicket,
    ) -> Result<PrepareOutcome, CrawlError> {
        let mut interceptions = self.interceptions();
        let slot = match interceptions.entry(job.url.clone()) {
            Entry::Vacant(slot) => slot,
            Entry::Occupied(_) => {
                let err = CrawlError::DuplicateDownload(job.url.clone());
                self.registrar
                    .emit_state(&job, DownloadState::Failed, Some(err.to_string()));
                return Err(err);
            }
        };
        let destination = match self.image_destination(&job) {
            Ok(destination) => destination,
            Err(err) => {
                self.registrar.fail(&job, &err);
                return Err(err);
            }
        };
        engine_task_log!(
            log::Level::Debug,
            job.task_id,
            "handing {} to native download",
            job.url
        );
        let tracked = self.active.track(&job);
        slot.insert(Interception {
            job,
            destination,
            _ticket: ticket,
            _tracked: tracked,
        });
        Ok(PrepareOutcome {
            use_native_interception: true,
        })
    }

    async fn fetch_image(
        &self,
        client: &reqwest::Client,
        job: DownloadJob,
        ticket: AdmissionTicket,
    ) -> Result<(), CrawlError> {
        let result = match self.image_destination(&job) {
            Ok(destination) => self
                .executor
                .download(client, &job, &destination)
                .await
                .map_err(CrawlError::from),
            Err(err) => Err(err),
        };
        drop(ticket);

        match result {
            Ok(file) => self.finish_image(&job, &file.path),
            Err(err) => {
                self.registrar.fail(&job, &err);
                Err(err)
            }
        }
    }

    async fn fetch_archive(
        &self,
        client: &reqwest::Client,
        job: DownloadJob,
        ticket: AdmissionTicket,
        cancel: CancellationToken,
    ) -> Result<(), CrawlError> {
        let guard = match TempDirGuard::create_in(&self.config.temp_root) {
            Ok(guard) => guard,
            Err(err) => {
                let err = CrawlError::Io(err);
                self.registrar.fail(&job, &err);
                return Err(err);
            }
        };
        let destination = guard
            .path()
            .join(safe_image_filename(job.file_name_hint.as_deref(), &job.url));
        let result = self.executor.download(client, &job, &destination).await;
        drop(ticket);

        let file = match result {
            Ok(file) => file,
            Err(err) => {
                let err = CrawlError::from(err);
                self.registrar.fail(&job, &err);
                return Err(err);
            }
        };
        self.registrar
            .emit_state(&job, DownloadState::Processing, None);
        engine_debug!("queueing {} for extraction", file.path.display());
        let submitted = self.decompression.submit(DecompressionJob {
            archive_path: file.path,
            original_url: job.url.clone(),
            task_id: job.task_id.clone(),
            plugin_id: job.plugin_id.clone(),
            cancel,
            kind: DecompressionKind::CrawlerDownload {
                images_dir: job.destination_dir.clone(),
                http_headers: job.http_headers.clone(),
                output_album_id: job.output_album_id.clone(),
                download_start_time: job.download_start_time,
                temp_dir_guard: Some(guard),
            },
        });
        submitted.inspect_err(|err| self.registrar.fail(&job, err))
    }

    fn finish_image(&self, job: &DownloadJob, path: &std::path::Path) -> Result<(), CrawlError> {
        self.registrar
            .emit_state(job, DownloadState::Processing, None);
        self.registrar.complete(job, path).inspect_err(|err| {
            self.registrar.fail(job, err);
        })
    }

    fn image_destination(&self, job: &DownloadJob) -> Result<PathBuf, CrawlError> {
        ensure_output_dir(&job.destination_dir)?;
        Ok(unique_path(
            &job.destination_dir,
            &safe_image_filename(job.file_name_hint.as_deref(), &job.url),
        ))
    }
}
