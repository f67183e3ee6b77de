use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use crawler_core::{update, Effect, Msg, RunOutcome, SchedulerState, SchedulerView, Task, TaskId};
use engine_logging::{engine_debug, engine_info, engine_task_log, engine_warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::active::{ActiveTask, ActiveTaskSlot};
use crate::admission::DownloadAdmission;
use crate::archive::{ArchiveExtractor, ZipExtractor};
use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::decompression::{DecompressionWorker, ImportedArchive};
use crate::download::Downloader;
use crate::fetch::{build_task_client, DownloadExecutor, ReqwestExecutor};
use crate::headers::HeaderRules;
use crate::proxy::ProxyServer;
use crate::registrar::Registrar;
use crate::script::{CrawlPlugin, PluginRegistry, ScriptContext};
use crate::{
    now_ms, ActiveDownload, CrawlError, EngineEvent, EventSink, FailedImageRecord,
    PrepareOutcome, TaskRequest,
};

/// Host capability to redirect browser-initiated downloads to a chosen path.
pub trait NativeDownloadHost: Send + Sync {
    fn supports_interception(&self) -> bool;
}

/// Hosts without native download hooks; the engine fetches everything itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoNativeDownloads;

impl NativeDownloadHost for NoNativeDownloads {
    fn supports_interception(&self) -> bool {
        false
    }
}

enum EngineCommand {
    Enqueue {
        request: TaskRequest,
        reply: oneshot::Sender<Result<(), CrawlError>>,
    },
    Stop {
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), CrawlError>>,
    },
    Delete {
        task_id: TaskId,
        reply: oneshot::Sender<Result<(), CrawlError>>,
    },
    RunFinished {
        task_id: TaskId,
        outcome: RunOutcome,
    },
    AddProgress {
        task_id: TaskId,
        delta: f64,
    },
    ImagesDeleted {
        task_id: TaskId,
        count: u64,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

struct Shared {
    config: EngineConfig,
    downloads: Arc<Downloader>,
    slot: ActiveTaskSlot,
    requests: Mutex<HashMap<TaskId, TaskRequest>>,
    proxy_addr: RwLock<Option<SocketAddr>>,
    view: watch::Receiver<SchedulerView>,
}

impl Shared {
    fn requests(&self) -> MutexGuard<'_, HashMap<TaskId, TaskRequest>> {
        self.requests.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_proxy_addr(&self, addr: Option<SocketAddr>) {
        *self
            .proxy_addr
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = addr;
    }
}

/// Assembles an engine from its collaborators.
pub struct EngineBuilder {
    config: EngineConfig,
    plugins: Arc<dyn PluginRegistry>,
    catalog: Arc<dyn Catalog>,
    sink: Arc<dyn EventSink>,
    executor: Option<Arc<dyn DownloadExecutor>>,
    extractor: Arc<dyn ArchiveExtractor>,
    native: Arc<dyn NativeDownloadHost>,
}

impl EngineBuilder {
    pub fn new(
        config: EngineConfig,
        plugins: Arc<dyn PluginRegistry>,
        catalog: Arc<dyn Catalog>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            config,
            plugins,
            catalog,
            sink,
            executor: None,
            extractor: Arc::new(ZipExtractor),
            native: Arc::new(NoNativeDownloads),
        }
    }

    pub fn executor(mut self, executor: Arc<dyn DownloadExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn native_host(mut self, native: Arc<dyn NativeDownloadHost>) -> Self {
        self.native = native;
        self
    }

    /// Spawns the engine loop and the decompression worker on the current runtime.
    pub fn start(self) -> EngineHandle {
        let shutdown = CancellationToken::new();
        let slot = ActiveTaskSlot::new();
        let registrar = Arc::new(Registrar::new(self.catalog, self.sink.clone()));
        let (decompression, worker) = DecompressionWorker::new(
            self.extractor,
            registrar.clone(),
            self.config.temp_root.clone(),
        )
        .spawn(shutdown.child_token());

        let executor = self
            .executor
            .unwrap_or_else(|| Arc::new(ReqwestExecutor::new(self.config.fetch.clone())));
        let admission = DownloadAdmission::new(self.native.supports_interception());
        let downloads = Arc::new(Downloader::new(
            self.config.clone(),
            admission,
            executor,
            registrar,
            decompression,
            slot.clone(),
        ));

        let (view_tx, view_rx) = watch::channel(SchedulerView::default());
        let shared = Arc::new(Shared {
            config: self.config,
            downloads,
            slot,
            requests: Mutex::new(HashMap::new()),
            proxy_addr: RwLock::new(None),
            view: view_rx,
        });

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let engine_loop = EngineLoop {
            state: SchedulerState::new(),
            shared: shared.clone(),
            plugins: self.plugins,
            sink: self.sink,
            weak_tx: cmd_tx.downgrade(),
            view_tx,
            proxy: None,
            shutdown,
            worker: Some(worker),
        };
        tokio::spawn(engine_loop.run(cmd_rx));

        EngineHandle { cmd_tx, shared }
    }
}

/// Cheap, cloneable handle to a running engine.
#[derive(Clone)]
pub struct EngineHandle {
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    shared: Arc<Shared>,
}

/// Returned by [`EngineHandle::enqueue`]; follows one task's status.
pub struct TaskHandle {
    task_id: TaskId,
    view: watch::Receiver<SchedulerView>,
}

impl TaskHandle {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn task(&self) -> Option<Task> {
        self.view.borrow().task(&self.task_id).cloned()
    }

    /// Waits until the task is terminal. `None` if it was deleted or the engine stopped.
    ///
    /// The handle follows the task id, not one run: if the task is already terminal
    /// this returns at once, even when the id is enqueued again later.
    pub async fn wait(&mut self) -> Option<Task> {
        let task_id = self.task_id.clone();
        let view = self
            .view
            .wait_for(|view| {
                view.task(&task_id)
                    .map_or(true, |task| task.status.is_terminal())
            })
            .await
            .ok()?;
        view.task(&task_id).cloned()
    }
}

impl EngineHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T, CrawlError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(command(reply))
            .map_err(|_| CrawlError::EngineStopped)?;
        rx.await.map_err(|_| CrawlError::EngineStopped)
    }

    /// Queues a task. It starts immediately when no other task holds the slot.
    pub async fn enqueue(&self, request: TaskRequest) -> Result<TaskHandle, CrawlError> {
        let task_id = request.task_id.clone();
        self.request(|reply| EngineCommand::Enqueue { request, reply })
            .await??;
        Ok(TaskHandle {
            task_id,
            view: self.shared.view.clone(),
        })
    }

    /// Stops a task. Succeeds for tasks that are not running as well.
    pub async fn stop(&self, task_id: &str) -> Result<(), CrawlError> {
        let task_id = task_id.to_string();
        self.request(|reply| EngineCommand::Stop { task_id, reply })
            .await?
    }

    /// Deletes a task, stopping it first if it is running.
    pub async fn delete(&self, task_id: &str) -> Result<(), CrawlError> {
        let task_id = task_id.to_string();
        self.request(|reply| EngineCommand::Delete { task_id, reply })
            .await?
    }

    pub fn is_running(&self) -> Option<TaskId> {
        self.shared.view.borrow().running.clone()
    }

    pub fn snapshot(&self) -> SchedulerView {
        self.shared.view.borrow().clone()
    }

    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.shared.view.borrow().task(task_id).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerView> {
        self.shared.view.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Blocks until the running task may start another download, then either runs
    /// it or hands it to the host's native download path.
    pub async fn prepare_download(
        &self,
        task_id: &str,
        plugin_id: &str,
        url: &str,
        file_name: Option<&str>,
    ) -> Result<PrepareOutcome, CrawlError> {
        self.shared
            .downloads
            .prepare_download(task_id, plugin_id, url, file_name)
            .await
    }

    pub async fn download_archive(&self, task_id: &str, url: &str) -> Result<(), CrawlError> {
        self.shared.downloads.download_archive(task_id, url).await
    }

    pub fn add_progress(&self, task_id: &str, delta_percent: f64) {
        let _ = self.cmd_tx.send(EngineCommand::AddProgress {
            task_id: task_id.to_string(),
            delta: delta_percent,
        });
    }

    /// The catalog removed `count` images of a task.
    pub fn note_images_deleted(&self, task_id: &str, count: u64) {
        let _ = self.cmd_tx.send(EngineCommand::ImagesDeleted {
            task_id: task_id.to_string(),
            count,
        });
    }

    pub fn set_task_interval(&self, task_id: &str, interval_ms: u64) -> Result<(), CrawlError> {
        self.shared
            .downloads
            .admission()
            .set_interval(task_id, interval_ms)
    }

    pub fn get_failed_images(&self, task_id: &str) -> Result<Vec<FailedImageRecord>, CrawlError> {
        self.shared.downloads.failures().failed_images(task_id)
    }

    /// Re-issues one failed download through admission.
    pub async fn retry_failed_image(&self, failed_id: u64) -> Result<(), CrawlError> {
        let record = self.shared.downloads.failures().get(failed_id)?;
        let known = self.shared.requests().get(&record.task_id).cloned();
        self.shared.downloads.retry_failed(failed_id, known).await
    }

    /// Like [`retry_failed_image`](Self::retry_failed_image) for a task this engine has
    /// not run, using `request` for its images directory and headers.
    pub async fn retry_failed_image_with(
        &self,
        failed_id: u64,
        request: TaskRequest,
    ) -> Result<(), CrawlError> {
        self.shared
            .downloads
            .retry_failed(failed_id, Some(request))
            .await
    }

    pub fn native_download_destination(&self, url: &str) -> Option<PathBuf> {
        self.shared.downloads.native_download_destination(url)
    }

    pub fn native_download_finished(
        &self,
        url: &str,
        result: Result<(), String>,
    ) -> Result<(), CrawlError> {
        self.shared.downloads.native_download_finished(url, result)
    }

    /// Extracts a local archive into a fresh scratch directory. The caller owns the
    /// returned guard and must hold it until the images have been copied out.
    pub async fn extract_for_import(
        &self,
        archive_path: impl Into<PathBuf>,
    ) -> Result<ImportedArchive, CrawlError> {
        self.shared
            .downloads
            .extract_for_import(archive_path.into())
            .await
    }

    pub fn active_downloads(&self) -> Vec<ActiveDownload> {
        self.shared.downloads.active_downloads()
    }

    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        *self
            .shared
            .proxy_addr
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Stops every task, closes the proxy and ends the decompression worker.
    pub async fn shutdown(&self) -> Result<(), CrawlError> {
        self.request(|reply| EngineCommand::Shutdown { reply }).await
    }
}

struct EngineLoop {
    state: SchedulerState,
    shared: Arc<Shared>,
    plugins: Arc<dyn PluginRegistry>,
    sink: Arc<dyn EventSink>,
    weak_tx: mpsc::WeakUnboundedSender<EngineCommand>,
    view_tx: watch::Sender<SchedulerView>,
    proxy: Option<ProxyServer>,
    shutdown: CancellationToken,
    worker: Option<JoinHandle<()>>,
}

impl EngineLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<EngineCommand>) {
        engine_info!("crawler engine started");
        while let Some(command) = rx.recv().await {
            match command {
                EngineCommand::Enqueue { request, reply } => {
                    let result = self.enqueue(request).await;
                    let _ = reply.send(result);
                }
                EngineCommand::Stop { task_id, reply } => {
                    let result = self.ensure_known(&task_id);
                    if result.is_ok() {
                        self.apply(Msg::StopRequested {
                            task_id,
                            now: now_ms(),
                        })
                        .await;
                    }
                    let _ = reply.send(result);
                }
                EngineCommand::Delete { task_id, reply } => {
                    let result = self.ensure_known(&task_id);
                    if result.is_ok() {
                        self.apply(Msg::DeleteRequested {
                            task_id,
                            now: now_ms(),
                        })
                        .await;
                    }
                    let _ = reply.send(result);
                }
                EngineCommand::RunFinished { task_id, outcome } => {
                    self.apply(Msg::RunFinished {
                        task_id,
                        outcome,
                        now: now_ms(),
                    })
                    .await;
                }
                EngineCommand::AddProgress { task_id, delta } => {
                    self.apply(Msg::ProgressAdded { task_id, delta }).await;
                }
                EngineCommand::ImagesDeleted { task_id, count } => {
                    self.apply(Msg::ImagesDeleted { task_id, count }).await;
                }
                EngineCommand::Shutdown { reply } => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
            }
        }
        self.shutdown().await;
    }

    fn ensure_known(&self, task_id: &str) -> Result<(), CrawlError> {
        self.state
            .task(task_id)
            .map(|_| ())
            .ok_or_else(|| CrawlError::TaskNotFound(task_id.to_string()))
    }

    async fn enqueue(&mut self, request: TaskRequest) -> Result<(), CrawlError> {
        if self.plugins.plugin(&request.plugin_id).is_none() {
            return Err(CrawlError::PluginNotFound(request.plugin_id));
        }
        let live = self
            .state
            .task(&request.task_id)
            .is_some_and(|task| !task.status.is_terminal());
        if live {
            engine_task_log!(log::Level::Debug, request.task_id, "already queued or running");
            return Ok(());
        }

        let task_id = request.task_id.clone();
        let plugin_id = request.plugin_id.clone();
        self.shared.requests().insert(task_id.clone(), request);
        self.apply(Msg::Enqueue {
            task_id,
            plugin_id,
            now: now_ms(),
        })
        .await;
        Ok(())
    }

    /// Feeds `msg` through the scheduler and executes the effects, including any
    /// follow-up messages effects produce.
    async fn apply(&mut self, msg: Msg) {
        let mut pending = VecDeque::from([msg]);
        while let Some(msg) = pending.pop_front() {
            let (state, effects) = update(std::mem::take(&mut self.state), msg);
            self.state = state;
            for effect in effects {
                if let Some(follow_up) = self.execute(effect).await {
                    pending.push_back(follow_up);
                }
            }
        }

        if self.state.running().is_none() {
            self.stop_proxy().await;
        }
        if self.state.consume_dirty() {
            self.view_tx.send_replace(self.state.view());
        }
    }

    async fn execute(&mut self, effect: Effect) -> Option<Msg> {
        match effect {
            Effect::StartRun { task_id, plugin_id } => {
                match self.start_run(&task_id, &plugin_id).await {
                    Ok(()) => None,
                    Err(err) => {
                        engine_task_log!(log::Level::Error, task_id, "could not start: {}", err);
                        Some(Msg::RunFinished {
                            task_id,
                            outcome: RunOutcome::Failed(err.to_string()),
                            now: now_ms(),
                        })
                    }
                }
            }
            Effect::CancelRun { task_id } => {
                if let Ok(task) = self.shared.slot.require(&task_id) {
                    engine_task_log!(log::Level::Info, task_id, "stopping");
                    task.cancel.cancel();
                }
                None
            }
            Effect::EndRun { task_id } => {
                self.shared.downloads.admission().close(&task_id);
                self.shared.downloads.abandon_interceptions(&task_id);
                if self.shared.slot.clear(&task_id).is_some() {
                    engine_task_log!(log::Level::Debug, task_id, "released execution slot");
                }
                None
            }
            Effect::StatusChanged {
                task_id,
                status,
                progress,
                error,
            } => {
                engine_task_log!(log::Level::Info, task_id, "status {}", status.as_str());
                self.sink.emit(EngineEvent::TaskStatus {
                    task_id,
                    status,
                    progress,
                    error,
                });
                None
            }
            Effect::ProgressChanged { task_id, progress } => {
                self.sink
                    .emit(EngineEvent::TaskProgress { task_id, progress });
                None
            }
            Effect::TaskRemoved { task_id } => {
                self.shared.requests().remove(&task_id);
                self.sink.emit(EngineEvent::TaskRemoved { task_id });
                None
            }
        }
    }

    async fn start_run(&mut self, task_id: &str, plugin_id: &str) -> Result<(), CrawlError> {
        let request = self
            .shared
            .requests()
            .get(task_id)
            .cloned()
            .ok_or_else(|| CrawlError::TaskNotFound(task_id.to_string()))?;
        let plugin = self
            .plugins
            .plugin(plugin_id)
            .ok_or_else(|| CrawlError::PluginNotFound(plugin_id.to_string()))?;
        let tx = self.weak_tx.upgrade().ok_or(CrawlError::EngineStopped)?;
        self.ensure_proxy().await?;

        let config = &self.shared.config;
        // Cancelled only by stopping this task; shutdown stops it through the scheduler.
        let cancel = CancellationToken::new();
        let task = Arc::new(ActiveTask {
            client: build_task_client(&config.fetch)?,
            headers: HeaderRules::new(&request.http_headers, plugin.base_url().as_ref()),
            images_dir: config.images_dir(&request),
            cancel: cancel.clone(),
            plugin: plugin.clone(),
            request,
        });
        self.shared
            .downloads
            .admission()
            .open(task_id, config.limits(&task.request), cancel.clone());
        self.shared.slot.set(task.clone());

        let ctx = ScriptContext::new(
            task,
            EngineHandle {
                cmd_tx: tx.clone(),
                shared: self.shared.clone(),
            },
        );
        tokio::spawn(run_script(task_id.to_string(), plugin, ctx, cancel, tx));
        Ok(())
    }

    async fn ensure_proxy(&mut self) -> Result<(), CrawlError> {
        if self.proxy.is_some() {
            return Ok(());
        }
        let config = &self.shared.config;
        let proxy = ProxyServer::start(
            config.proxy_bind,
            self.shared.slot.clone(),
            &config.crawler_page_html,
        )
        .await?;
        self.shared.set_proxy_addr(Some(proxy.addr()));
        self.proxy = Some(proxy);
        Ok(())
    }

    async fn stop_proxy(&mut self) {
        if let Some(proxy) = self.proxy.take() {
            self.shared.set_proxy_addr(None);
            proxy.stop().await;
        }
    }

    async fn shutdown(&mut self) {
        engine_info!("crawler engine shutting down");
        let queued: Vec<TaskId> = self.state.queued().cloned().collect();
        for task_id in queued {
            self.apply(Msg::StopRequested {
                task_id,
                now: now_ms(),
            })
            .await;
        }
        if let Some(task_id) = self.state.running().cloned() {
            self.apply(Msg::StopRequested {
                task_id: task_id.clone(),
                now: now_ms(),
            })
            .await;
            self.apply(Msg::RunFinished {
                task_id,
                outcome: RunOutcome::Cancelled,
                now: now_ms(),
            })
            .await;
        }

        self.shutdown.cancel();
        self.stop_proxy().await;
        if let Some(worker) = self.worker.take() {
            if let Err(err) = worker.await {
                engine_warn!("decompression worker ended abnormally: {}", err);
            }
        }
        engine_debug!("crawler engine stopped");
    }
}

async fn run_script(
    task_id: TaskId,
    plugin: Arc<dyn CrawlPlugin>,
    ctx: ScriptContext,
    cancel: CancellationToken,
    tx: mpsc::UnboundedSender<EngineCommand>,
) {
    engine_task_log!(log::Level::Info, task_id, "running plugin {}", plugin.id());
    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => RunOutcome::Cancelled,
        result = plugin.run(ctx) => match result {
            Ok(()) => RunOutcome::Completed,
            Err(CrawlError::AdmissionCancelled { .. }) => RunOutcome::Cancelled,
            Err(err) => RunOutcome::Failed(err.to_string()),
        },
    };
    engine_task_log!(log::Level::Debug, task_id, "script finished: {:?}", outcome);
    let _ = tx.send(EngineCommand::RunFinished { task_id, outcome });
}
