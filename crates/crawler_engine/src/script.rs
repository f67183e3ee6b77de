//! Capability boundary between crawl scripts and the engine.
//!
//! A script may call the [`ScriptContext`] methods in any order, any number of
//! times, and may be cancelled between any two calls.
use std::collections::HashMap;
use std::sync::Arc;

use url::Url;

use crate::active::ActiveTask;
use crate::decode::DecodedPage;
use crate::engine::EngineHandle;
use crate::fetch::fetch_page;
use crate::{CrawlError, PrepareOutcome};

#[async_trait::async_trait]
pub trait CrawlPlugin: Send + Sync {
    fn id(&self) -> &str;

    /// Declared site root; Origin and Referer defaults derive from it.
    fn base_url(&self) -> Option<Url> {
        None
    }

    /// Static HTML served at `/plugin/html?path=`.
    fn html_asset(&self, _path: &str) -> Option<String> {
        None
    }

    /// Drives one run of a task. Returning `Err` fails the task.
    async fn run(&self, ctx: ScriptContext) -> Result<(), CrawlError>;
}

pub trait PluginRegistry: Send + Sync {
    fn plugin(&self, plugin_id: &str) -> Option<Arc<dyn CrawlPlugin>>;
}

#[derive(Default)]
pub struct StaticPluginRegistry {
    plugins: HashMap<String, Arc<dyn CrawlPlugin>>,
}

impl StaticPluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, plugin: Arc<dyn CrawlPlugin>) -> Self {
        self.register(plugin);
        self
    }

    pub fn register(&mut self, plugin: Arc<dyn CrawlPlugin>) {
        self.plugins.insert(plugin.id().to_string(), plugin);
    }
}

impl PluginRegistry for StaticPluginRegistry {
    fn plugin(&self, plugin_id: &str) -> Option<Arc<dyn CrawlPlugin>> {
        self.plugins.get(plugin_id).cloned()
    }
}

/// Handle a running script uses to reach the engine.
#[derive(Clone)]
pub struct ScriptContext {
    task: Arc<ActiveTask>,
    engine: EngineHandle,
}

impl ScriptContext {
    pub(crate) fn new(task: Arc<ActiveTask>, engine: EngineHandle) -> Self {
        Self { task, engine }
    }

    pub fn task_id(&self) -> &str {
        self.task.task_id()
    }

    pub fn plugin_id(&self) -> &str {
        self.task.plugin_id()
    }

    pub fn user_config(&self) -> &serde_json::Value {
        &self.task.request.user_config
    }

    pub fn is_cancelled(&self) -> bool {
        self.task.cancel.is_cancelled()
    }

    /// Resolves once the task has been asked to stop.
    pub async fn cancelled(&self) {
        self.task.cancel.cancelled().await
    }

    /// Fetches and decodes a page with the task's client and header rules.
    pub async fn fetch_page(&self, url: &str) -> Result<DecodedPage, CrawlError> {
        let page = fetch_page(
            &self.task.client,
            url,
            self.task.headers.header_map(),
            &self.engine.config().fetch,
        )
        .await?;
        Ok(page)
    }

    /// Waits for admission and downloads one image. See [`EngineHandle::prepare_download`].
    pub async fn prepare_download(
        &self,
        url: &str,
        file_name: Option<&str>,
    ) -> Result<PrepareOutcome, CrawlError> {
        self.engine
            .prepare_download(self.task_id(), self.plugin_id(), url, file_name)
            .await
    }

    /// Downloads an archive and queues it for extraction into the images directory.
    pub async fn download_archive(&self, url: &str) -> Result<(), CrawlError> {
        self.engine.download_archive(self.task_id(), url).await
    }

    pub fn add_progress(&self, delta_percent: f64) {
        self.engine.add_progress(self.task_id(), delta_percent);
    }

    pub fn set_interval(&self, interval_ms: u64) -> Result<(), CrawlError> {
        self.engine.set_task_interval(self.task_id(), interval_ms)
    }

    /// `target` routed through the loopback proxy, if it is running.
    pub fn proxy_url(&self, target: &str) -> Option<String> {
        let addr = self.engine.proxy_addr()?;
        let encoded: String = url::form_urlencoded::byte_serialize(target.as_bytes()).collect();
        Some(format!("http://{addr}/proxy?url={encoded}"))
    }
}
