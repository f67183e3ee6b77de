#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use crawler_engine::{
    CrawlError, CrawlPlugin, DownloadState, EngineConfig, EngineEvent, EventSink, FetchSettings,
    ScriptContext,
};
use tokio::sync::Notify;
use url::Url;

pub fn init_logging() {
    static INIT: Once = Once::new();
    INIT.call_once(engine_logging::initialize_for_tests);
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn download_states(&self, url: &str) -> Vec<DownloadState> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                EngineEvent::DownloadState(state) if state.url == url => Some(state.state),
                _ => None,
            })
            .collect()
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: EngineEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub async fn with_timeout<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}

pub fn test_config(root: &Path) -> EngineConfig {
    EngineConfig {
        fetch: FetchSettings {
            retry_count: 0,
            retry_backoff: Duration::from_millis(10),
            request_timeout: Duration::from_secs(5),
            ..FetchSettings::default()
        },
        default_images_dir: root.join("images"),
        temp_root: root.join("tmp"),
        ..EngineConfig::default()
    }
}

/// Runs until released; records how often it started.
pub struct GatedPlugin {
    pub id: String,
    pub base_url: Option<Url>,
    pub release: Arc<Notify>,
    pub runs: Arc<Mutex<u32>>,
}

impl GatedPlugin {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            base_url: None,
            release: Arc::new(Notify::new()),
            runs: Arc::new(Mutex::new(0)),
        })
    }

    pub fn with_base_url(id: &str, base_url: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            base_url: Some(Url::parse(base_url).unwrap()),
            release: Arc::new(Notify::new()),
            runs: Arc::new(Mutex::new(0)),
        })
    }

    pub fn runs(&self) -> u32 {
        *self.runs.lock().unwrap()
    }
}

#[async_trait::async_trait]
impl CrawlPlugin for GatedPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_url(&self) -> Option<Url> {
        self.base_url.clone()
    }

    fn html_asset(&self, path: &str) -> Option<String> {
        (path == "index.html").then(|| format!("<html><body>{}</body></html>", self.id))
    }

    async fn run(&self, _ctx: ScriptContext) -> Result<(), CrawlError> {
        *self.runs.lock().unwrap() += 1;
        self.release.notified().await;
        Ok(())
    }
}

/// Strings listed under `key` in the task's user config.
pub fn config_urls(ctx: &ScriptContext, key: &str) -> Vec<String> {
    ctx.user_config()
        .get(key)
        .and_then(|urls| urls.as_array())
        .map(|urls| {
            urls.iter()
                .filter_map(|url| url.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Downloads every URL listed under `urls` in the task's user config and keeps going
/// when one fails.
pub struct UrlListPlugin;

#[async_trait::async_trait]
impl CrawlPlugin for UrlListPlugin {
    fn id(&self) -> &str {
        "url-list"
    }

    async fn run(&self, ctx: ScriptContext) -> Result<(), CrawlError> {
        let urls = config_urls(&ctx, "urls");
        let step = 100.0 / urls.len().max(1) as f64;
        for url in urls {
            if let Err(err) = ctx.prepare_download(&url, None).await {
                if matches!(err, CrawlError::AdmissionCancelled { .. }) {
                    return Err(err);
                }
            }
            ctx.add_progress(step);
        }
        Ok(())
    }
}

/// Fails right away.
pub struct FailingPlugin;

#[async_trait::async_trait]
impl CrawlPlugin for FailingPlugin {
    fn id(&self) -> &str {
        "failing"
    }

    async fn run(&self, _ctx: ScriptContext) -> Result<(), CrawlError> {
        Err(CrawlError::ExtractionFailed("site layout changed".to_string()))
    }
}

/// Downloads every archive listed under `archives`, skipping the ones that fail.
pub struct ArchivePlugin;

#[async_trait::async_trait]
impl CrawlPlugin for ArchivePlugin {
    fn id(&self) -> &str {
        "archives"
    }

    async fn run(&self, ctx: ScriptContext) -> Result<(), CrawlError> {
        for url in config_urls(&ctx, "archives") {
            if let Err(err) = ctx.download_archive(&url).await {
                if matches!(err, CrawlError::AdmissionCancelled { .. }) {
                    return Err(err);
                }
            }
        }
        Ok(())
    }
}

/// Requests every URL under `urls`, records whether each went to the native path,
/// then waits for `release`.
pub struct NativePlugin {
    pub release: Arc<Notify>,
    outcomes: Mutex<Vec<Result<bool, String>>>,
}

impl NativePlugin {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            release: Arc::new(Notify::new()),
            outcomes: Mutex::new(Vec::new()),
        })
    }

    pub fn outcomes(&self) -> Vec<Result<bool, String>> {
        self.outcomes.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl CrawlPlugin for NativePlugin {
    fn id(&self) -> &str {
        "native"
    }

    async fn run(&self, ctx: ScriptContext) -> Result<(), CrawlError> {
        for url in config_urls(&ctx, "urls") {
            let outcome = ctx
                .prepare_download(&url, None)
                .await
                .map(|outcome| outcome.use_native_interception)
                .map_err(|err| err.to_string());
            self.outcomes.lock().unwrap().push(outcome);
        }
        self.release.notified().await;
        Ok(())
    }
}
