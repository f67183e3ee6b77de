use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use crawler_engine::{EngineConfig, TaskRequest};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "crawler.ron";

/// A site the page-list plugin knows how to crawl.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UrlListPluginConfig {
    pub id: String,
    /// Site root; Origin and Referer defaults derive from it.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Upper bound of media links taken from a single page.
    #[serde(default)]
    pub max_links_per_page: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub task_id: String,
    pub plugin_id: String,
    /// Pages whose images and archives are downloaded, in order.
    pub pages: Vec<String>,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    #[serde(default)]
    pub http_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub output_album_id: Option<String>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

impl TaskConfig {
    pub fn to_request(&self) -> TaskRequest {
        TaskRequest {
            task_id: self.task_id.clone(),
            plugin_id: self.plugin_id.clone(),
            output_dir: self.output_dir.clone(),
            http_headers: self.http_headers.clone(),
            output_album_id: self.output_album_id.clone(),
            max_concurrency: self.max_concurrency,
            interval_ms: self.interval_ms,
            user_config: serde_json::json!({ "pages": self.pages }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_level: String,
    /// Also write the log to this file.
    pub log_to_file: Option<PathBuf>,
    pub images_dir: PathBuf,
    pub temp_root: PathBuf,
    pub max_concurrency: usize,
    pub interval_ms: u64,
    pub retry_count: u32,
    pub failed_images_file: PathBuf,
    pub plugins: Vec<UrlListPluginConfig>,
    pub tasks: Vec<TaskConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let engine = EngineConfig::default();
        Self {
            log_level: "info".to_string(),
            log_to_file: None,
            images_dir: PathBuf::from("images"),
            temp_root: engine.temp_root,
            max_concurrency: engine.default_max_concurrency,
            interval_ms: engine.default_interval_ms,
            retry_count: engine.fetch.retry_count,
            failed_images_file: PathBuf::from("failed_images.ron"),
            plugins: Vec::new(),
            tasks: Vec::new(),
        }
    }
}

impl AppConfig {
    pub fn from_ron(text: &str) -> anyhow::Result<Self> {
        let config: AppConfig = ron::from_str(text).context("invalid configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("could not read {}", path.display()))?;
        Self::from_ron(&text).with_context(|| format!("in {}", path.display()))
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut engine = EngineConfig {
            default_max_concurrency: self.max_concurrency,
            default_interval_ms: self.interval_ms,
            default_images_dir: self.images_dir.clone(),
            temp_root: self.temp_root.clone(),
            ..EngineConfig::default()
        };
        engine.fetch.retry_count = self.retry_count;
        engine
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.max_concurrency == 0 {
            anyhow::bail!("max_concurrency must be at least 1");
        }
        for task in &self.tasks {
            if !self.plugins.iter().any(|plugin| plugin.id == task.plugin_id) {
                anyhow::bail!(
                    "task {} uses unknown plugin {}",
                    task.task_id,
                    task.plugin_id
                );
            }
            if task.max_concurrency == Some(0) {
                anyhow::bail!("task {}: max_concurrency must be at least 1", task.task_id);
            }
        }
        Ok(())
    }
}
