//! Declarative plugin: walks a list of pages and downloads every image and
//! archive they link to.
use std::sync::Arc;

use crawler_engine::{
    extract_media_links_limited, CrawlError, CrawlPlugin, MediaKind, ScriptContext,
    StaticPluginRegistry,
};
use engine_logging::{engine_task_log, engine_warn};
use url::Url;

use crate::config::UrlListPluginConfig;

const DEFAULT_MAX_LINKS: usize = 500;

pub struct PageListPlugin {
    id: String,
    base_url: Option<Url>,
    max_links: usize,
}

impl PageListPlugin {
    pub fn new(config: &UrlListPluginConfig) -> Self {
        let base_url = config
            .base_url
            .as_deref()
            .and_then(|raw| match Url::parse(raw) {
                Ok(url) => Some(url),
                Err(err) => {
                    engine_warn!("plugin {}: ignoring base_url {:?}: {}", config.id, raw, err);
                    None
                }
            });
        Self {
            id: config.id.clone(),
            base_url,
            max_links: config.max_links_per_page.unwrap_or(DEFAULT_MAX_LINKS),
        }
    }
}

/// Registry holding one [`PageListPlugin`] per configured site.
pub fn registry(plugins: &[UrlListPluginConfig]) -> StaticPluginRegistry {
    plugins
        .iter()
        .fold(StaticPluginRegistry::new(), |registry, config| {
            registry.with(Arc::new(PageListPlugin::new(config)))
        })
}

fn pages(ctx: &ScriptContext) -> Vec<String> {
    ctx.user_config()
        .get("pages")
        .and_then(|pages| pages.as_array())
        .map(|pages| {
            pages
                .iter()
                .filter_map(|page| page.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[async_trait::async_trait]
impl CrawlPlugin for PageListPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn base_url(&self) -> Option<Url> {
        self.base_url.clone()
    }

    async fn run(&self, ctx: ScriptContext) -> Result<(), CrawlError> {
        let pages = pages(&ctx);
        if pages.is_empty() {
            engine_task_log!(log::Level::Warn, ctx.task_id(), "no pages configured");
            return Ok(());
        }
        let page_share = 100.0 / pages.len() as f64;

        for page_url in &pages {
            if ctx.is_cancelled() {
                return Err(CrawlError::AdmissionCancelled {
                    task_id: ctx.task_id().to_string(),
                });
            }
            let page = match ctx.fetch_page(page_url).await {
                Ok(page) => page,
                Err(err) => {
                    engine_task_log!(
                        log::Level::Warn,
                        ctx.task_id(),
                        "skipping page {}: {}",
                        page_url,
                        err
                    );
                    ctx.add_progress(page_share);
                    continue;
                }
            };

            let links = extract_media_links_limited(&page.html, Some(&page.url), self.max_links);
            engine_task_log!(
                log::Level::Info,
                ctx.task_id(),
                "{} media links on {}",
                links.len(),
                page.url
            );
            if links.is_empty() {
                ctx.add_progress(page_share);
                continue;
            }

            let link_share = page_share / links.len() as f64;
            for link in links {
                let result = match link.kind {
                    MediaKind::Image => ctx.prepare_download(&link.url, None).await.map(|_| ()),
                    MediaKind::Archive => ctx.download_archive(&link.url).await,
                };
                match result {
                    Ok(()) => {}
                    Err(err @ CrawlError::AdmissionCancelled { .. }) => return Err(err),
                    // Already recorded as a failed image; keep going.
                    Err(err) => engine_task_log!(
                        log::Level::Debug,
                        ctx.task_id(),
                        "{} failed: {}",
                        link.url,
                        err
                    ),
                }
                ctx.add_progress(link_share);
            }
        }
        Ok(())
    }
}
