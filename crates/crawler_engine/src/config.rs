use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use crate::admission::AdmissionLimits;
use crate::fetch::FetchSettings;
use crate::TaskRequest;

const DEFAULT_CRAWLER_PAGE: &str = r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>crawler</title></head>
<body>
<iframe id="crawler-frame" style="width:100%;height:100vh;border:0"></iframe>
<script>
  const params = new URLSearchParams(location.search);
  const target = params.get("url");
  if (target) {
    document.getElementById("crawler-frame").src = "/proxy?url=" + encodeURIComponent(target);
  }
</script>
</body>
</html>
"#;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub fetch: FetchSettings,
    pub default_max_concurrency: usize,
    pub default_interval_ms: u64,
    /// Parent of per-plugin image directories when a task names none.
    pub default_images_dir: PathBuf,
    /// Scratch space for downloaded archives and local imports.
    pub temp_root: PathBuf,
    /// Must be a loopback address; port 0 picks a free port.
    pub proxy_bind: SocketAddr,
    /// Entry page served at `/crawler`.
    pub crawler_page_html: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let base = std::env::temp_dir().join("crawler");
        Self {
            fetch: FetchSettings::default(),
            default_max_concurrency: 2,
            default_interval_ms: 0,
            default_images_dir: base.join("images"),
            temp_root: base.join("tmp"),
            proxy_bind: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            crawler_page_html: DEFAULT_CRAWLER_PAGE.to_string(),
        }
    }
}

impl EngineConfig {
    pub fn images_dir(&self, request: &TaskRequest) -> PathBuf {
        request
            .output_dir
            .clone()
            .unwrap_or_else(|| self.default_images_dir.join(&request.plugin_id))
    }

    pub fn limits(&self, request: &TaskRequest) -> AdmissionLimits {
        AdmissionLimits {
            max_concurrency: request
                .max_concurrency
                .unwrap_or(self.default_max_concurrency),
            interval_ms: request.interval_ms.unwrap_or(self.default_interval_ms),
        }
    }
}
