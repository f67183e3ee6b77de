use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::BytesMut;
use engine_logging::engine_task_log;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use tokio::io::AsyncWriteExt;

use crate::decode::{decode_page, DecodedPage};
use crate::{DownloadJob, FailureKind, FetchError};

const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub redirect_limit: usize,
    pub max_bytes: u64,
    /// Empty means any content type is accepted.
    pub allowed_content_types: Vec<String>,
    /// Extra attempts after the first one, for retryable failures only.
    pub retry_count: u32,
    pub retry_backoff: Duration,
    pub user_agent: String,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            redirect_limit: 5,
            max_bytes: 256 * 1024 * 1024,
            allowed_content_types: Vec::new(),
            retry_count: 2,
            retry_backoff: Duration::from_millis(500),
            user_agent: concat!("crawler/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl FetchSettings {
    /// Delay before retry number `attempt` (1-based): base * 2^(attempt-1), capped at 5 s.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.retry_backoff
            .checked_mul(factor)
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }

    fn is_content_type_allowed(&self, content_type: &str) -> bool {
        if self.allowed_content_types.is_empty() {
            return true;
        }
        let ct = content_type.split(';').next().unwrap_or(content_type).trim();
        self.allowed_content_types
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(ct))
    }
}

/// A file that landed at its final destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub content_type: Option<String>,
}

#[async_trait::async_trait]
pub trait DownloadExecutor: Send + Sync {
    /// Fetch `job.url` with `client` and store the body at `destination`.
    async fn download(
        &self,
        client: &reqwest::Client,
        job: &DownloadJob,
        destination: &Path,
    ) -> Result<DownloadedFile, FetchError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    settings: FetchSettings,
}

impl ReqwestExecutor {
    pub fn new(settings: FetchSettings) -> Self {
        Self { settings }
    }

    async fn attempt(
        &self,
        client: &reqwest::Client,
        job: &DownloadJob,
        destination: &Path,
    ) -> Result<DownloadedFile, FetchError> {
        let parsed = reqwest::Url::parse(&job.url)
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
        let headers = header_map(&job.http_headers, &job.task_id);

        let response = client
            .get(parsed)
            .headers(headers)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        if let Some(content_len) = response.content_length() {
            if content_len > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(content_len),
                    },
                    "response too large",
                ));
            }
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        if let Some(ct) = content_type.as_deref() {
            if !self.settings.is_content_type_allowed(ct) {
                return Err(FetchError::new(
                    FailureKind::UnsupportedContentType {
                        content_type: ct.to_string(),
                    },
                    "unsupported content type",
                ));
            }
        }

        let dir = destination
            .parent()
            .ok_or_else(|| FetchError::new(FailureKind::Io, "destination has no parent"))?;
        tokio::fs::create_dir_all(dir).await.map_err(io_error)?;

        // The temp file lives next to the destination so the final rename stays on one
        // filesystem. Dropping `temp_path` on any early return deletes the partial file.
        let (file, temp_path) = tempfile::NamedTempFile::new_in(dir)
            .map_err(io_error)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(map_reqwest_error)?;
            written += chunk.len() as u64;
            if written > self.settings.max_bytes {
                return Err(FetchError::new(
                    FailureKind::TooLarge {
                        max_bytes: self.settings.max_bytes,
                        actual: Some(written),
                    },
                    "response too large",
                ));
            }
            file.write_all(&chunk).await.map_err(io_error)?;
        }
        file.flush().await.map_err(io_error)?;
        file.sync_all().await.map_err(io_error)?;
        drop(file);

        temp_path
            .persist(destination)
            .map_err(|err| io_error(err.error))?;

        Ok(DownloadedFile {
            path: destination.to_path_buf(),
            bytes: written,
            content_type,
        })
    }
}

#[async_trait::async_trait]
impl DownloadExecutor for ReqwestExecutor {
    async fn download(
        &self,
        client: &reqwest::Client,
        job: &DownloadJob,
        destination: &Path,
    ) -> Result<DownloadedFile, FetchError> {
        let mut attempt = 0;
        loop {
            match self.attempt(client, job, destination).await {
                Ok(file) => return Ok(file),
                Err(err) if err.kind.is_retryable() && attempt < self.settings.retry_count => {
                    attempt += 1;
                    let delay = self.settings.backoff(attempt);
                    engine_task_log!(
                        log::Level::Debug,
                        job.task_id,
                        "retry {} for {} in {:?}: {}",
                        attempt,
                        job.url,
                        delay,
                        err
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

/// Builds the per-task client. Every call gets its own, empty cookie jar.
pub fn build_task_client(settings: &FetchSettings) -> Result<reqwest::Client, FetchError> {
    let redirect_limit = settings.redirect_limit;
    let policy = reqwest::redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= redirect_limit {
            attempt.error("redirect limit exceeded")
        } else {
            attempt.follow()
        }
    });

    let mut default_headers = HeaderMap::new();
    if let Ok(agent) = HeaderValue::from_str(&settings.user_agent) {
        default_headers.insert(USER_AGENT, agent);
    }

    reqwest::Client::builder()
        .cookie_store(true)
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.request_timeout)
        .redirect(policy)
        .default_headers(default_headers)
        .build()
        .map_err(|err| FetchError::new(FailureKind::Network, err.to_string()))
}

/// GET a page through the task client and decode it to UTF-8.
pub async fn fetch_page(
    client: &reqwest::Client,
    url: &str,
    headers: HeaderMap,
    settings: &FetchSettings,
) -> Result<DecodedPage, FetchError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;
    let response = client
        .get(parsed)
        .headers(headers)
        .send()
        .await
        .map_err(map_reqwest_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(FetchError::new(
            FailureKind::HttpStatus(status.as_u16()),
            status.to_string(),
        ));
    }

    let final_url = response.url().to_string();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());

    let mut bytes = BytesMut::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(map_reqwest_error)?;
        let next_len = bytes.len() as u64 + chunk.len() as u64;
        if next_len > settings.max_bytes {
            return Err(FetchError::new(
                FailureKind::TooLarge {
                    max_bytes: settings.max_bytes,
                    actual: Some(next_len),
                },
                "response too large",
            ));
        }
        bytes.extend_from_slice(&chunk);
    }

    let (html, encoding) = decode_page(&bytes, content_type.as_deref());
    Ok(DecodedPage {
        url: final_url,
        html,
        encoding_label: encoding.name().to_string(),
        content_type,
    })
}

/// Converts user-configured headers, skipping names or values that are not valid HTTP.
pub(crate) fn header_map(headers: &BTreeMap<String, String>, task_id: &str) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let parsed_name = HeaderName::from_bytes(name.trim().as_bytes());
        let parsed_value = HeaderValue::from_str(value.trim());
        match (parsed_name, parsed_value) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => {
                engine_task_log!(log::Level::Warn, task_id, "skipping invalid header {:?}", name);
            }
        }
    }
    map
}

pub(crate) fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_redirect() {
        return FetchError::new(FailureKind::RedirectLimitExceeded, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}

fn io_error(err: std::io::Error) -> FetchError {
    FetchError::new(FailureKind::Io, err.to_string())
}
