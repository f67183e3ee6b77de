use std::fmt;
use std::io;

use crawler_core::TaskId;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for FetchError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    HttpStatus(u16),
    Timeout,
    RedirectLimitExceeded,
    TooLarge { max_bytes: u64, actual: Option<u64> },
    UnsupportedContentType { content_type: String },
    Cancelled,
    Io,
    Network,
}

impl FailureKind {
    /// Transient failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Network | FailureKind::Timeout => true,
            FailureKind::HttpStatus(code) => matches!(code, 408 | 429 | 500..=599),
            _ => false,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::InvalidUrl => write!(f, "invalid url"),
            FailureKind::HttpStatus(code) => write!(f, "http status {code}"),
            FailureKind::Timeout => write!(f, "timeout"),
            FailureKind::RedirectLimitExceeded => write!(f, "redirect limit exceeded"),
            FailureKind::TooLarge { max_bytes, actual } => {
                write!(f, "response too large (max {max_bytes}, actual {actual:?})")
            }
            FailureKind::UnsupportedContentType { content_type } => {
                write!(f, "unsupported content type {content_type}")
            }
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Io => write!(f, "io error"),
            FailureKind::Network => write!(f, "network error"),
        }
    }
}

/// Errors from the archive extraction capability.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive not found: {0}")]
    NotFound(String),
    #[error("unsupported archive: {0}")]
    Unsupported(String),
    #[error("unsafe entry path in archive: {0}")]
    UnsafePath(String),
    #[error("corrupt archive: {0}")]
    Corrupt(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors reported by the catalog collaborator.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("failed image {0} not found")]
    FailedImageNotFound(u64),
    #[error("catalog storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Error)]
pub enum CrawlError {
    #[error("task {task_id} was stopped while waiting for a download slot")]
    AdmissionCancelled { task_id: TaskId },
    #[error("fetch failed: {0}")]
    FetchFailed(FetchError),
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
    #[error("reply channel closed before the result was delivered")]
    ReplyChannelClosed,
    #[error("task {0} not found")]
    TaskNotFound(TaskId),
    #[error("task {0} is not running")]
    TaskNotRunning(TaskId),
    #[error("plugin {0} not found")]
    PluginNotFound(String),
    #[error("failed image {0} not found")]
    FailedImageNotFound(u64),
    #[error("download rejected: {0}")]
    Rejected(String),
    #[error("no pending native download for {0}")]
    UnknownDownload(String),
    #[error("a native download for {0} is already pending")]
    DuplicateDownload(String),
    #[error(transparent)]
    Catalog(CatalogError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("engine has stopped")]
    EngineStopped,
}

impl From<FetchError> for CrawlError {
    fn from(err: FetchError) -> Self {
        CrawlError::FetchFailed(err)
    }
}

impl From<ExtractError> for CrawlError {
    fn from(err: ExtractError) -> Self {
        CrawlError::ExtractionFailed(err.to_string())
    }
}

impl From<CatalogError> for CrawlError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::FailedImageNotFound(id) => CrawlError::FailedImageNotFound(id),
            other => CrawlError::Catalog(other),
        }
    }
}
