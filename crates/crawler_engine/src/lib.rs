//! Crawler engine: the IO side of task scheduling.
//!
//! Download admission, the download executor, the decompression worker, failure
//! placeholders, the loopback proxy and the async loop that executes
//! `crawler_core` effects.
mod active;
mod admission;
mod archive;
mod catalog;
mod config;
mod decode;
mod decompression;
mod download;
mod engine;
mod error;
mod failures;
mod fetch;
mod filename;
mod headers;
mod links;
mod persist;
mod proxy;
mod registrar;
mod script;
mod temp_dir;
mod types;

pub use active::{ActiveTask, ActiveTaskSlot};
pub use admission::{AdmissionLimits, AdmissionTicket, DownloadAdmission};
pub use archive::{is_archive_path, is_archive_url, is_image_path, ArchiveExtractor, ZipExtractor};
pub use catalog::{Catalog, CatalogImage, InMemoryCatalog, NewFailedImage};
pub use config::EngineConfig;
pub use decode::{decode_entry_name, decode_page, DecodedPage};
pub use decompression::{
    DecompressionJob, DecompressionKind, DecompressionQueue, DecompressionWorker,
    ImportedArchive, ImportReply, LOCAL_IMPORT_ID,
};
pub use download::REJECT_PREFIX;
pub use engine::{EngineBuilder, EngineHandle, NativeDownloadHost, NoNativeDownloads, TaskHandle};
pub use error::{CatalogError, CrawlError, ExtractError, FailureKind, FetchError};
pub use failures::FailureTracker;
pub use fetch::{
    build_task_client, fetch_page, DownloadExecutor, DownloadedFile, FetchSettings,
    ReqwestExecutor,
};
pub use filename::{safe_image_filename, unique_path};
pub use headers::HeaderRules;
pub use links::{extract_media_links, extract_media_links_limited, MediaKind, MediaLink};
pub use persist::{ensure_output_dir, AtomicFileWriter, PersistError};
pub use proxy::{router as proxy_router, ProxyServer};
pub use registrar::Registrar;
pub use script::{CrawlPlugin, PluginRegistry, ScriptContext, StaticPluginRegistry};
pub use temp_dir::TempDirGuard;
pub use types::{
    now_ms, ActiveDownload, ChannelEventSink, DownloadJob, DownloadState, DownloadStateEvent,
    EngineEvent, EventSink, FailedImageRecord, PrepareOutcome, TaskRequest,
};
