mod support;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crawler_engine::{
    CrawlError, DecompressionJob, DecompressionKind, DecompressionQueue, DecompressionWorker,
    DownloadState, EngineEvent, InMemoryCatalog, Registrar, TempDirGuard, ZipExtractor,
    LOCAL_IMPORT_ID,
};
use support::{init_logging, wait_until, with_timeout, RecordingSink};
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;

const ARCHIVE_URL: &str = "https://example.com/files/pack.zip";

fn write_zip(path: &Path, entries: &[(&str, &str)]) {
    let file = File::create(path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Stored);
    for (name, body) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap();
}

struct Harness {
    root: TempDir,
    catalog: Arc<InMemoryCatalog>,
    sink: Arc<RecordingSink>,
    queue: DecompressionQueue,
    shutdown: CancellationToken,
    worker: JoinHandle<()>,
}

impl Harness {
    fn start() -> Self {
        init_logging();
        let root = TempDir::new().unwrap();
        let catalog = Arc::new(InMemoryCatalog::new());
        let sink = RecordingSink::new();
        let registrar = Arc::new(Registrar::new(catalog.clone(), sink.clone()));
        let shutdown = CancellationToken::new();
        let (queue, worker) =
            DecompressionWorker::new(Arc::new(ZipExtractor), registrar, root.path().join("tmp"))
                .spawn(shutdown.clone());
        Self {
            root,
            catalog,
            sink,
            queue,
            shutdown,
            worker,
        }
    }

    fn tmp(&self) -> PathBuf {
        self.root.path().join("tmp")
    }

    fn images_dir(&self) -> PathBuf {
        self.root.path().join("images")
    }

    fn import(
        &self,
        archive: &Path,
    ) -> oneshot::Receiver<Result<crawler_engine::ImportedArchive, CrawlError>> {
        let (reply, rx) = oneshot::channel();
        self.queue
            .submit(DecompressionJob {
                archive_path: archive.to_path_buf(),
                original_url: archive.display().to_string(),
                task_id: LOCAL_IMPORT_ID.to_string(),
                plugin_id: LOCAL_IMPORT_ID.to_string(),
                cancel: CancellationToken::new(),
                kind: DecompressionKind::LocalImport { reply },
            })
            .unwrap();
        rx
    }

    fn crawler_job(&self, archive: &Path, guard: Option<TempDirGuard>) -> DecompressionJob {
        DecompressionJob {
            archive_path: archive.to_path_buf(),
            original_url: ARCHIVE_URL.to_string(),
            task_id: "t1".to_string(),
            plugin_id: "p1".to_string(),
            cancel: CancellationToken::new(),
            kind: DecompressionKind::CrawlerDownload {
                images_dir: self.images_dir(),
                http_headers: BTreeMap::new(),
                output_album_id: Some("album".to_string()),
                download_start_time: 42,
                temp_dir_guard: guard,
            },
        }
    }

    fn scratch_entries(&self) -> usize {
        fs::read_dir(self.tmp()).map(|dir| dir.count()).unwrap_or(0)
    }
}

#[tokio::test]
async fn local_import_returns_images_with_guard() {
    let h = Harness::start();
    let archive = h.root.path().join("book.cbz");
    write_zip(
        &archive,
        &[
            ("ch1/01.png", "one"),
            ("ch1/02.JPG", "two"),
            ("ch1/notes.txt", "not an image"),
        ],
    );

    let imported = with_timeout(h.import(&archive)).await.unwrap().unwrap();
    let mut names: Vec<String> = imported
        .images
        .iter()
        .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    names.sort();
    assert_eq!(names, vec!["01.png", "02.JPG"]);
    assert!(imported.images.iter().all(|p| p.starts_with(imported.guard.path())));
    assert_eq!(fs::read(&imported.images[0]).unwrap().len(), 3);

    let dir = imported.guard.path().to_path_buf();
    drop(imported);
    assert!(!dir.exists());
}

#[tokio::test]
async fn local_import_of_missing_archive_cleans_scratch_dir() {
    let h = Harness::start();
    let result = with_timeout(h.import(&h.root.path().join("missing.zip")))
        .await
        .unwrap();

    match result {
        Err(CrawlError::ExtractionFailed(message)) => {
            assert!(message.contains("not found"), "{message}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(h.scratch_entries(), 0);
    assert!(h
        .sink
        .events()
        .iter()
        .any(|e| matches!(e, EngineEvent::ArchiverLog { task_id: None, .. })));
}

#[tokio::test]
async fn traversal_entries_are_rejected() {
    let h = Harness::start();
    let archive = h.root.path().join("evil.zip");
    write_zip(&archive, &[("ok.png", "1"), ("../../escape.png", "2")]);

    let result = with_timeout(h.import(&archive)).await.unwrap();
    match result {
        Err(CrawlError::ExtractionFailed(message)) => {
            assert!(message.contains("unsafe"), "{message}")
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(!h.root.path().join("escape.png").exists());
    assert_eq!(h.scratch_entries(), 0);
}

#[tokio::test]
async fn dropped_receiver_does_not_stop_the_worker() {
    let h = Harness::start();
    let archive = h.root.path().join("a.zip");
    write_zip(&archive, &[("a.png", "a")]);

    drop(h.import(&archive));
    let imported = with_timeout(h.import(&archive)).await.unwrap().unwrap();
    assert_eq!(imported.images.len(), 1);
}

#[tokio::test]
async fn crawler_archive_registers_entries_and_releases_scratch_dir() {
    let h = Harness::start();
    let guard = TempDirGuard::create_in(&h.tmp()).unwrap();
    let scratch = guard.path().to_path_buf();
    let archive = scratch.join("pack.zip");
    write_zip(&archive, &[("01.png", "one"), ("sub/02.webp", "two")]);

    h.queue.submit(h.crawler_job(&archive, Some(guard))).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            h.sink.download_states(ARCHIVE_URL).contains(&DownloadState::Completed)
        })
        .await
    );
    assert!(wait_until(Duration::from_secs(5), || !scratch.exists()).await);

    let mut urls: Vec<String> = h.catalog.images().into_iter().map(|i| i.url).collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            format!("{ARCHIVE_URL}#01.png"),
            format!("{ARCHIVE_URL}#sub/02.webp"),
        ]
    );
    for image in h.catalog.images() {
        assert!(image.path.starts_with(h.images_dir()));
        assert!(image.path.exists());
        assert_eq!(image.order, 42);
        assert_eq!(image.output_album_id.as_deref(), Some("album"));
    }
}

#[tokio::test]
async fn archive_without_images_becomes_a_placeholder() {
    let h = Harness::start();
    let dir = h.root.path().join("dl");
    fs::create_dir_all(&dir).unwrap();
    let archive = dir.join("pack.zip");
    write_zip(&archive, &[("readme.txt", "hi")]);

    h.queue.submit(h.crawler_job(&archive, None)).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            h.sink.download_states(ARCHIVE_URL).contains(&DownloadState::Failed)
        })
        .await
    );
    let failed = h.catalog.all_failed_images();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].url, ARCHIVE_URL);
    assert_eq!(failed[0].order, 42);
    assert!(h.catalog.images().is_empty());
}

#[tokio::test]
async fn cancelled_jobs_are_dropped_before_extraction() {
    let h = Harness::start();
    let dir = h.root.path().join("dl");
    fs::create_dir_all(&dir).unwrap();
    let archive = dir.join("pack.zip");
    write_zip(&archive, &[("01.png", "one")]);

    let job = h.crawler_job(&archive, None);
    job.cancel.cancel();
    h.queue.submit(job).unwrap();

    assert!(
        wait_until(Duration::from_secs(5), || {
            h.sink.download_states(ARCHIVE_URL).contains(&DownloadState::Failed)
        })
        .await
    );
    assert!(h.catalog.images().is_empty());
    assert!(!dir.join("01.png").exists());
    let failed = h.catalog.all_failed_images();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].url, ARCHIVE_URL);
    assert_eq!(failed[0].order, 42);
}

#[tokio::test]
async fn queued_jobs_are_drained_on_shutdown() {
    let h = Harness::start();
    let dir = h.root.path().join("dl");
    fs::create_dir_all(&dir).unwrap();
    let kept = dir.join("kept.zip");
    let dropped = dir.join("dropped.zip");
    write_zip(&kept, &[("01.png", "one"), ("02.png", "two")]);
    write_zip(&dropped, &[("03.png", "three")]);

    h.queue.submit(h.crawler_job(&kept, None)).unwrap();
    let cancelled = h.crawler_job(&dropped, None);
    cancelled.cancel.cancel();
    h.queue.submit(cancelled).unwrap();
    h.shutdown.cancel();
    with_timeout(h.worker).await.unwrap();

    assert_eq!(h.catalog.images().len(), 2);
    assert_eq!(h.catalog.all_failed_images().len(), 1);
}

#[tokio::test]
async fn extracted_archive_clears_its_placeholder() {
    let h = Harness::start();
    let dir = h.root.path().join("dl");
    fs::create_dir_all(&dir).unwrap();
    let archive = dir.join("pack.zip");

    write_zip(&archive, &[("readme.txt", "no images yet")]);
    h.queue.submit(h.crawler_job(&archive, None)).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || {
            h.catalog.all_failed_images().len() == 1
        })
        .await
    );

    write_zip(&archive, &[("01.png", "one")]);
    h.queue.submit(h.crawler_job(&archive, None)).unwrap();
    assert!(wait_until(Duration::from_secs(5), || h.catalog.images().len() == 1).await);
    assert!(wait_until(Duration::from_secs(5), || h.catalog.all_failed_images().is_empty()).await);
}

#[tokio::test]
async fn stopped_worker_refuses_new_jobs() {
    let h = Harness::start();
    h.shutdown.cancel();
    with_timeout(h.worker).await.unwrap();

    let (reply, rx) = oneshot::channel();
    let err = h
        .queue
        .submit(DecompressionJob {
            archive_path: h.root.path().join("late.zip"),
            original_url: "late.zip".to_string(),
            task_id: LOCAL_IMPORT_ID.to_string(),
            plugin_id: LOCAL_IMPORT_ID.to_string(),
            cancel: CancellationToken::new(),
            kind: DecompressionKind::LocalImport { reply },
        })
        .unwrap_err();

    assert!(matches!(err, CrawlError::EngineStopped));
    assert!(matches!(rx.await.unwrap(), Err(CrawlError::EngineStopped)));
}
