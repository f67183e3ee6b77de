use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crawler_engine::{
    Catalog, CatalogImage, CrawlError, DownloadJob, FailedImageRecord, FailureTracker,
    InMemoryCatalog,
};
use pretty_assertions::assert_eq;

fn job(task_id: &str, url: &str, start: u64) -> DownloadJob {
    DownloadJob {
        url: url.to_string(),
        task_id: task_id.to_string(),
        plugin_id: "p".to_string(),
        destination_dir: PathBuf::from("/images"),
        http_headers: BTreeMap::new(),
        download_start_time: start,
        output_album_id: Some("album-1".to_string()),
        file_name_hint: None,
    }
}

fn tracker() -> (Arc<InMemoryCatalog>, FailureTracker) {
    let catalog = Arc::new(InMemoryCatalog::new());
    (catalog.clone(), FailureTracker::new(catalog))
}

#[test]
fn repeated_failure_updates_one_record_and_keeps_order() {
    let (catalog, failures) = tracker();
    let first = failures.record_failure(&job("t", "https://x/1.png", 100), "404").unwrap();
    let second = failures.record_failure(&job("t", "https://x/1.png", 900), "timeout").unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(second.order, 100);
    assert_eq!(second.last_error.as_deref(), Some("timeout"));
    assert_eq!(catalog.all_failed_images().len(), 1);
}

#[test]
fn failed_images_are_listed_per_task_by_order() {
    let (_catalog, failures) = tracker();
    failures.record_failure(&job("t", "https://x/3.png", 30), "e").unwrap();
    failures.record_failure(&job("t", "https://x/1.png", 10), "e").unwrap();
    failures.record_failure(&job("other", "https://x/2.png", 20), "e").unwrap();

    let urls: Vec<String> = failures
        .failed_images("t")
        .unwrap()
        .into_iter()
        .map(|record| record.url)
        .collect();
    assert_eq!(urls, vec!["https://x/1.png", "https://x/3.png"]);
}

#[test]
fn retry_job_reuses_original_order() {
    let (_catalog, failures) = tracker();
    let record = failures.record_failure(&job("t", "https://x/1.png", 77), "e").unwrap();
    let retried = failures.begin_retry(record.id).unwrap();
    assert!(retried.last_attempted_at.is_some());

    let mut headers = BTreeMap::new();
    headers.insert("Referer".to_string(), "https://x/".to_string());
    let retry = FailureTracker::retry_job(&retried, PathBuf::from("/out"), headers.clone());
    assert_eq!(retry.download_start_time, 77);
    assert_eq!(retry.url, "https://x/1.png");
    assert_eq!(retry.destination_dir, PathBuf::from("/out"));
    assert_eq!(retry.http_headers, headers);
    assert_eq!(retry.output_album_id.as_deref(), Some("album-1"));
}

#[test]
fn unknown_failed_image_is_reported() {
    let (_catalog, failures) = tracker();
    assert!(matches!(
        failures.begin_retry(999),
        Err(CrawlError::FailedImageNotFound(999))
    ));
}

#[test]
fn registering_the_image_clears_its_placeholder() {
    let (catalog, failures) = tracker();
    failures.record_failure(&job("t", "https://x/1.png", 5), "e").unwrap();
    failures.record_failure(&job("t", "https://x/2.png", 6), "e").unwrap();

    catalog
        .register_image(CatalogImage {
            task_id: "t".to_string(),
            plugin_id: "p".to_string(),
            url: "https://x/1.png".to_string(),
            path: PathBuf::from("/images/1.png"),
            order: 5,
            output_album_id: None,
        })
        .unwrap();

    let left = failures.failed_images("t").unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].url, "https://x/2.png");
}

#[test]
fn restored_records_keep_ids_unique() {
    let restored = FailedImageRecord {
        id: 7,
        task_id: "t".to_string(),
        plugin_id: "p".to_string(),
        url: "https://x/old.png".to_string(),
        order: 1,
        created_at: 1,
        last_error: None,
        last_attempted_at: None,
        output_album_id: None,
    };
    let catalog = Arc::new(InMemoryCatalog::with_failed_images(vec![restored]));
    let failures = FailureTracker::new(catalog.clone());

    let fresh = failures.record_failure(&job("t", "https://x/new.png", 2), "e").unwrap();
    assert!(fresh.id > 7);

    catalog.forget_task("t");
    assert!(catalog.all_failed_images().is_empty());
}

#[test]
fn clear_removes_only_the_matching_record() {
    let (catalog, failures) = tracker();
    failures.record_failure(&job("t", "https://x/pack.zip", 10), "404").unwrap();
    failures.record_failure(&job("other", "https://x/pack.zip", 10), "404").unwrap();

    assert!(failures.clear("t", "https://x/pack.zip").unwrap());
    assert!(!failures.clear("t", "https://x/pack.zip").unwrap());
    let left = catalog.all_failed_images();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].task_id, "other");
}
