mod support;

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crawler_engine::{
    build_task_client, fetch_page, DownloadExecutor, DownloadJob, FailureKind, FetchSettings,
    ReqwestExecutor,
};
use pretty_assertions::assert_eq;
use reqwest::header::HeaderMap;
use support::init_logging;
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn job(url: String, dir: &Path) -> DownloadJob {
    let mut http_headers = BTreeMap::new();
    http_headers.insert("X-Token".to_string(), "secret".to_string());
    http_headers.insert("bad header".to_string(), "ignored".to_string());
    DownloadJob {
        url,
        task_id: "t".to_string(),
        plugin_id: "p".to_string(),
        destination_dir: dir.to_path_buf(),
        http_headers,
        download_start_time: 1,
        output_album_id: None,
        file_name_hint: None,
    }
}

fn settings() -> FetchSettings {
    FetchSettings {
        retry_backoff: Duration::from_millis(10),
        request_timeout: Duration::from_secs(5),
        ..FetchSettings::default()
    }
}

fn entries(dir: &Path) -> usize {
    fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

#[tokio::test]
async fn download_writes_file_with_job_headers() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a.png"))
        .and(header("x-token", "secret"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"PNGDATA".to_vec(), "image/png"))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("out").join("a.png");
    let client = build_task_client(&settings()).unwrap();
    let executor = ReqwestExecutor::new(settings());
    let file = executor
        .download(&client, &job(format!("{}/a.png", server.uri()), temp.path()), &dest)
        .await
        .expect("download ok");

    assert_eq!(file.path, dest);
    assert_eq!(file.bytes, 7);
    assert_eq!(file.content_type.as_deref(), Some("image/png"));
    assert_eq!(fs::read(&dest).unwrap(), b"PNGDATA");
    // Only the final file remains; the temp file was renamed into place.
    assert_eq!(entries(dest.parent().unwrap()), 1);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing.png"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("missing.png");
    let client = build_task_client(&settings()).unwrap();
    let err = ReqwestExecutor::new(settings())
        .download(&client, &job(format!("{}/missing.png", server.uri()), temp.path()), &dest)
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::HttpStatus(404));
    assert!(!dest.exists());
}

#[tokio::test]
async fn server_errors_are_retried_with_backoff() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.png"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"ok".to_vec(), "image/png"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let dest = temp.path().join("flaky.png");
    let client = build_task_client(&settings()).unwrap();
    ReqwestExecutor::new(settings())
        .download(&client, &job(format!("{}/flaky.png", server.uri()), temp.path()), &dest)
        .await
        .expect("third attempt succeeds");

    assert_eq!(fs::read(&dest).unwrap(), b"ok");
    assert_eq!(server.received_requests().await.unwrap().len(), 3);
}

#[tokio::test]
async fn retries_stop_after_retry_count() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let settings = FetchSettings {
        retry_count: 1,
        ..settings()
    };
    let client = build_task_client(&settings).unwrap();
    let err = ReqwestExecutor::new(settings)
        .download(
            &client,
            &job(format!("{}/down.png", server.uri()), temp.path()),
            &temp.path().join("down.png"),
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind, FailureKind::HttpStatus(500));
    assert_eq!(server.received_requests().await.unwrap().len(), 2);
}

#[tokio::test]
async fn oversized_body_leaves_no_partial_file() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/large.png"))
        .respond_with(ResponseTemplate::new(200).set_body_string("01234567890"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let settings = FetchSettings {
        max_bytes: 10,
        ..settings()
    };
    let dest = temp.path().join("large.png");
    let client = build_task_client(&settings).unwrap();
    let err = ReqwestExecutor::new(settings)
        .download(&client, &job(format!("{}/large.png", server.uri()), temp.path()), &dest)
        .await
        .unwrap_err();

    assert!(matches!(err.kind, FailureKind::TooLarge { max_bytes: 10, .. }));
    assert_eq!(entries(temp.path()), 0);
}

#[tokio::test]
async fn disallowed_content_type_is_rejected() {
    init_logging();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("<html></html>", "text/html"))
        .mount(&server)
        .await;

    let temp = TempDir::new().unwrap();
    let settings = FetchSettings {
        allowed_content_types: vec!["image/png".to_string()],
        ..settings()
    };
    let client = build_task_client(&settings).unwrap();
    let err = ReqwestExecutor::new(settings)
        .download(
            &client,
            &job(format!("{}/page", server.uri()), temp.path()),
            &temp.path().join("page"),
        )
        .await
        .unwrap_err();

    assert_eq!(
        err.kind,
        FailureKind::UnsupportedContentType {
            content_type: "text/html".to_string()
        }
    );
}

#[tokio::test]
async fn fetch_page_decodes_declared_charset() {
    init_logging();
    let server = MockServer::start().await;
    let (body, _, _) = encoding_rs::SHIFT_JIS.encode("<p>こんにちは</p>");
    Mock::given(method("GET"))
        .and(path("/sjis"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(body.into_owned(), "text/html; charset=Shift_JIS"),
        )
        .mount(&server)
        .await;

    let client = build_task_client(&settings()).unwrap();
    let page = fetch_page(
        &client,
        &format!("{}/sjis", server.uri()),
        HeaderMap::new(),
        &settings(),
    )
    .await
    .unwrap();

    assert_eq!(page.html, "<p>こんにちは</p>");
    assert_eq!(page.encoding_label, "Shift_JIS");
}

#[test]
fn backoff_doubles_and_is_capped() {
    let settings = FetchSettings::default();
    assert_eq!(settings.backoff(1), Duration::from_millis(500));
    assert_eq!(settings.backoff(2), Duration::from_millis(1000));
    assert_eq!(settings.backoff(4), Duration::from_millis(4000));
    assert_eq!(settings.backoff(5), Duration::from_secs(5));
    assert_eq!(settings.backoff(40), Duration::from_secs(5));
}

#[test]
fn retryable_failures() {
    assert!(FailureKind::Network.is_retryable());
    assert!(FailureKind::Timeout.is_retryable());
    assert!(FailureKind::HttpStatus(408).is_retryable());
    assert!(FailureKind::HttpStatus(429).is_retryable());
    assert!(FailureKind::HttpStatus(502).is_retryable());
    assert!(!FailureKind::HttpStatus(404).is_retryable());
    assert!(!FailureKind::InvalidUrl.is_retryable());
}
