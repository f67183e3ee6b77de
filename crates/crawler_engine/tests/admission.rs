mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crawler_engine::{AdmissionLimits, CrawlError, DownloadAdmission};
use pretty_assertions::assert_eq;
use support::{init_logging, with_timeout};
use tokio_util::sync::CancellationToken;

fn limits(max_concurrency: usize, interval_ms: u64) -> AdmissionLimits {
    AdmissionLimits {
        max_concurrency,
        interval_ms,
    }
}

#[tokio::test]
async fn in_flight_downloads_never_exceed_max_concurrency() {
    init_logging();
    let admission = DownloadAdmission::new(false);
    admission.open("t", limits(2, 0), CancellationToken::new());

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..5 {
        let admission = admission.clone();
        let current = current.clone();
        let peak = peak.clone();
        handles.push(tokio::spawn(async move {
            let ticket = admission.prepare("t").await.expect("admitted");
            let now = current.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            current.fetch_sub(1, Ordering::SeqCst);
            drop(ticket);
        }));
    }
    for handle in handles {
        with_timeout(handle).await.unwrap();
    }

    assert_eq!(peak.load(Ordering::SeqCst), 2);
    assert_eq!(admission.in_flight("t"), 0);
}

#[tokio::test]
async fn stopping_rejects_every_waiter() {
    init_logging();
    let admission = DownloadAdmission::new(false);
    let cancel = CancellationToken::new();
    admission.open("t", limits(1, 0), cancel.clone());

    let held = admission.prepare("t").await.unwrap();
    let mut waiters = Vec::new();
    for _ in 0..3 {
        let admission = admission.clone();
        waiters.push(tokio::spawn(async move { admission.prepare("t").await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(waiters.iter().all(|waiter| !waiter.is_finished()));

    cancel.cancel();
    for waiter in waiters {
        let result = with_timeout(waiter).await.unwrap();
        assert!(matches!(
            result,
            Err(CrawlError::AdmissionCancelled { ref task_id }) if task_id == "t"
        ));
    }

    // Nothing new is admitted and the granted ticket is unaffected.
    assert!(matches!(
        admission.prepare("t").await,
        Err(CrawlError::AdmissionCancelled { .. })
    ));
    assert_eq!(admission.in_flight("t"), 1);
    drop(held);
    assert_eq!(admission.in_flight("t"), 0);
}

#[tokio::test]
async fn consecutive_grants_respect_interval() {
    init_logging();
    let admission = DownloadAdmission::new(false);
    admission.open("t", limits(4, 80), CancellationToken::new());

    let mut grants = Vec::new();
    for _ in 0..3 {
        let ticket = with_timeout(admission.prepare("t")).await.unwrap();
        grants.push(ticket.granted_at());
    }
    for pair in grants.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(80));
    }
}

#[tokio::test]
async fn interval_can_change_while_running() {
    init_logging();
    let admission = DownloadAdmission::new(false);
    admission.open("t", limits(1, 0), CancellationToken::new());

    let first = admission.prepare("t").await.unwrap();
    let first_at = first.granted_at();
    drop(first);
    admission.set_interval("t", 60).unwrap();
    let second = with_timeout(admission.prepare("t")).await.unwrap();
    assert!(second.granted_at() - first_at >= Duration::from_millis(60));

    assert!(matches!(
        admission.set_interval("other", 10),
        Err(CrawlError::TaskNotRunning(_))
    ));
}

#[tokio::test]
async fn waiters_are_admitted_in_request_order() {
    init_logging();
    let admission = DownloadAdmission::new(false);
    admission.open("t", limits(1, 0), CancellationToken::new());

    let held = admission.prepare("t").await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let mut handles = Vec::new();
    for index in 0..4 {
        let admission = admission.clone();
        let order = order.clone();
        handles.push(tokio::spawn(async move {
            let _ticket = admission.prepare("t").await.unwrap();
            order.lock().unwrap().push(index);
        }));
        // Let this waiter queue up before the next one arrives.
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    drop(held);
    for handle in handles {
        with_timeout(handle).await.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn closed_or_unknown_task_is_not_admitted() {
    init_logging();
    let admission = DownloadAdmission::new(true);
    assert!(matches!(
        admission.prepare("missing").await,
        Err(CrawlError::TaskNotRunning(_))
    ));

    admission.open("t", limits(1, 0), CancellationToken::new());
    let ticket = admission.prepare("t").await.unwrap();
    assert!(ticket.native_interception());
    assert_eq!(ticket.task_id(), "t");

    admission.close("t");
    assert!(!admission.is_open("t"));
    assert!(matches!(
        admission.prepare("t").await,
        Err(CrawlError::TaskNotRunning(_))
    ));
}
