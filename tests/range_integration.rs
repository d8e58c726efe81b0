//! Integration tests for ranged (segmented) downloads.

mod support;

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use folio_core::download::{DownloadError, DownloadTask, segments_dir};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use support::{BrokenRangeResponder, RangeResponder, fast_get, sample_bytes};

fn sha256_file(path: &Path) -> Vec<u8> {
    let bytes = std::fs::read(path).expect("read downloaded file");
    Sha256::digest(&bytes).to_vec()
}

async fn range_server(route: &str, body: Vec<u8>) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(RangeResponder::new(body))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_ten_megabyte_file_matches_single_stream() {
    let body = sample_bytes(10 * 1024 * 1024);
    let server = range_server("/volume.pdf", body.clone()).await;
    let url = format!("{}/volume.pdf", server.uri());
    let dir = TempDir::new().expect("failed to create temp dir");
    let fetcher = fast_get();

    let single = dir.path().join("single/volume.pdf");
    let report = fetcher
        .fetch(&DownloadTask::new(&url, &single))
        .await
        .expect("single-stream download");
    assert!(!report.ranged);

    let ranged = dir.path().join("ranged/volume.pdf");
    let report = fetcher
        .fetch(&DownloadTask::new(&url, &ranged).with_concurrency(4))
        .await
        .expect("ranged download");
    assert!(report.ranged);
    assert_eq!(report.bytes_written, body.len() as u64);

    assert_eq!(sha256_file(&single), sha256_file(&ranged));
    assert_eq!(sha256_file(&ranged), Sha256::digest(&body).to_vec());
    assert!(!segments_dir(&ranged).exists());
}

#[tokio::test]
async fn test_odd_sizes_merge_in_part_order() {
    let body = sample_bytes(100_003);
    let server = range_server("/page.tif", body.clone()).await;
    let url = format!("{}/page.tif", server.uri());
    let dir = TempDir::new().expect("failed to create temp dir");
    let fetcher = fast_get();

    for concurrency in [2, 3, 7] {
        let dest = dir.path().join(format!("c{concurrency}/page.tif"));
        let report = fetcher
            .fetch(&DownloadTask::new(&url, &dest).with_concurrency(concurrency))
            .await
            .expect("ranged download");
        assert!(report.ranged, "concurrency {concurrency}");
        assert_eq!(
            std::fs::read(&dest).expect("read"),
            body,
            "concurrency {concurrency}"
        );
    }
}

#[tokio::test]
async fn test_server_without_range_support_uses_single_stream() {
    let body = sample_bytes(4096);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let dest = dir.path().join("0001.jpg");
    let report = fast_get()
        .fetch(&DownloadTask::new(format!("{}/0001.jpg", server.uri()), &dest).with_concurrency(4))
        .await
        .expect("download");

    assert!(!report.ranged);
    assert_eq!(std::fs::read(&dest).expect("read"), body);
}

#[tokio::test]
async fn test_failing_segments_fall_back_to_single_stream() {
    let body = sample_bytes(64 * 1024);
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(BrokenRangeResponder::new(body.clone()))
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let dest = dir.path().join("0001.jpg");
    let report = fast_get()
        .fetch(&DownloadTask::new(format!("{}/0001.jpg", server.uri()), &dest).with_concurrency(4))
        .await
        .expect("fallback download");

    assert!(!report.ranged);
    assert_eq!(report.attempts, 1);
    assert_eq!(std::fs::read(&dest).expect("read"), body);
    assert!(!segments_dir(&dest).exists());
}

/// Counts requests sent without a `Range` header.
struct PlainRequestCounter {
    inner: BrokenRangeResponder,
    plain: Arc<AtomicUsize>,
}

impl Respond for PlainRequestCounter {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        if !request.headers.contains_key("range") {
            self.plain.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.respond(request)
    }
}

#[tokio::test]
async fn test_cancel_during_segments_does_not_fall_back() {
    let plain = Arc::new(AtomicUsize::new(0));
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(PlainRequestCounter {
            inner: BrokenRangeResponder::new(sample_bytes(64 * 1024)),
            plain: Arc::clone(&plain),
        })
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let dest = dir.path().join("0001.jpg");
    let fetcher = fast_get().with_segment_retry_delay(Duration::from_millis(300));
    let cancel = fetcher.cancel_flag();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.store(true, Ordering::SeqCst);
    });

    let result = fetcher
        .fetch(&DownloadTask::new(format!("{}/0001.jpg", server.uri()), &dest).with_concurrency(4))
        .await;

    assert!(
        matches!(result, Err(DownloadError::Cancelled { .. })),
        "expected cancellation, got {result:?}"
    );
    assert_eq!(plain.load(Ordering::SeqCst), 0);
    assert!(!dest.exists());
    assert!(!segments_dir(&dest).exists());
}
