//! Integration tests for session cookies and re-authentication.

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use folio_core::auth::{ExternalCapture, SessionStore};
use folio_core::download::{DownloadManager, DownloadTask};
use folio_core::layout::DestinationLayout;
use tempfile::TempDir;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{CountingReauth, fast_get_with};

async fn protected_server(cookie: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("cookie", cookie))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page".to_vec()))
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_concurrent_auth_failures_share_one_refresh() {
    let server = protected_server("sid=fresh").await;
    let (reauth, calls) = CountingReauth::new("Cookie: sid=fresh");
    let sessions = Arc::new(SessionStore::new(None).with_reauthenticator(Arc::new(reauth)));

    let dir = TempDir::new().expect("failed to create temp dir");
    let mut manager = DownloadManager::new(
        fast_get_with(sessions),
        8,
        DestinationLayout::new(dir.path()),
    );
    for page in 1..=16 {
        manager.add_task(DownloadTask::new(
            format!("{}/p/{page}.jpg", server.uri()),
            dir.path().join(format!("{page:04}.jpg")),
        ));
    }

    let summary = manager.start().await.expect("run");
    assert_eq!(summary.downloaded, 16);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cookie_file_is_read_on_every_request() {
    let server = protected_server("sid=disk").await;
    let dir = TempDir::new().expect("failed to create temp dir");
    let cookie_file = dir.path().join("cookie.txt");
    let sessions = Arc::new(SessionStore::new(Some(cookie_file.clone())));
    let fetcher = fast_get_with(sessions);

    let first = dir.path().join("0001.jpg");
    let result = fetcher
        .fetch(&DownloadTask::new(format!("{}/1.jpg", server.uri()), &first))
        .await;
    assert!(result.is_err(), "no cookie yet");

    // refreshed externally while the process keeps running
    std::fs::write(&cookie_file, "Cookie: sid=disk\n").expect("write cookie file");
    let second = dir.path().join("0002.jpg");
    fetcher
        .fetch(&DownloadTask::new(format!("{}/2.jpg", server.uri()), &second))
        .await
        .expect("cookie file picked up");
    assert_eq!(std::fs::read(&second).expect("read"), b"page");
}

#[cfg(unix)]
#[tokio::test]
async fn test_external_capture_persists_cookie_file() {
    let server = protected_server("sid=shell").await;
    let dir = TempDir::new().expect("failed to create temp dir");
    let cookie_file = dir.path().join("cookie.txt");

    let capture = ExternalCapture::new(
        "sh",
        vec!["-c".to_string(), "echo 'Cookie: sid=shell'".to_string()],
        Duration::from_secs(10),
    );
    let sessions = Arc::new(
        SessionStore::new(Some(cookie_file.clone())).with_reauthenticator(Arc::new(capture)),
    );

    let dest = dir.path().join("0001.jpg");
    let report = fast_get_with(sessions)
        .fetch(&DownloadTask::new(format!("{}/1.jpg", server.uri()), &dest))
        .await
        .expect("download after capture");

    assert_eq!(report.attempts, 2);
    let saved = std::fs::read_to_string(&cookie_file).expect("cookie file persisted");
    assert!(saved.contains("sid=shell"));
}

#[tokio::test]
async fn test_task_cookie_header_merges_with_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("cookie", "sid=disk; lang=en"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"page".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("failed to create temp dir");
    let cookie_file = dir.path().join("cookie.txt");
    std::fs::write(&cookie_file, "Cookie: sid=disk\n").expect("write cookie file");
    let sessions = Arc::new(SessionStore::new(Some(cookie_file)));

    let dest = dir.path().join("0001.jpg");
    fast_get_with(sessions)
        .fetch(
            &DownloadTask::new(format!("{}/1.jpg", server.uri()), &dest)
                .with_header("Cookie", "lang=en"),
        )
        .await
        .expect("download with merged cookies");
}
