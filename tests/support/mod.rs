//! Shared helpers for integration tests.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use folio_core::auth::{AuthError, CapturedSession, Reauthenticator, RefreshRequest, SessionStore};
use folio_core::download::{FastGet, HttpClient, RetryPolicy};
use wiremock::{Request, Respond, ResponseTemplate};

/// Deterministic pseudo-random bytes.
pub fn sample_bytes(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x2545_f491;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            (state >> 24) as u8
        })
        .collect()
}

/// A retry policy with millisecond delays.
pub fn fast_retry_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::with_retries(retries).with_delays(Duration::from_millis(1), Duration::from_millis(5))
}

/// A downloader with fast retries and no re-authentication.
pub fn fast_get() -> FastGet {
    fast_get_with(Arc::new(SessionStore::new(None)))
}

/// A downloader with fast retries over the given session store.
pub fn fast_get_with(sessions: Arc<SessionStore>) -> FastGet {
    FastGet::new(
        HttpClient::with_defaults().expect("client should build"),
        sessions,
    )
    .with_retry_policy(fast_retry_policy(2))
    .with_segment_retry_delay(Duration::from_millis(1))
}

/// Serves a body, honoring `Range: bytes=start-end` with `206 Partial Content`.
pub struct RangeResponder {
    body: Arc<Vec<u8>>,
}

impl RangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            body: Arc::new(body),
        }
    }
}

impl Respond for RangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let total = self.body.len();
        match request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range)
        {
            Some((start, end)) if start < total => {
                let end = end.min(total - 1);
                ResponseTemplate::new(206)
                    .insert_header("Content-Range", format!("bytes {start}-{end}/{total}").as_str())
                    .set_body_bytes(self.body[start..=end].to_vec())
            }
            Some(_) => ResponseTemplate::new(416),
            None => ResponseTemplate::new(200).set_body_bytes(self.body.to_vec()),
        }
    }
}

/// Serves ranges starting at 0, fails every other range with 500, and
/// serves the full body to plain requests.
pub struct BrokenRangeResponder {
    inner: RangeResponder,
}

impl BrokenRangeResponder {
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            inner: RangeResponder::new(body),
        }
    }
}

impl Respond for BrokenRangeResponder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let range = request
            .headers
            .get("range")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_range);
        match range {
            Some((start, _)) if start > 0 => ResponseTemplate::new(500),
            _ => self.inner.respond(request),
        }
    }
}

fn parse_range(value: &str) -> Option<(usize, usize)> {
    let spec = value.strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Re-authenticator returning fixed session text and counting captures.
#[derive(Debug)]
pub struct CountingReauth {
    contents: String,
    calls: Arc<AtomicUsize>,
}

impl CountingReauth {
    pub fn new(contents: &str) -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                contents: contents.to_string(),
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }
}

#[async_trait]
impl Reauthenticator for CountingReauth {
    async fn capture(&self, _request: &RefreshRequest) -> Result<CapturedSession, AuthError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(CapturedSession::new(self.contents.clone()))
    }
}
