//! HTTP client wrapper for fetching task bodies to disk.
//!
//! The [`HttpClient`] builds every request from the task's own headers plus
//! the session headers for the request host (re-read from the cookie file on
//! each call), and streams bodies to a `.part` sibling that is renamed over
//! the destination only after the byte count has been verified.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::{
    CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue, RANGE,
    RETRY_AFTER, USER_AGENT,
};
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument, warn};
use url::Url;

use super::constants::{
    CONNECT_TIMEOUT_SECS, MAX_MARKER_SCAN_BYTES, PART_SUFFIX, READ_TIMEOUT_SECS,
    SEGMENTS_DIR_SUFFIX,
};
use super::error::DownloadError;
use super::rate_limiter::extract_domain;
use super::task::{DownloadTask, Method};
use crate::auth::Session;
use crate::user_agent;

/// What a metadata probe learned about a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemoteMeta {
    /// Total size in bytes, when the server reported it.
    pub size: Option<u64>,
    /// Whether the server answered a byte range with `206 Partial Content`.
    pub accepts_ranges: bool,
}

/// HTTP client for streaming task bodies to disk.
///
/// Created once per run and shared by every worker, so connections are pooled.
/// Transparent decompression is off: `Content-Length` and byte ranges always
/// refer to the bytes on the wire.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    user_agent: String,
    session_markers: Arc<Vec<Vec<u8>>>,
}

impl HttpClient {
    /// Creates a client with default timeouts (30s connect, 5 min read) and
    /// the default browser User-Agent.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the TLS backend cannot be initialised.
    pub fn with_defaults() -> Result<Self, reqwest::Error> {
        Self::new(
            &user_agent::default_download_user_agent(),
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with an explicit User-Agent and timeouts.
    ///
    /// # Errors
    ///
    /// Returns the reqwest error if the TLS backend cannot be initialised.
    #[instrument(level = "debug")]
    pub fn new(
        user_agent: &str,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()?;
        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            session_markers: Arc::new(Vec::new()),
        })
    }

    /// Sets byte patterns that mark a "session expired" page.
    ///
    /// A small text/html or text/plain body containing any of them
    /// (ASCII case-insensitive) fails with [`DownloadError::AuthRequired`]
    /// and status 0 instead of being saved.
    #[must_use]
    pub fn with_session_markers<I, M>(mut self, markers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: AsRef<[u8]>,
    {
        self.session_markers = Arc::new(
            markers
                .into_iter()
                .map(|marker| marker.as_ref().to_ascii_lowercase())
                .filter(|marker| !marker.is_empty())
                .collect(),
        );
        self
    }

    /// Returns the configured default User-Agent.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Asks the server for the resource size and whether it honors ranges.
    ///
    /// Sends the task's request with `Range: bytes=0-0`; a `206` carrying a
    /// `Content-Range` total means ranged fetching is possible. A plain `200`
    /// reports its `Content-Length` without range support. Any other
    /// non-auth status yields an empty [`RemoteMeta`] so the caller can fall
    /// back to a single stream.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::AuthRequired`] for 401/403/407, and network
    /// errors as usual.
    #[instrument(skip(self, task, session), fields(url = %task.uri))]
    pub async fn probe(
        &self,
        task: &DownloadTask,
        session: &Session,
    ) -> Result<RemoteMeta, DownloadError> {
        let response = self.send(task, session, Some((0, 0))).await?;
        let status = response.status().as_u16();
        if is_auth_status(status) {
            return Err(DownloadError::auth_required(
                &task.uri,
                status,
                extract_domain(&task.uri),
            ));
        }

        let meta = match status {
            206 => RemoteMeta {
                size: response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_content_range_total),
                accepts_ranges: true,
            },
            200 => RemoteMeta {
                size: header_content_length(&response),
                accepts_ranges: false,
            },
            _ => {
                debug!(status, "probe inconclusive");
                RemoteMeta::default()
            }
        };
        debug!(size = ?meta.size, accepts_ranges = meta.accepts_ranges, "probed remote");
        Ok(meta)
    }

    /// Fetches the whole body to `task.destination` through a `.part` file.
    ///
    /// Returns the number of bytes written. On any failure the `.part` file
    /// is removed and the destination is left untouched.
    ///
    /// # Errors
    ///
    /// - [`DownloadError::AuthRequired`] for 401/403/407 or a session-expired page
    /// - [`DownloadError::HttpStatus`] for other non-2xx statuses (with Retry-After)
    /// - [`DownloadError::RangeUnsupported`] for a `206` the request did not ask for
    /// - [`DownloadError::Integrity`] when the body is shorter or longer than advertised
    /// - [`DownloadError::Io`] when the destination cannot be written
    #[instrument(skip(self, task, session), fields(url = %task.uri, path = %task.destination.display()))]
    pub async fn download(
        &self,
        task: &DownloadTask,
        session: &Session,
    ) -> Result<u64, DownloadError> {
        let destination = task.destination();
        ensure_parent_dir(destination).await?;
        let part = part_path(destination);

        let response = self.send(task, session, None).await?;
        let response = check_response(&task.uri, response, false)?;
        let expected = header_content_length(&response);
        let scan = self.should_scan_for_markers(&response, expected);

        let written = match self
            .write_body(&task.uri, response, &part, expected, scan)
            .await
        {
            Ok(written) => written,
            Err(error) => {
                debug!(path = %part.display(), "removing partial file after error");
                let _ = tokio::fs::remove_file(&part).await;
                return Err(error);
            }
        };

        if let Err(e) = tokio::fs::rename(&part, destination).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(DownloadError::io(destination, e));
        }

        info!(bytes = written, "download complete");
        Ok(written)
    }

    /// Fetches bytes `start..=end` of the task's resource into `path`.
    ///
    /// The server must answer `206`; a `200` means it ignored the range.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::RangeUnsupported`] for a non-206 success, and
    /// [`DownloadError::Integrity`] when the segment length is wrong.
    #[instrument(level = "debug", skip(self, task, session, path), fields(url = %task.uri))]
    pub async fn fetch_range(
        &self,
        task: &DownloadTask,
        session: &Session,
        start: u64,
        end: u64,
        path: &Path,
    ) -> Result<u64, DownloadError> {
        let response = self.send(task, session, Some((start, end))).await?;
        let response = check_response(&task.uri, response, true)?;
        let expected = end - start + 1;
        self.write_body(&task.uri, response, path, Some(expected), false)
            .await
    }

    async fn send(
        &self,
        task: &DownloadTask,
        session: &Session,
        range: Option<(u64, u64)>,
    ) -> Result<reqwest::Response, DownloadError> {
        let url = Url::parse(&task.uri).map_err(|_| DownloadError::invalid_url(&task.uri))?;
        let Some(host) = url.host_str().map(str::to_string) else {
            return Err(DownloadError::invalid_url(&task.uri));
        };

        let headers = self.request_headers(task, session, &host).await;
        let mut request = match &task.method {
            Method::Get => self.client.get(url),
            Method::Post(Some(body)) => self.client.post(url).body(body.clone()),
            Method::Post(None) => self.client.post(url),
        };
        request = request.headers(headers);
        if let Some((start, end)) = range {
            request = request.header(RANGE, format!("bytes={start}-{end}"));
        }

        request
            .send()
            .await
            .map_err(|e| DownloadError::network(&task.uri, e))
    }

    /// Layers request headers: configured UA, then session headers (a
    /// captured UA replaces the configured one), then task headers. A task
    /// `Cookie` header is merged into the session cookies by name.
    async fn request_headers(&self, task: &DownloadTask, session: &Session, host: &str) -> HeaderMap {
        let mut session_headers = session.request_headers(host).await;
        let mut map = HeaderMap::new();

        let ua = session_headers
            .user_agent
            .clone()
            .unwrap_or_else(|| self.user_agent.clone());
        insert_header(&mut map, USER_AGENT.as_str(), &ua);
        for (name, value) in &session_headers.extra {
            insert_header(&mut map, name, value);
        }

        for (name, value) in &task.headers {
            if name.eq_ignore_ascii_case("cookie") {
                session_headers.merge_cookie_string(value);
            } else {
                insert_header(&mut map, name, value);
            }
        }
        if let Some(cookie) = session_headers.cookie_header() {
            insert_header(&mut map, "cookie", &cookie);
        }
        map
    }

    fn should_scan_for_markers(&self, response: &reqwest::Response, expected: Option<u64>) -> bool {
        if self.session_markers.is_empty() || expected.is_some_and(|len| len > MAX_MARKER_SCAN_BYTES)
        {
            return false;
        }
        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| {
                let ct = ct.to_ascii_lowercase();
                ct.starts_with("text/html") || ct.starts_with("text/plain")
            })
    }

    /// Streams the body to `path`, returning bytes written.
    ///
    /// With `scan` set, the first chunks are held back until either the body
    /// ends (then it is checked for session markers) or it grows past the
    /// scan limit (then it is written out and streaming continues).
    async fn write_body(
        &self,
        url: &str,
        response: reqwest::Response,
        path: &Path,
        expected: Option<u64>,
        mut scan: bool,
    ) -> Result<u64, DownloadError> {
        let file = File::create(path)
            .await
            .map_err(|e| DownloadError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut held: Vec<u8> = Vec::new();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| DownloadError::network(url, e))?;
            if scan {
                if (held.len() + chunk.len()) as u64 <= MAX_MARKER_SCAN_BYTES {
                    held.extend_from_slice(&chunk);
                    continue;
                }
                scan = false;
                writer
                    .write_all(&held)
                    .await
                    .map_err(|e| DownloadError::io(path, e))?;
                written += held.len() as u64;
                held = Vec::new();
            }
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            written += chunk.len() as u64;
        }

        if !held.is_empty() {
            if contains_marker(&held, &self.session_markers) {
                warn!(url, "response looks like a session-expired page");
                return Err(DownloadError::auth_required(url, 0, extract_domain(url)));
            }
            writer
                .write_all(&held)
                .await
                .map_err(|e| DownloadError::io(path, e))?;
            written += held.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(path, e))?;

        if let Some(expected) = expected
            && expected != written
        {
            return Err(DownloadError::integrity(path, expected, written));
        }
        Ok(written)
    }
}

/// Returns the in-progress sibling of a destination (`<dest>.part`).
#[must_use]
pub fn part_path(destination: &Path) -> PathBuf {
    with_suffix(destination, PART_SUFFIX)
}

/// Returns the directory holding segment files for a destination.
#[must_use]
pub fn segments_dir(destination: &Path) -> PathBuf {
    with_suffix(destination, SEGMENTS_DIR_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

pub(crate) async fn ensure_parent_dir(path: &Path) -> Result<(), DownloadError> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::io(parent, e))?;
    }
    Ok(())
}

fn is_auth_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 407)
}

fn check_response(
    url: &str,
    response: reqwest::Response,
    expect_partial: bool,
) -> Result<reqwest::Response, DownloadError> {
    let status = response.status().as_u16();
    if is_auth_status(status) {
        return Err(DownloadError::auth_required(url, status, extract_domain(url)));
    }
    if !response.status().is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        return Err(DownloadError::http_status_with_retry_after(
            url,
            status,
            retry_after,
        ));
    }
    match (expect_partial, status == 206) {
        (true, false) => Err(DownloadError::range_unsupported(
            url,
            format!("expected 206 Partial Content, got {status}"),
        )),
        (false, true) => Err(DownloadError::range_unsupported(
            url,
            "server answered 206 to a request without Range",
        )),
        _ => Ok(response),
    }
}

fn header_content_length(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

/// Parses the total from `Content-Range: bytes 0-0/12345`.
fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

fn contains_marker(body: &[u8], markers: &[Vec<u8>]) -> bool {
    let body = body.to_ascii_lowercase();
    markers
        .iter()
        .any(|marker| body.windows(marker.len()).any(|window| window == marker.as_slice()))
}

fn insert_header(map: &mut HeaderMap, name: &str, value: &str) {
    match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        (Ok(name), Ok(value)) => {
            map.insert(name, value);
        }
        _ => warn!(header = name, "skipping invalid request header"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_part_and_segment_paths_are_siblings() {
        let dest = Path::new("/data/example.com_b1/0001.jpg");
        assert_eq!(part_path(dest), PathBuf::from("/data/example.com_b1/0001.jpg.part"));
        assert_eq!(
            segments_dir(dest),
            PathBuf::from("/data/example.com_b1/0001.jpg.segments")
        );
    }

    #[test]
    fn test_parse_content_range_total() {
        assert_eq!(parse_content_range_total("bytes 0-0/12345"), Some(12345));
        assert_eq!(parse_content_range_total("bytes 0-0/*"), None);
        assert_eq!(parse_content_range_total("garbage"), None);
    }

    #[test]
    fn test_contains_marker_is_case_insensitive() {
        let markers = vec![b"session expired".to_vec()];
        assert!(contains_marker(b"<html>Your SESSION EXPIRED</html>", &markers));
        assert!(!contains_marker(b"<html>ok</html>", &markers));
        assert!(!contains_marker(b"anything", &[]));
    }

    #[test]
    fn test_session_markers_are_normalized() {
        let client = HttpClient::with_defaults()
            .unwrap()
            .with_session_markers(["Please Log In", ""]);
        assert_eq!(client.session_markers.as_slice(), &[b"please log in".to_vec()]);
    }

    #[test]
    fn test_insert_header_skips_invalid_names() {
        let mut map = HeaderMap::new();
        insert_header(&mut map, "Referer", "https://example.com/book");
        insert_header(&mut map, "bad header", "x");
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("referer").unwrap(), "https://example.com/book");
    }
}
