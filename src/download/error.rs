//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so a failed task can be
//! reported (and re-run) without any other context.

use std::path::PathBuf;

use thiserror::Error;

use crate::auth::AuthError;

/// Errors that can occur while fetching a single task.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection reset, TLS errors, body read).
    #[error("network error downloading {url}: {source}")]
    Network {
        /// The URL that failed to download.
        url: String,
        /// The underlying network error.
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout {
        /// The URL that timed out.
        url: String,
    },

    /// Non-success HTTP response that is not an authentication failure.
    #[error("HTTP {status} downloading {url}")]
    HttpStatus {
        /// The URL that returned an error status.
        url: String,
        /// The HTTP status code.
        status: u16,
        /// The Retry-After header value, if present (for 429 responses).
        retry_after: Option<String>,
    },

    /// The server rejected the session (401/403/407) or answered with a
    /// "session expired" page where binary content was expected.
    ///
    /// `status` is 0 when the failure was detected from the body.
    #[error("[AUTH] authentication required for {domain} (HTTP {status}) downloading {url}")]
    AuthRequired {
        /// The URL that requires authentication.
        url: String,
        /// The HTTP status code, or 0 for a body marker match.
        status: u16,
        /// The domain whose session must be refreshed.
        domain: String,
    },

    /// Local file system error (create, write, rename). Fatal for the run.
    #[error("IO error writing to {path}: {source}")]
    Io {
        /// The file path where the error occurred.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or not absolute.
    #[error("invalid URL: {url}")]
    InvalidUrl {
        /// The invalid URL string.
        url: String,
    },

    /// Written byte count does not match what the server advertised.
    #[error(
        "integrity check failed for {path}: expected {expected_bytes} bytes, got {actual_bytes}"
    )]
    Integrity {
        /// Path that failed verification.
        path: PathBuf,
        /// Expected size in bytes.
        expected_bytes: u64,
        /// Actual size in bytes.
        actual_bytes: u64,
    },

    /// The server does not honor byte ranges for this resource.
    #[error("range requests unsupported for {url}: {reason}")]
    RangeUnsupported {
        /// The URL that was probed.
        url: String,
        /// What the probe or segment response showed.
        reason: String,
    },

    /// One segment of a ranged download failed after its local retries.
    #[error("segment {part} of {url} failed: {source}")]
    Segment {
        /// The URL being fetched.
        url: String,
        /// Index of the failed segment.
        part: usize,
        /// The last error seen for the segment.
        #[source]
        source: Box<DownloadError>,
    },

    /// The run was cancelled before this task could start another attempt.
    #[error("cancelled before downloading {url}")]
    Cancelled {
        /// The URL that was not fetched.
        url: String,
    },

    /// Re-authentication was attempted and failed.
    #[error("session refresh for {domain} failed: {source}")]
    SessionRefresh {
        /// The domain whose refresh failed.
        domain: String,
        /// The session layer error.
        #[source]
        source: AuthError,
    },
}

impl DownloadError {
    /// Creates a network error from a reqwest error, folding timeouts into
    /// [`DownloadError::Timeout`].
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::Timeout { url: url.into() };
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error.
    pub fn http_status(url: impl Into<String>, status: u16) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after: None,
        }
    }

    /// Creates an HTTP status error with a Retry-After header value.
    pub fn http_status_with_retry_after(
        url: impl Into<String>,
        status: u16,
        retry_after: Option<String>,
    ) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status,
            retry_after,
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates an integrity mismatch error.
    pub fn integrity(path: impl Into<PathBuf>, expected_bytes: u64, actual_bytes: u64) -> Self {
        Self::Integrity {
            path: path.into(),
            expected_bytes,
            actual_bytes,
        }
    }

    /// Creates an authentication-required error.
    pub fn auth_required(url: impl Into<String>, status: u16, domain: impl Into<String>) -> Self {
        Self::AuthRequired {
            url: url.into(),
            status,
            domain: domain.into(),
        }
    }

    /// Creates a range-unsupported error.
    pub fn range_unsupported(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RangeUnsupported {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Wraps the last error of a failed segment.
    pub fn segment(url: impl Into<String>, part: usize, source: DownloadError) -> Self {
        Self::Segment {
            url: url.into(),
            part,
            source: Box::new(source),
        }
    }

    /// Creates a cancellation error.
    pub fn cancelled(url: impl Into<String>) -> Self {
        Self::Cancelled { url: url.into() }
    }

    /// Returns the HTTP status most relevant to this error, if any.
    ///
    /// Segment failures report the status of the segment's last response.
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } | Self::AuthRequired { status, .. } => Some(*status),
            Self::Segment { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Returns true for errors caused by the local machine (disk full,
    /// permission denied, bad destination). These recur for every task.
    #[must_use]
    pub fn is_local_fatal(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Segment { source, .. } => source.is_local_fatal(),
            _ => false,
        }
    }

    /// Returns true when the run was cancelled, including cancellation
    /// reported by a segment worker.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        match self {
            Self::Cancelled { .. } => true,
            Self::Segment { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status("https://example.com/0001.jpg", 404);
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(
            msg.contains("https://example.com/0001.jpg"),
            "Expected URL in: {msg}"
        );
        assert_eq!(error.status(), Some(404));
    }

    #[test]
    fn test_download_error_io_is_local_fatal() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/0001.jpg"), io_error);
        assert!(error.to_string().contains("/tmp/0001.jpg"));
        assert!(error.is_local_fatal());
    }

    #[test]
    fn test_download_error_auth_required_display() {
        let error =
            DownloadError::auth_required("https://example.com/0001.jpg", 401, "example.com");
        let msg = error.to_string();
        assert!(msg.starts_with("[AUTH]"), "Expected [AUTH] prefix in: {msg}");
        assert!(msg.contains("example.com"));
        assert!(msg.contains("HTTP 401"));
    }

    #[test]
    fn test_segment_error_forwards_status_and_fatality() {
        let inner = DownloadError::http_status("https://example.com/big.pdf", 503);
        let error = DownloadError::segment("https://example.com/big.pdf", 2, inner);
        assert_eq!(error.status(), Some(503));
        assert!(!error.is_local_fatal());
        assert!(error.to_string().contains("segment 2"));

        let io = DownloadError::io(
            "/tmp/part2",
            std::io::Error::new(std::io::ErrorKind::StorageFull, "no space"),
        );
        let error = DownloadError::segment("https://example.com/big.pdf", 2, io);
        assert!(error.is_local_fatal());
    }

    #[test]
    fn test_cancelled_segment_counts_as_cancelled() {
        let inner = DownloadError::cancelled("https://example.com/big.pdf");
        let error = DownloadError::segment("https://example.com/big.pdf", 3, inner);
        assert!(error.is_cancelled());
        assert!(!error.is_local_fatal());

        let error = DownloadError::segment(
            "https://example.com/big.pdf",
            3,
            DownloadError::http_status("https://example.com/big.pdf", 500),
        );
        assert!(!error.is_cancelled());
    }

    #[test]
    fn test_timeout_and_cancelled_have_no_status() {
        assert_eq!(DownloadError::timeout("https://example.com").status(), None);
        assert_eq!(DownloadError::cancelled("https://example.com").status(), None);
    }
}
