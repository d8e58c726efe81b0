//! Units of work and their results.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// HTTP method of a download request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Method {
    /// Plain GET. The only method eligible for ranged fetching.
    #[default]
    Get,
    /// POST with an optional body (form or JSON, as the site requires).
    Post(Option<Vec<u8>>),
}

impl Method {
    /// Returns the wire name of the method.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post(_) => "POST",
        }
    }
}

/// One remote URI mapped to one destination path.
///
/// The destination identifies the task: callers must never submit two tasks
/// writing the same path in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTask {
    /// Absolute source URL.
    pub uri: String,
    /// Absolute destination path.
    pub destination: PathBuf,
    /// Extra request headers (User-Agent, Referer, Cookie overrides).
    pub headers: BTreeMap<String, String>,
    /// Request method.
    pub method: Method,
    /// Parallel range segments; 1 disables chunking.
    pub concurrency: usize,
    /// Re-download even when the destination already exists.
    pub overwrite: bool,
}

impl DownloadTask {
    /// Creates a GET task with no extra headers and chunking disabled.
    #[must_use]
    pub fn new(uri: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            uri: uri.into(),
            destination: destination.into(),
            headers: BTreeMap::new(),
            method: Method::Get,
            concurrency: 1,
            overwrite: false,
        }
    }

    /// Adds a request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Replaces all request headers.
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the number of range segments (clamped to at least 1).
    #[must_use]
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Sets the overwrite policy.
    #[must_use]
    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    /// Switches the task to POST with an optional body.
    #[must_use]
    pub fn with_post(mut self, body: Option<Vec<u8>>) -> Self {
        self.method = Method::Post(body);
        self
    }

    /// Returns the destination path.
    #[must_use]
    pub fn destination(&self) -> &Path {
        &self.destination
    }
}

/// Final status of a task that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    /// Bytes were fetched and the destination written.
    Downloaded,
    /// A non-empty destination already existed; nothing was fetched.
    Skipped,
}

/// Result of a successful or skipped fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    /// Final destination path.
    pub destination: PathBuf,
    /// Size of the destination after the call.
    pub bytes_written: u64,
    /// Whether bytes were fetched.
    pub outcome: TaskOutcome,
    /// Number of attempts made (0 when skipped).
    pub attempts: u32,
    /// Whether the body was fetched with parallel range requests.
    pub ranged: bool,
}

impl TaskReport {
    pub(crate) fn skipped(destination: PathBuf, bytes: u64) -> Self {
        Self {
            destination,
            bytes_written: bytes,
            outcome: TaskOutcome::Skipped,
            attempts: 0,
            ranged: false,
        }
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Downloaded => f.write_str("downloaded"),
            Self::Skipped => f.write_str("skipped"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_builder_defaults_and_overrides() {
        let task = DownloadTask::new("https://example.com/0001.jpg", "/tmp/book/0001.jpg");
        assert_eq!(task.method, Method::Get);
        assert_eq!(task.concurrency, 1);
        assert!(!task.overwrite);
        assert!(task.headers.is_empty());

        let task = task
            .with_header("Referer", "https://example.com/book")
            .with_concurrency(0)
            .with_overwrite(true)
            .with_post(Some(b"page=1".to_vec()));
        assert_eq!(task.concurrency, 1);
        assert!(task.overwrite);
        assert_eq!(task.method.as_str(), "POST");
        assert_eq!(
            task.headers.get("Referer").map(String::as_str),
            Some("https://example.com/book")
        );
    }
}
