//! Pluggable re-authentication.
//!
//! When a server rejects the session, the [`SessionStore`](super::SessionStore)
//! asks a [`Reauthenticator`] for fresh session text (header lines, a cookie
//! string, or any format [`parse_session_text`](super::parse_session_text)
//! accepts). How the text is obtained is up to the implementation: a person
//! refreshing the cookie file from a browser, a browser-automation script, or
//! fixed credentials.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::AuthError;

/// Default time allowed for a capture step (5 minutes).
pub const DEFAULT_CAPTURE_TIMEOUT: Duration = Duration::from_secs(300);

/// What a capture step is asked to refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshRequest {
    /// Domain whose session expired.
    pub domain: String,
    /// URL whose request was rejected, when known.
    pub url: Option<String>,
    /// Configured cookie file, when there is one.
    pub cookie_file: Option<PathBuf>,
}

/// Session text produced by a capture step.
#[derive(Clone, PartialEq, Eq)]
pub struct CapturedSession {
    /// Session text in any supported cookie file format.
    pub contents: String,
    /// True when the capture already wrote the cookie file itself.
    pub already_persisted: bool,
}

impl CapturedSession {
    /// Creates a capture result that still needs to be persisted.
    #[must_use]
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
            already_persisted: false,
        }
    }
}

impl fmt::Debug for CapturedSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapturedSession")
            .field("contents", &format_args!("<{} bytes>", self.contents.len()))
            .field("already_persisted", &self.already_persisted)
            .finish()
    }
}

/// Obtains fresh session credentials for a domain.
///
/// Implementations may block for a long time (a person logging in). The
/// session store guarantees at most one call per domain at a time.
#[async_trait]
pub trait Reauthenticator: Send + Sync + fmt::Debug {
    /// Captures new session text for `request.domain`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when no usable session could be obtained.
    async fn capture(&self, request: &RefreshRequest) -> Result<CapturedSession, AuthError>;
}

/// Waits for the cookie file to be refreshed externally.
///
/// Logs a prompt, then polls the file until its contents change (and are not
/// empty) or the timeout elapses.
#[derive(Debug, Clone)]
pub struct CookieFileWatcher {
    poll_interval: Duration,
    timeout: Duration,
}

impl Default for CookieFileWatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPTURE_TIMEOUT)
    }
}

impl CookieFileWatcher {
    /// Creates a watcher polling once per second.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout,
        }
    }

    /// Overrides the poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl Reauthenticator for CookieFileWatcher {
    #[instrument(skip(self), fields(domain = %request.domain))]
    async fn capture(&self, request: &RefreshRequest) -> Result<CapturedSession, AuthError> {
        let Some(path) = request.cookie_file.as_deref() else {
            return Err(AuthError::Capture {
                domain: request.domain.clone(),
                reason: "no cookie file configured to watch".to_string(),
            });
        };

        let baseline = read_optional(path).await?;
        warn!(
            domain = %request.domain,
            url = request.url.as_deref().unwrap_or(""),
            path = %path.display(),
            "session expired; open the site in a browser, log in, and save the new cookies to the cookie file"
        );

        let deadline = Instant::now() + self.timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;
            let current = read_optional(path).await?;
            if let Some(contents) = current
                && !contents.trim().is_empty()
                && baseline.as_deref() != Some(contents.as_str())
            {
                info!(path = %path.display(), "cookie file updated");
                return Ok(CapturedSession {
                    contents,
                    already_persisted: true,
                });
            }
            if Instant::now() >= deadline {
                return Err(AuthError::Timeout {
                    domain: request.domain.clone(),
                    waited_secs: self.timeout.as_secs(),
                });
            }
        }
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, AuthError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(Some(contents)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(AuthError::CookieFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Runs an external command (typically a browser-automation script) and
/// takes its standard output as the captured session text.
///
/// `{url}` and `{domain}` in the arguments are replaced before spawning.
#[derive(Debug, Clone)]
pub struct ExternalCapture {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ExternalCapture {
    /// Creates a capture step for `program` with `args`.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Splits a whitespace-separated command line into program and arguments.
    ///
    /// Returns `None` for a blank command line.
    #[must_use]
    pub fn from_command_line(command_line: &str, timeout: Duration) -> Option<Self> {
        let mut words = command_line.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect(), timeout))
    }

    fn expand_args(&self, request: &RefreshRequest) -> Vec<String> {
        let url = request.url.as_deref().unwrap_or("");
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{url}", url)
                    .replace("{domain}", &request.domain)
            })
            .collect()
    }
}

#[async_trait]
impl Reauthenticator for ExternalCapture {
    #[instrument(skip(self), fields(domain = %request.domain, program = %self.program))]
    async fn capture(&self, request: &RefreshRequest) -> Result<CapturedSession, AuthError> {
        let args = self.expand_args(request);
        debug!(?args, "running capture command");

        let child = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AuthError::Command {
                command: self.program.clone(),
                source,
            })?;

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| AuthError::Timeout {
                domain: request.domain.clone(),
                waited_secs: self.timeout.as_secs(),
            })?
            .map_err(|source| AuthError::Command {
                command: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AuthError::Capture {
                domain: request.domain.clone(),
                reason: format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            });
        }

        let contents = String::from_utf8_lossy(&output.stdout).into_owned();
        if contents.trim().is_empty() {
            return Err(AuthError::Capture {
                domain: request.domain.clone(),
                reason: format!("{} produced no output", self.program),
            });
        }
        Ok(CapturedSession::new(contents))
    }
}

/// Returns the same session text on every call.
#[derive(Clone)]
pub struct StaticCredentials {
    contents: String,
}

impl StaticCredentials {
    /// Creates a capture step that always yields `contents`.
    #[must_use]
    pub fn new(contents: impl Into<String>) -> Self {
        Self {
            contents: contents.into(),
        }
    }
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StaticCredentials(<redacted>)")
    }
}

#[async_trait]
impl Reauthenticator for StaticCredentials {
    async fn capture(&self, _request: &RefreshRequest) -> Result<CapturedSession, AuthError> {
        Ok(CapturedSession::new(self.contents.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(cookie_file: Option<PathBuf>) -> RefreshRequest {
        RefreshRequest {
            domain: "example.com".to_string(),
            url: Some("https://example.com/0001.jpg".to_string()),
            cookie_file,
        }
    }

    #[tokio::test]
    async fn test_static_credentials_returns_contents() {
        let captured = StaticCredentials::new("Cookie: sid=1")
            .capture(&request(None))
            .await
            .unwrap();
        assert_eq!(captured.contents, "Cookie: sid=1");
        assert!(!captured.already_persisted);
    }

    #[test]
    fn test_debug_output_hides_session_text() {
        let debug = format!("{:?}", CapturedSession::new("Cookie: sid=secret"));
        assert!(!debug.contains("secret"));
        let debug = format!("{:?}", StaticCredentials::new("Cookie: sid=secret"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn test_external_capture_expands_placeholders() {
        let capture = ExternalCapture::from_command_line(
            "capture.sh --url {url} --site {domain}",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(capture.program, "capture.sh");
        assert_eq!(
            capture.expand_args(&request(None)),
            vec![
                "--url",
                "https://example.com/0001.jpg",
                "--site",
                "example.com"
            ]
        );
        assert!(ExternalCapture::from_command_line("   ", Duration::from_secs(5)).is_none());
    }

    #[tokio::test]
    async fn test_external_capture_missing_program_is_command_error() {
        let capture = ExternalCapture::new(
            "folio-no-such-capture-program",
            Vec::new(),
            Duration::from_secs(5),
        );
        let result = capture.capture(&request(None)).await;
        assert!(matches!(result, Err(AuthError::Command { .. })));
    }

    #[tokio::test]
    async fn test_cookie_file_watcher_requires_cookie_file() {
        let watcher = CookieFileWatcher::new(Duration::from_secs(1));
        let result = watcher.capture(&request(None)).await;
        assert!(matches!(result, Err(AuthError::Capture { .. })));
    }

    #[tokio::test]
    async fn test_cookie_file_watcher_picks_up_new_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookie.txt");
        std::fs::write(&path, "Cookie: sid=old").unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            tokio::fs::write(&writer_path, "Cookie: sid=new").await.unwrap();
        });

        let watcher = CookieFileWatcher::new(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(10));
        let captured = watcher.capture(&request(Some(path))).await.unwrap();
        writer.await.unwrap();

        assert_eq!(captured.contents, "Cookie: sid=new");
        assert!(captured.already_persisted);
    }

    #[tokio::test]
    async fn test_cookie_file_watcher_times_out_without_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cookie.txt");
        std::fs::write(&path, "Cookie: sid=old").unwrap();

        let watcher = CookieFileWatcher::new(Duration::from_millis(30))
            .with_poll_interval(Duration::from_millis(10));
        let result = watcher.capture(&request(Some(path))).await;
        assert!(matches!(result, Err(AuthError::Timeout { .. })));
    }
}
