//! Shared session state and serialized refresh.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::cookies::{SessionHeaders, merge_cookie_file, parse_session_text};
use super::reauth::{Reauthenticator, RefreshRequest};
use super::AuthError;

/// Cookie jar plus the cookie file that backs it.
///
/// Shared by reference across every task of a run. Reads are lock-free; the
/// jar is only mutated through [`SessionStore`].
#[derive(Debug, Default)]
pub struct Session {
    cookie_file: Option<PathBuf>,
    jar: DashMap<String, SessionHeaders>,
}

impl Session {
    /// Creates a session backed by `cookie_file` (if any) with an empty jar.
    #[must_use]
    pub fn new(cookie_file: Option<PathBuf>) -> Self {
        Self {
            cookie_file,
            jar: DashMap::new(),
        }
    }

    /// Returns the cookie file path.
    #[must_use]
    pub fn cookie_file(&self) -> Option<&Path> {
        self.cookie_file.as_deref()
    }

    /// Returns the headers to send to `host`.
    ///
    /// The cookie file is read on every call so an externally refreshed file
    /// applies to the very next request. Jar entries for `host` and its parent
    /// domains are merged first; the file's entries win on name clashes. A
    /// missing or unreadable file contributes nothing.
    pub async fn request_headers(&self, host: &str) -> SessionHeaders {
        let host = host.to_ascii_lowercase();
        let mut headers = self.jar_headers(&host);

        if let Some(path) = self.cookie_file.as_deref() {
            match tokio::fs::read_to_string(path).await {
                Ok(contents) => match parse_session_text(&contents, &host) {
                    Ok(file_headers) => headers.overlay(&file_headers),
                    Err(error) => {
                        warn!(path = %path.display(), error = %error, "ignoring unparsable cookie file");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to read cookie file");
                }
            }
        }
        headers
    }

    /// Returns the in-memory headers for `host`, most specific domain last.
    #[must_use]
    pub fn jar_headers(&self, host: &str) -> SessionHeaders {
        let host = host.to_ascii_lowercase();
        let mut suffixes = Vec::new();
        let mut rest = host.as_str();
        loop {
            suffixes.push(rest);
            match rest.split_once('.') {
                Some((_, parent)) if !parent.is_empty() => rest = parent,
                _ => break,
            }
        }

        let mut headers = SessionHeaders::default();
        for domain in suffixes.iter().rev() {
            if let Some(entry) = self.jar.get(*domain) {
                headers.overlay(entry.value());
            }
        }
        headers
    }

    fn install(&self, domain: &str, headers: &SessionHeaders) {
        self.jar
            .entry(domain.to_ascii_lowercase())
            .or_default()
            .overlay(headers);
    }
}

/// Result of a [`SessionStore::refresh`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// This caller ran the capture and installed new credentials.
    Refreshed,
    /// Another caller refreshed the domain while this one waited.
    Joined,
}

#[derive(Debug, Default)]
struct DomainRefresh {
    /// Completed refresh attempts, successful or not.
    attempts: AtomicU64,
    /// Held for the duration of a refresh; stores the last failure message.
    last_failure: tokio::sync::Mutex<Option<String>>,
}

/// Owner of the session: every mutation of the jar goes through here.
///
/// Refreshes are single-flight per domain. A caller that observed the session
/// at attempt counter `n` (see [`SessionStore::generation`]) and finds the
/// counter past `n` once it gets the refresh lock joins that refresh's result
/// instead of starting another capture.
pub struct SessionStore {
    session: Arc<Session>,
    reauth: Option<Arc<dyn Reauthenticator>>,
    refreshes: DashMap<String, Arc<DomainRefresh>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("cookie_file", &self.session.cookie_file)
            .field("reauth", &self.reauth)
            .finish_non_exhaustive()
    }
}

impl SessionStore {
    /// Creates a store for `cookie_file` with no re-authentication capability.
    #[must_use]
    pub fn new(cookie_file: Option<PathBuf>) -> Self {
        Self {
            session: Arc::new(Session::new(cookie_file)),
            reauth: None,
            refreshes: DashMap::new(),
        }
    }

    /// Sets the capture step used by [`refresh`](Self::refresh).
    #[must_use]
    pub fn with_reauthenticator(mut self, reauth: Arc<dyn Reauthenticator>) -> Self {
        self.reauth = Some(reauth);
        self
    }

    /// Returns the shared session handle.
    #[must_use]
    pub fn load(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Returns the refresh attempt counter for `domain`.
    #[must_use]
    pub fn generation(&self, domain: &str) -> u64 {
        self.refreshes
            .get(&domain.to_ascii_lowercase())
            .map_or(0, |entry| entry.attempts.load(Ordering::Acquire))
    }

    /// Installs session text for `domain` in the jar (not persisted).
    ///
    /// Used by discovery code that obtained cookies on its own.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Parse`] when `contents` cannot be parsed.
    pub fn install(&self, domain: &str, contents: &str) -> Result<(), AuthError> {
        let headers = parse_session_text(contents, domain)?;
        debug!(domain, cookies = ?headers.cookie_names(), "installing session headers");
        self.session.install(domain, &headers);
        Ok(())
    }

    /// Refreshes the session for `domain`, or joins a refresh already in
    /// progress.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError`] when the capture fails, when no capture step is
    /// configured, or when the joined refresh failed.
    pub async fn refresh(&self, domain: &str) -> Result<RefreshOutcome, AuthError> {
        let seen = self.generation(domain);
        self.refresh_since(domain, None, seen).await
    }

    /// Refreshes `domain` unless a refresh completed after the caller
    /// observed attempt counter `seen`.
    ///
    /// # Errors
    ///
    /// See [`refresh`](Self::refresh).
    #[instrument(skip(self), fields(domain = %domain))]
    pub async fn refresh_since(
        &self,
        domain: &str,
        url: Option<&str>,
        seen: u64,
    ) -> Result<RefreshOutcome, AuthError> {
        let domain = domain.to_ascii_lowercase();
        let state = Arc::clone(
            self.refreshes
                .entry(domain.clone())
                .or_default()
                .value(),
        );

        let mut last_failure = state.last_failure.lock().await;
        if state.attempts.load(Ordering::Acquire) > seen {
            debug!("joined concurrent session refresh");
            return match last_failure.as_ref() {
                Some(reason) => Err(AuthError::JoinedRefreshFailed {
                    domain,
                    reason: reason.clone(),
                }),
                None => Ok(RefreshOutcome::Joined),
            };
        }

        let result = self.run_refresh(&domain, url).await;
        *last_failure = result.as_ref().err().map(ToString::to_string);
        state.attempts.fetch_add(1, Ordering::AcqRel);
        result.map(|()| RefreshOutcome::Refreshed)
    }

    async fn run_refresh(&self, domain: &str, url: Option<&str>) -> Result<(), AuthError> {
        let Some(reauth) = self.reauth.as_ref() else {
            return Err(AuthError::NoReauthenticator {
                domain: domain.to_string(),
            });
        };

        let request = RefreshRequest {
            domain: domain.to_string(),
            url: url.map(str::to_string),
            cookie_file: self.session.cookie_file.clone(),
        };
        info!(domain, "refreshing session");
        let captured = reauth.capture(&request).await?;

        let headers = parse_session_text(&captured.contents, domain)?;
        if headers.is_empty() {
            return Err(AuthError::Capture {
                domain: domain.to_string(),
                reason: "captured session is empty".to_string(),
            });
        }

        if !captured.already_persisted
            && let Some(path) = self.session.cookie_file.as_deref()
        {
            let existing = tokio::fs::read_to_string(path).await.unwrap_or_default();
            persist(path, &merge_cookie_file(&existing, &captured.contents, domain)).await?;
        }
        self.session.install(domain, &headers);
        info!(domain, cookies = ?headers.cookie_names(), "session refreshed");
        Ok(())
    }
}

/// Writes the cookie file through a temporary sibling so readers never see a
/// half-written file.
async fn persist(path: &Path, contents: &str) -> Result<(), AuthError> {
    let map_err = |source| AuthError::CookieFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await.map_err(map_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await.map_err(map_err)?;
    file.write_all(contents.as_bytes()).await.map_err(map_err)?;
    file.flush().await.map_err(map_err)?;
    drop(file);
    tokio::fs::rename(&tmp, path).await.map_err(map_err)?;
    debug!(path = %path.display(), "persisted session to cookie file");
    Ok(())
}
