//! Session state: cookie files, the shared session, and re-authentication.
//!
//! - [`parse_session_text`] reads the on-disk cookie file in its several shapes.
//! - [`Session`] is the shared per-domain jar plus the cookie file path; the
//!   file is re-read for every request so an external refresh takes effect
//!   immediately.
//! - [`SessionStore`] funnels every mutation of the session and serializes
//!   refreshes per domain.
//! - [`Reauthenticator`] is the pluggable capture step (file watch, external
//!   browser automation, static credentials).

mod cookies;
mod reauth;
mod session;

use std::path::PathBuf;

pub use cookies::{
    CookieError, CookieFileFormat, SessionHeaders, detect_format, merge_cookie_file,
    parse_session_text,
};
pub use reauth::{
    CapturedSession, CookieFileWatcher, ExternalCapture, Reauthenticator, RefreshRequest,
    StaticCredentials,
};
pub use session::{RefreshOutcome, Session, SessionStore};

/// Errors raised by the session layer.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No re-authentication capability is configured.
    #[error("session for {domain} expired and no re-authentication method is configured")]
    NoReauthenticator {
        /// The domain that needed a refresh.
        domain: String,
    },

    /// Waiting for fresh credentials timed out.
    #[error("timed out after {waited_secs}s waiting for new credentials for {domain}")]
    Timeout {
        /// The domain that needed a refresh.
        domain: String,
        /// How long we waited.
        waited_secs: u64,
    },

    /// The capture step ran but produced nothing usable.
    #[error("credential capture for {domain} failed: {reason}")]
    Capture {
        /// The domain that needed a refresh.
        domain: String,
        /// What went wrong.
        reason: String,
    },

    /// The external capture command could not be started.
    #[error("failed to run capture command '{command}': {source}")]
    Command {
        /// The program that failed.
        command: String,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Reading or writing the cookie file failed.
    #[error("cookie file {path}: {source}")]
    CookieFile {
        /// The cookie file path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The cookie file or captured text could not be parsed.
    #[error("invalid session data: {0}")]
    Parse(#[from] CookieError),

    /// Another worker's refresh for the same domain failed while we waited on it.
    #[error("concurrent session refresh for {domain} failed: {reason}")]
    JoinedRefreshFailed {
        /// The domain that needed a refresh.
        domain: String,
        /// The failure reported by the refresh we joined.
        reason: String,
    },
}
