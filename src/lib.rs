//! Folio Core Library
//!
//! Bulk acquisition engine for digital-library documents: given ordered lists
//! of page URLs and destination paths, it downloads every file concurrently,
//! survives flaky servers and expired sessions, and can be re-run safely.
//!
//! # Architecture
//!
//! - [`download`] - Tasks, the single-file downloader, ranged fetching, the
//!   worker pool and run orchestration
//! - [`auth`] - Session cookies, the session store and re-authentication
//! - [`layout`] - Destination path convention and page ranges
//! - [`config`] - Engine configuration and config file loading
//! - [`user_agent`] - Default User-Agent

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod auth;
pub mod config;
pub mod download;
pub mod layout;
pub mod user_agent;

// Re-export commonly used types
pub use auth::{AuthError, Reauthenticator, Session, SessionStore};
pub use config::EngineConfig;
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, DownloadManager, DownloadTask, FailureType, FastGet,
    HttpClient, ManagerError, RateLimiter, RetryDecision, RetryPolicy, RunSummary, TaskQueue,
    classify_error,
};
pub use layout::{DestinationLayout, PageRange};
