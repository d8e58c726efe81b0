//! Download engine: tasks, the single-file downloader, ranged fetching and
//! run orchestration.
//!
//! # Features
//!
//! - Skip-if-exists idempotence: a non-empty destination is never fetched again
//! - `.part` write discipline, renamed over the destination after a size check
//! - Parallel byte-range segments merged in order, with single-stream fallback
//! - Bounded retry with exponential backoff and `Retry-After` support
//! - One session refresh and one retry on authentication failures
//! - Per-domain task pacing
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use folio_core::auth::SessionStore;
//! use folio_core::download::{DownloadManager, DownloadTask, FastGet, HttpClient};
//! use folio_core::layout::DestinationLayout;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let sessions = Arc::new(SessionStore::new(None));
//! let fetcher = FastGet::new(HttpClient::with_defaults()?, sessions);
//! let mut manager = DownloadManager::new(fetcher, 4, DestinationLayout::new("./books"));
//! manager.add_task(DownloadTask::new(
//!     "https://example.com/scan/0001.jpg",
//!     "./books/example.com/0001.jpg",
//! ));
//! let summary = manager.start().await?;
//! println!("downloaded {}, failed {}", summary.downloaded, summary.failed);
//! # Ok(())
//! # }
//! ```

mod client;
mod constants;
mod error;
mod fetcher;
mod manager;
mod queue;
mod range;
pub mod rate_limiter;
mod retry;
mod task;

pub use client::{HttpClient, RemoteMeta, part_path, segments_dir};
pub use error::DownloadError;
pub use fetcher::FastGet;
pub use manager::{
    DownloadManager, ManagerError, ProgressSnapshot, ProgressState, RunSummary, TaskFailure,
    VolumeSpec,
};
pub use queue::TaskQueue;
pub use range::{DEFAULT_SEGMENT_RETRIES, RangeFetcher, RangedFetch, Segment, plan_segments};
pub use rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use task::{DownloadTask, Method, TaskOutcome, TaskReport};

// Note: we do NOT define module-local Result aliases.
// Use `Result<T, DownloadError>` explicitly in function signatures.
