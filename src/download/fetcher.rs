//! Single-file download with skip, retry and re-authentication.
//!
//! [`FastGet`] is the unit of work the worker pool runs for every task:
//!
//! 1. A non-empty destination is taken as proof of an earlier success and the
//!    task is skipped without any request (unless `overwrite` is set).
//!    Empty destinations are fetched again; unfinished bytes only ever live in
//!    `.part` files, never under the final name.
//! 2. Tasks with `concurrency > 1` go through the [`RangeFetcher`]; a ranged
//!    failure that is not local falls back to a single stream once.
//! 3. Transient failures are retried per the [`RetryPolicy`] (honoring
//!    `Retry-After`); an authentication failure triggers one session refresh
//!    and exactly one more attempt; local IO failures are returned at once.
//! 4. The worker is paced by the [`RateLimiter`] once the task is done.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::client::HttpClient;
use super::error::DownloadError;
use super::range::{DEFAULT_SEGMENT_RETRIES, RangeFetcher, RangedFetch};
use super::rate_limiter::{RateLimiter, extract_domain, parse_retry_after};
use super::retry::{FailureType, RetryDecision, RetryPolicy, classify_error};
use super::task::{DownloadTask, TaskOutcome, TaskReport};
use crate::auth::{RefreshOutcome, SessionStore};

/// Downloads single tasks.
///
/// Cheap to share behind an `Arc`; every field is itself shared.
#[derive(Debug, Clone)]
pub struct FastGet {
    ranges: RangeFetcher,
    sessions: Arc<SessionStore>,
    rate_limiter: Arc<RateLimiter>,
    retry_policy: RetryPolicy,
    cancelled: Arc<AtomicBool>,
}

impl FastGet {
    /// Creates a downloader with the default retry policy and no pacing.
    #[must_use]
    pub fn new(client: HttpClient, sessions: Arc<SessionStore>) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        Self {
            ranges: RangeFetcher::new(client)
                .with_segment_retries(DEFAULT_SEGMENT_RETRIES)
                .with_cancel_flag(Arc::clone(&cancelled)),
            sessions,
            rate_limiter: Arc::new(RateLimiter::disabled()),
            retry_policy: RetryPolicy::default(),
            cancelled,
        }
    }

    /// Sets the task pacing.
    #[must_use]
    pub fn with_rate_limiter(mut self, rate_limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = rate_limiter;
        self
    }

    /// Sets the retry policy for transient failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Sets the per-segment retry budget of ranged downloads.
    #[must_use]
    pub fn with_segment_retries(mut self, retries: u32) -> Self {
        self.ranges = self.ranges.with_segment_retries(retries);
        self
    }

    /// Sets the base delay between segment retries.
    #[must_use]
    pub fn with_segment_retry_delay(mut self, delay: Duration) -> Self {
        self.ranges = self.ranges.with_retry_delay(delay);
        self
    }

    /// Shares an externally owned cancellation flag.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.ranges = self.ranges.with_cancel_flag(Arc::clone(&cancelled));
        self.cancelled = cancelled;
        self
    }

    /// Returns the cancellation flag checked before every attempt.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    /// Returns the session store.
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// Returns the task pacing.
    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Fetches one task.
    ///
    /// # Errors
    ///
    /// Returns the last [`DownloadError`] once retries are exhausted, the
    /// first permanent or local error, [`DownloadError::SessionRefresh`] when
    /// re-authentication fails, or [`DownloadError::Cancelled`] when the run
    /// was cancelled before an attempt.
    #[instrument(skip(self, task), fields(url = %task.uri, path = %task.destination.display()))]
    pub async fn fetch(&self, task: &DownloadTask) -> Result<TaskReport, DownloadError> {
        if !task.overwrite
            && let Some(size) = existing_size(task).await
        {
            debug!(size, "destination exists, skipping");
            return Ok(TaskReport::skipped(task.destination.clone(), size));
        }

        let result = self.fetch_with_retry(task).await;
        if !matches!(&result, Err(error) if error.is_cancelled()) {
            self.rate_limiter.throttle(&extract_domain(&task.uri)).await;
        }
        result
    }

    async fn fetch_with_retry(&self, task: &DownloadTask) -> Result<TaskReport, DownloadError> {
        let domain = extract_domain(&task.uri);
        let session = self.sessions.load();
        let mut use_ranges = task.concurrency > 1;
        let mut reauthenticated = false;
        let mut attempts = 0u32;
        // attempts charged against the retry policy (the post-refresh retry is free)
        let mut budget_attempt = 0u32;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(DownloadError::cancelled(&task.uri));
            }
            self.rate_limiter.wait_ready(&task.uri).await;

            let seen_generation = self.sessions.generation(&domain);
            attempts += 1;
            budget_attempt += 1;
            debug!(attempt = attempts, use_ranges, "attempting download");

            let result = if use_ranges {
                match self
                    .ranges
                    .fetch_ranged(task, &session, task.concurrency)
                    .await
                {
                    Err(error) if error.is_cancelled() || self.cancelled.load(Ordering::SeqCst) => {
                        debug!(error = %error, "ranged download stopped by cancellation");
                        return Err(DownloadError::cancelled(&task.uri));
                    }
                    Err(error)
                        if !error.is_local_fatal()
                            && classify_error(&error) != FailureType::NeedsAuth =>
                    {
                        warn!(error = %error, "ranged download failed, falling back to single stream");
                        use_ranges = false;
                        self.ranges
                            .fetch_ranged(task, &session, 1)
                            .await
                    }
                    other => other,
                }
            } else {
                self.ranges.fetch_ranged(task, &session, 1).await
            };

            let error = match result {
                Ok(RangedFetch { bytes, ranged }) => {
                    info!(bytes, attempts, ranged, "task complete");
                    return Ok(TaskReport {
                        destination: task.destination.clone(),
                        bytes_written: bytes,
                        outcome: TaskOutcome::Downloaded,
                        attempts,
                        ranged,
                    });
                }
                Err(error) if error.is_cancelled() => {
                    return Err(DownloadError::cancelled(&task.uri));
                }
                Err(error) => error,
            };

            match classify_error(&error) {
                FailureType::Fatal => {
                    warn!(error = %error, "local failure, aborting task");
                    return Err(error);
                }
                FailureType::NeedsAuth => {
                    if reauthenticated {
                        warn!(error = %error, "still unauthorized after session refresh");
                        return Err(error);
                    }
                    reauthenticated = true;
                    match self
                        .sessions
                        .refresh_since(&domain, Some(&task.uri), seen_generation)
                        .await
                    {
                        Ok(RefreshOutcome::Refreshed | RefreshOutcome::Joined) => {
                            info!(domain = %domain, "session refreshed, retrying once");
                            budget_attempt -= 1;
                        }
                        Err(source) => {
                            warn!(domain = %domain, error = %source, "session refresh failed");
                            return Err(DownloadError::SessionRefresh { domain, source });
                        }
                    }
                }
                failure => {
                    let retry_after = if failure == FailureType::RateLimited {
                        retry_after_delay(&error, &task.uri, &self.rate_limiter)
                    } else {
                        None
                    };
                    match self.retry_policy.should_retry(failure, budget_attempt) {
                        RetryDecision::Retry { delay, attempt } => {
                            let delay = retry_after.unwrap_or(delay);
                            info!(
                                attempt,
                                max_attempts = self.retry_policy.max_attempts(),
                                delay_ms = delay.as_millis(),
                                using_retry_after = retry_after.is_some(),
                                error = %error,
                                "retrying download"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            debug!(%reason, "not retrying download");
                            return Err(error);
                        }
                    }
                }
            }
        }
    }
}

/// Returns the destination size when it is a non-empty regular file.
async fn existing_size(task: &DownloadTask) -> Option<u64> {
    let metadata = tokio::fs::metadata(task.destination()).await.ok()?;
    (metadata.is_file() && metadata.len() > 0).then_some(metadata.len())
}

/// Parses the Retry-After of a 429 and records it with the rate limiter so
/// every worker targeting the domain pauses.
fn retry_after_delay(
    error: &DownloadError,
    url: &str,
    rate_limiter: &RateLimiter,
) -> Option<Duration> {
    let header = match error {
        DownloadError::HttpStatus { retry_after, .. } => retry_after.as_ref()?,
        _ => return None,
    };
    let delay = parse_retry_after(header)?;
    rate_limiter.record_rate_limit(url, delay);
    debug!(retry_after = %header, delay_ms = delay.as_millis(), "using Retry-After delay");
    Some(delay)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fast_get() -> FastGet {
        FastGet::new(
            HttpClient::with_defaults().unwrap(),
            Arc::new(SessionStore::new(None)),
        )
    }

    #[tokio::test]
    async fn test_existing_destination_is_skipped_without_network() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("0001.jpg");
        std::fs::write(&dest, b"done").unwrap();

        // unroutable URL: any request would fail
        let task = DownloadTask::new("http://127.0.0.1:9/0001.jpg", &dest);
        let report = fast_get().fetch(&task).await.unwrap();

        assert_eq!(report.outcome, TaskOutcome::Skipped);
        assert_eq!(report.bytes_written, 4);
        assert_eq!(report.attempts, 0);
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_no_attempt() {
        let dir = TempDir::new().unwrap();
        let fetcher = fast_get();
        fetcher.cancel_flag().store(true, Ordering::SeqCst);

        let task = DownloadTask::new("http://127.0.0.1:9/0001.jpg", dir.path().join("0001.jpg"));
        let result = fetcher.fetch(&task).await;

        assert!(matches!(result, Err(DownloadError::Cancelled { .. })));
    }

    #[test]
    fn test_retry_after_is_recorded_with_limiter() {
        let limiter = RateLimiter::disabled();
        let error = DownloadError::http_status_with_retry_after(
            "https://example.com/0001.jpg",
            429,
            Some("7".to_string()),
        );
        let delay = retry_after_delay(&error, "https://example.com/0001.jpg", &limiter);
        assert_eq!(delay, Some(Duration::from_secs(7)));
        assert_eq!(limiter.cumulative_delay("example.com"), Duration::from_secs(7));
    }
}
