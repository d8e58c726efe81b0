//! Run orchestration: task registration, the worker pool, progress and the
//! final summary.
//!
//! A [`DownloadManager`] owns one job run. Tasks are added individually or a
//! volume at a time, then [`DownloadManager::start`] dispatches them through a
//! [`TaskQueue`] sized by the configured thread count, each task handled by
//! the shared [`FastGet`].
//!
//! Failed tasks are logged and recorded and the run continues. A local fatal
//! error (disk full, permission denied) cancels the remaining tasks and the
//! run returns [`ManagerError::Aborted`].

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};

use super::client::HttpClient;
use super::error::DownloadError;
use super::fetcher::FastGet;
use super::queue::TaskQueue;
use super::rate_limiter::RateLimiter;
use super::retry::{FailureType, RetryPolicy, classify_error};
use super::task::{DownloadTask, TaskOutcome, TaskReport};
use crate::auth::{CookieFileWatcher, ExternalCapture, Reauthenticator, SessionStore};
use crate::config::{EngineConfig, MAX_SEGMENT_CONCURRENCY};
use crate::layout::{DestinationLayout, PageRange, file_ext};

/// Error type for run-level failures.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// A local fatal error stopped the run; `summary` covers what ran.
    #[error("run aborted: {source}")]
    Aborted {
        /// The error that stopped the run.
        #[source]
        source: DownloadError,
        /// Counts at the time the run stopped.
        summary: Box<RunSummary>,
    },
}

/// Atomic counters of one run, readable while the run is in progress.
#[derive(Debug, Default)]
pub struct ProgressState {
    total: AtomicUsize,
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    not_started: AtomicUsize,
    bytes: AtomicU64,
}

/// Point-in-time copy of [`ProgressState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ProgressSnapshot {
    /// Tasks in the run.
    pub total: usize,
    /// Tasks that fetched bytes.
    pub downloaded: usize,
    /// Tasks whose destination already existed.
    pub skipped: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks never attempted because the run was cancelled.
    pub not_started: usize,
    /// Bytes fetched so far.
    pub bytes: u64,
}

impl ProgressSnapshot {
    /// Returns the number of tasks that reached a final state.
    #[must_use]
    pub fn finished(&self) -> usize {
        self.downloaded + self.skipped + self.failed + self.not_started
    }
}

impl ProgressState {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the counters.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            total: self.total.load(Ordering::SeqCst),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            not_started: self.not_started.load(Ordering::SeqCst),
            bytes: self.bytes.load(Ordering::SeqCst),
        }
    }

    fn begin(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
        self.downloaded.store(0, Ordering::SeqCst);
        self.skipped.store(0, Ordering::SeqCst);
        self.failed.store(0, Ordering::SeqCst);
        self.not_started.store(0, Ordering::SeqCst);
        self.bytes.store(0, Ordering::SeqCst);
    }

    fn record_report(&self, report: &TaskReport) {
        match report.outcome {
            TaskOutcome::Downloaded => {
                self.downloaded.fetch_add(1, Ordering::SeqCst);
                self.bytes.fetch_add(report.bytes_written, Ordering::SeqCst);
            }
            TaskOutcome::Skipped => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn record_not_started(&self, count: usize) {
        self.not_started.fetch_add(count, Ordering::SeqCst);
    }
}

/// One failed task, with enough context to re-run it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskFailure {
    /// Source URL.
    pub uri: String,
    /// Destination path.
    pub destination: String,
    /// HTTP status of the last response, if any (0 for a session-expired page).
    pub status: Option<u16>,
    /// Error message.
    pub reason: String,
}

impl TaskFailure {
    fn new(task: &DownloadTask, error: &DownloadError) -> Self {
        Self {
            uri: task.uri.clone(),
            destination: task.destination.display().to_string(),
            status: error.status(),
            reason: error.to_string(),
        }
    }

    fn panicked(task: &DownloadTask) -> Self {
        Self {
            uri: task.uri.clone(),
            destination: task.destination.display().to_string(),
            status: None,
            reason: "download task panicked".to_string(),
        }
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    /// Tasks in the run.
    pub total: usize,
    /// Tasks that fetched bytes.
    pub downloaded: usize,
    /// Tasks whose destination already existed.
    pub skipped: usize,
    /// Tasks that failed.
    pub failed: usize,
    /// Tasks never attempted because the run was cancelled.
    pub not_started: usize,
    /// Bytes fetched.
    pub bytes: u64,
    /// Whether the run was cancelled.
    pub cancelled: bool,
    /// Failed tasks, in completion order.
    pub failures: Vec<TaskFailure>,
}

impl RunSummary {
    /// Returns true when every task was downloaded or skipped.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.failed == 0 && self.not_started == 0 && !self.cancelled
    }

    /// Returns the number of tasks that ended downloaded or skipped.
    #[must_use]
    pub fn succeeded(&self) -> usize {
        self.downloaded + self.skipped
    }
}

/// An ordered page list of one volume, as produced by a site module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeSpec {
    /// Book identifier, appended to the host directory.
    pub book_id: Option<String>,
    /// Volume identifier, used as a subdirectory.
    pub volume_id: Option<String>,
    /// Page URLs in page order; empty entries are skipped but keep their number.
    pub uris: Vec<String>,
    /// Headers sent with every page request.
    pub headers: BTreeMap<String, String>,
    /// Range segments per page; 0 uses the configured default.
    pub concurrency: usize,
    /// File extension with dot; derived from each URL when unset.
    pub ext: Option<String>,
    /// Pages to keep.
    pub page_range: PageRange,
    /// Re-download pages that already exist.
    pub overwrite: bool,
}

/// Runs a batch of download tasks.
#[derive(Debug)]
pub struct DownloadManager {
    fetcher: Arc<FastGet>,
    threads: usize,
    layout: DestinationLayout,
    default_segments: usize,
    max_segments: usize,
    tasks: Vec<DownloadTask>,
    progress: Arc<ProgressState>,
}

impl DownloadManager {
    /// Creates a manager running `threads` tasks at once.
    #[must_use]
    pub fn new(fetcher: FastGet, threads: usize, layout: DestinationLayout) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            threads: threads.max(1),
            layout,
            default_segments: 1,
            max_segments: MAX_SEGMENT_CONCURRENCY,
            tasks: Vec::new(),
            progress: Arc::new(ProgressState::new()),
        }
    }

    /// Builds the whole engine from a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Client`] if the HTTP client cannot be built.
    pub fn from_config(config: &EngineConfig) -> Result<Self, ManagerError> {
        let client = HttpClient::new(
            &config.user_agent,
            Duration::from_secs(config.connect_timeout_secs),
            Duration::from_secs(config.read_timeout_secs),
        )
        .map_err(ManagerError::Client)?
        .with_session_markers(&config.session_markers);

        let mut sessions = SessionStore::new(config.cookie_file.clone());
        if let Some(reauth) = reauthenticator(config) {
            sessions = sessions.with_reauthenticator(reauth);
        }

        let fetcher = FastGet::new(client, Arc::new(sessions))
            .with_rate_limiter(Arc::new(RateLimiter::from_secs(config.speed_secs)))
            .with_retry_policy(RetryPolicy::with_retries(config.max_retries))
            .with_segment_retries(config.segment_retries);

        let mut manager = Self::new(
            fetcher,
            config.effective_threads(),
            DestinationLayout::new(&config.save_root),
        );
        manager.default_segments = config.effective_segment_concurrency(0);
        manager.max_segments = config.effective_segment_concurrency(usize::MAX);
        Ok(manager)
    }

    /// Sets the default and maximum range segments per task.
    #[must_use]
    pub fn with_segments(mut self, default_segments: usize, max_segments: usize) -> Self {
        self.max_segments = max_segments.max(1);
        self.default_segments = default_segments.clamp(1, self.max_segments);
        self
    }

    /// Returns the destination layout.
    #[must_use]
    pub fn layout(&self) -> &DestinationLayout {
        &self.layout
    }

    /// Returns the shared downloader.
    #[must_use]
    pub fn fetcher(&self) -> &Arc<FastGet> {
        &self.fetcher
    }

    /// Returns the live progress counters.
    #[must_use]
    pub fn progress(&self) -> Arc<ProgressState> {
        Arc::clone(&self.progress)
    }

    /// Returns the run cancellation flag.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.fetcher.cancel_flag()
    }

    /// Stops dispatching tasks; running transfers finish or time out.
    pub fn cancel(&self) {
        self.fetcher.cancel_flag().store(true, Ordering::SeqCst);
    }

    /// Returns the number of tasks waiting for [`start`](Self::start).
    #[must_use]
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Queues a task, capping its segment count.
    pub fn add_task(&mut self, mut task: DownloadTask) {
        task.concurrency = task.concurrency.clamp(1, self.max_segments);
        self.tasks.push(task);
    }

    /// Queues the pages of a volume under the layout.
    ///
    /// Pages are numbered from 1 in list order. Empty URLs, pages outside the
    /// range and URLs without a host are skipped. Returns the number of tasks
    /// added.
    #[instrument(skip(self, volume), fields(book = ?volume.book_id, volume = ?volume.volume_id, pages = volume.uris.len()))]
    pub fn add_volume(&mut self, volume: &VolumeSpec) -> usize {
        let concurrency = if volume.concurrency == 0 {
            self.default_segments
        } else {
            volume.concurrency
        };
        let mut added = 0;
        for (index, uri) in volume.uris.iter().enumerate() {
            let page = index + 1;
            let uri = uri.trim();
            if uri.is_empty() || !volume.page_range.contains(page) {
                continue;
            }
            let ext = volume.ext.clone().unwrap_or_else(|| file_ext(uri));
            let Some(destination) = self.layout.dest_path(
                uri,
                volume.book_id.as_deref(),
                volume.volume_id.as_deref(),
                page,
                &ext,
            ) else {
                warn!(uri, page, "URL has no host, skipping page");
                continue;
            };
            self.add_task(
                DownloadTask::new(uri, destination)
                    .with_headers(volume.headers.clone())
                    .with_concurrency(concurrency)
                    .with_overwrite(volume.overwrite),
            );
            added += 1;
        }
        debug!(added, "volume registered");
        added
    }

    /// Runs every queued task and waits for all of them.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Aborted`] when a local fatal error stopped the
    /// run. Ordinary task failures are reported in the summary instead.
    #[instrument(skip(self), fields(tasks = self.tasks.len(), threads = self.threads))]
    pub async fn start(&mut self) -> Result<RunSummary, ManagerError> {
        let tasks = std::mem::take(&mut self.tasks);
        let total = tasks.len();
        self.progress.begin(total);
        info!("starting download run");

        let cancelled = self.fetcher.cancel_flag();
        let failures: Arc<Mutex<Vec<TaskFailure>>> = Arc::new(Mutex::new(Vec::new()));
        let fatal: Arc<Mutex<Option<DownloadError>>> = Arc::new(Mutex::new(None));
        let mut queue = TaskQueue::new(self.threads);

        let mut remaining = tasks.into_iter();
        for task in remaining.by_ref() {
            if cancelled.load(Ordering::SeqCst) {
                self.progress.record_not_started(1);
                break;
            }
            let fetcher = Arc::clone(&self.fetcher);
            let progress = Arc::clone(&self.progress);
            let failures = Arc::clone(&failures);
            let fatal = Arc::clone(&fatal);
            let cancelled = Arc::clone(&cancelled);

            queue
                .submit(async move {
                    let fetch = fetcher.fetch(&task);
                    if let Some(err) = record_outcome(&task, fetch, &progress, &failures).await {
                        error!(url = %task.uri, error = %err, "local failure, cancelling run");
                        cancelled.store(true, Ordering::SeqCst);
                        let mut slot = lock(&fatal);
                        if slot.is_none() {
                            *slot = Some(err);
                        }
                    }
                })
                .await;
        }
        self.progress.record_not_started(remaining.len());

        let panicked = queue.wait().await;
        if panicked > 0 {
            self.progress.failed.fetch_add(panicked, Ordering::SeqCst);
        }

        let snapshot = self.progress.snapshot();
        let summary = RunSummary {
            total,
            downloaded: snapshot.downloaded,
            skipped: snapshot.skipped,
            failed: snapshot.failed,
            not_started: snapshot.not_started,
            bytes: snapshot.bytes,
            cancelled: cancelled.load(Ordering::SeqCst),
            failures: std::mem::take(&mut *lock(&failures)),
        };
        info!(
            downloaded = summary.downloaded,
            skipped = summary.skipped,
            failed = summary.failed,
            not_started = summary.not_started,
            bytes = summary.bytes,
            "download run finished"
        );

        let fatal = lock(&fatal).take();
        match fatal {
            Some(source) => Err(ManagerError::Aborted {
                source,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}

/// Awaits one fetch and records its outcome. Returns the error when it is
/// local and fatal so the caller can stop the run.
async fn record_outcome<F>(
    task: &DownloadTask,
    fetch: F,
    progress: &ProgressState,
    failures: &Mutex<Vec<TaskFailure>>,
) -> Option<DownloadError>
where
    F: Future<Output = Result<TaskReport, DownloadError>>,
{
    match AssertUnwindSafe(fetch).catch_unwind().await {
        Ok(Ok(report)) => progress.record_report(&report),
        Ok(Err(err)) if err.is_cancelled() => progress.record_not_started(1),
        Ok(Err(err)) => {
            progress.record_failed();
            lock(failures).push(TaskFailure::new(task, &err));
            if classify_error(&err) == FailureType::Fatal {
                return Some(err);
            }
            warn!(url = %task.uri, error = %err, "task failed");
        }
        Err(_) => {
            error!(url = %task.uri, "download task panicked");
            progress.record_failed();
            lock(failures).push(TaskFailure::panicked(task));
        }
    }
    None
}

/// Picks the re-authentication capability the configuration asks for.
fn reauthenticator(config: &EngineConfig) -> Option<Arc<dyn Reauthenticator>> {
    let timeout = Duration::from_secs(config.reauth_timeout_secs);
    if let Some(command) = config.reauth_command.as_deref() {
        if let Some(capture) = ExternalCapture::from_command_line(command, timeout) {
            return Some(Arc::new(capture));
        }
        warn!(command, "empty re-authentication command ignored");
    }
    config
        .cookie_file
        .as_ref()
        .map(|_| Arc::new(CookieFileWatcher::new(timeout)) as Arc<dyn Reauthenticator>)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
