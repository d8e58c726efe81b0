//! Parallel byte-range fetching for large single files.
//!
//! The remote size is probed first. `[0, size)` is then split into contiguous
//! [`Segment`]s, each fetched by its own Tokio task into an isolated file under
//! `<dest>.segments/`. When every segment has succeeded the files are
//! concatenated in part order into `<dest>.part`, which is renamed over the
//! destination. Servers that do not report a size or ignore `Range` get a
//! plain single-stream fetch instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use super::client::{HttpClient, ensure_parent_dir, part_path, segments_dir};
use super::error::DownloadError;
use super::retry::{FailureType, classify_error};
use super::task::{DownloadTask, Method};
use crate::auth::Session;

/// Default retries per segment before the whole ranged fetch fails.
pub const DEFAULT_SEGMENT_RETRIES: u32 = 2;

/// Base delay between segment retries (multiplied by the attempt number).
const SEGMENT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// One HTTP-range slice of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// First byte offset (inclusive).
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    /// Merge position.
    pub part_index: usize,
    /// File the segment is written to.
    pub temp_path: PathBuf,
}

impl Segment {
    /// Returns the number of bytes in the segment (never zero).
    #[must_use]
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Splits `[0, total_size)` into `concurrency` contiguous segments.
///
/// All segments have `total_size / n` bytes except the last, which absorbs
/// the remainder. `n` is clamped to `1..=total_size`; a zero size yields no
/// segments.
#[must_use]
pub fn plan_segments(total_size: u64, concurrency: usize, dir: &Path) -> Vec<Segment> {
    if total_size == 0 {
        return Vec::new();
    }
    let n = u64::try_from(concurrency.max(1))
        .unwrap_or(u64::MAX)
        .min(total_size);
    let base = total_size / n;
    let last = base + total_size % n;

    (0..n)
        .map(|i| {
            let start = i * base;
            let len = if i == n - 1 { last } else { base };
            let part_index = usize::try_from(i).unwrap_or(usize::MAX);
            Segment {
                start,
                end: start + len - 1,
                part_index,
                temp_path: dir.join(format!("part{part_index}")),
            }
        })
        .collect()
}

/// How a [`RangeFetcher::fetch_ranged`] call fetched its bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangedFetch {
    /// Bytes in the destination.
    pub bytes: u64,
    /// True when parallel range requests were used.
    pub ranged: bool,
}

/// Fetches one file with parallel range requests.
#[derive(Debug, Clone)]
pub struct RangeFetcher {
    client: HttpClient,
    segment_retries: u32,
    retry_delay: Duration,
    cancelled: Option<Arc<AtomicBool>>,
}

impl RangeFetcher {
    /// Creates a fetcher with the default segment retry budget.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            segment_retries: DEFAULT_SEGMENT_RETRIES,
            retry_delay: SEGMENT_RETRY_DELAY,
            cancelled: None,
        }
    }

    /// Sets how many times a failed segment is retried on its own.
    #[must_use]
    pub fn with_segment_retries(mut self, retries: u32) -> Self {
        self.segment_retries = retries;
        self
    }

    /// Sets the base delay between segment retries.
    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Sets a run-wide cancellation flag checked before each segment attempt.
    #[must_use]
    pub fn with_cancel_flag(mut self, cancelled: Arc<AtomicBool>) -> Self {
        self.cancelled = Some(cancelled);
        self
    }

    /// Returns the underlying HTTP client.
    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Downloads `task` into its destination using up to `concurrency`
    /// parallel range requests.
    ///
    /// Falls back to a single stream when `concurrency <= 1`, the task is not
    /// a GET, or the probe shows no size or no range support.
    ///
    /// # Errors
    ///
    /// Returns the probe's error, or [`DownloadError::Segment`] wrapping the
    /// last error of the first segment that exhausted its retries. Segment
    /// files are always removed.
    #[instrument(skip(self, task, session), fields(url = %task.uri, path = %task.destination.display()))]
    pub async fn fetch_ranged(
        &self,
        task: &DownloadTask,
        session: &Arc<Session>,
        concurrency: usize,
    ) -> Result<RangedFetch, DownloadError> {
        if concurrency <= 1 || task.method != Method::Get {
            return self.single_stream(task, session).await;
        }

        let meta = self.client.probe(task, session).await?;
        let size = match meta.size {
            Some(size) if meta.accepts_ranges && size > 0 => size,
            _ => {
                debug!(
                    size = ?meta.size,
                    accepts_ranges = meta.accepts_ranges,
                    "range fetching unavailable, using single stream"
                );
                return self.single_stream(task, session).await;
            }
        };

        let destination = task.destination();
        ensure_parent_dir(destination).await?;
        let dir = segments_dir(destination);
        remove_dir_if_present(&dir).await;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DownloadError::io(&dir, e))?;

        let segments = plan_segments(size, concurrency, &dir);
        debug!(size, segments = segments.len(), "starting ranged fetch");

        let result = self.fetch_and_merge(task, session, size, &segments).await;
        remove_dir_if_present(&dir).await;

        let bytes = result?;
        info!(bytes, segments = segments.len(), "ranged download complete");
        Ok(RangedFetch {
            bytes,
            ranged: true,
        })
    }

    async fn single_stream(
        &self,
        task: &DownloadTask,
        session: &Session,
    ) -> Result<RangedFetch, DownloadError> {
        let bytes = self.client.download(task, session).await?;
        Ok(RangedFetch {
            bytes,
            ranged: false,
        })
    }

    async fn fetch_and_merge(
        &self,
        task: &DownloadTask,
        session: &Arc<Session>,
        size: u64,
        segments: &[Segment],
    ) -> Result<u64, DownloadError> {
        let task = Arc::new(task.clone());
        let mut workers = JoinSet::new();
        for segment in segments {
            let fetcher = self.clone();
            let task = Arc::clone(&task);
            let session = Arc::clone(session);
            let segment = segment.clone();
            workers.spawn(async move { fetcher.fetch_segment(&task, &session, &segment).await });
        }

        // Let every worker finish its write before reporting; no transfer is
        // severed mid-write.
        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, "segment worker panicked");
                    Err(DownloadError::range_unsupported(
                        &task.uri,
                        "segment worker panicked",
                    ))
                }
            };
            if let Err(error) = outcome
                && first_error.is_none()
            {
                first_error = Some(error);
            }
        }
        if let Some(error) = first_error {
            return Err(error);
        }

        merge_segments(task.destination(), segments, size).await
    }

    async fn fetch_segment(
        &self,
        task: &DownloadTask,
        session: &Session,
        segment: &Segment,
    ) -> Result<u64, DownloadError> {
        let mut attempt = 0u32;
        loop {
            if self
                .cancelled
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
            {
                return Err(DownloadError::segment(
                    &task.uri,
                    segment.part_index,
                    DownloadError::cancelled(&task.uri),
                ));
            }

            attempt += 1;
            match self
                .client
                .fetch_range(task, session, segment.start, segment.end, &segment.temp_path)
                .await
            {
                Ok(bytes) => {
                    debug!(part = segment.part_index, bytes, "segment complete");
                    return Ok(bytes);
                }
                Err(error) => {
                    let failure = classify_error(&error);
                    let give_up = attempt > self.segment_retries
                        || matches!(
                            failure,
                            FailureType::Fatal | FailureType::NeedsAuth | FailureType::Permanent
                        );
                    if give_up {
                        return Err(DownloadError::segment(&task.uri, segment.part_index, error));
                    }
                    warn!(
                        part = segment.part_index,
                        attempt,
                        error = %error,
                        "segment failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
            }
        }
    }
}

/// Concatenates segment files in part order into `<dest>.part` and renames it
/// over the destination.
async fn merge_segments(
    destination: &Path,
    segments: &[Segment],
    size: u64,
) -> Result<u64, DownloadError> {
    let part = part_path(destination);
    let result = concat_in_order(&part, segments).await;
    let written = match result {
        Ok(written) if written == size => written,
        Ok(written) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(DownloadError::integrity(destination, size, written));
        }
        Err(error) => {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(error);
        }
    };

    if let Err(e) = tokio::fs::rename(&part, destination).await {
        let _ = tokio::fs::remove_file(&part).await;
        return Err(DownloadError::io(destination, e));
    }
    Ok(written)
}

async fn concat_in_order(part: &Path, segments: &[Segment]) -> Result<u64, DownloadError> {
    let mut ordered: Vec<&Segment> = segments.iter().collect();
    ordered.sort_by_key(|segment| segment.part_index);

    let file = tokio::fs::File::create(part)
        .await
        .map_err(|e| DownloadError::io(part, e))?;
    let mut writer = BufWriter::new(file);
    let mut written = 0u64;
    for segment in ordered {
        let mut reader = tokio::fs::File::open(&segment.temp_path)
            .await
            .map_err(|e| DownloadError::io(&segment.temp_path, e))?;
        written += tokio::io::copy(&mut reader, &mut writer)
            .await
            .map_err(|e| DownloadError::io(part, e))?;
    }
    writer
        .flush()
        .await
        .map_err(|e| DownloadError::io(part, e))?;
    Ok(written)
}

async fn remove_dir_if_present(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "removed segment directory"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove segment directory"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn assert_partition(size: u64, concurrency: usize) {
        let segments = plan_segments(size, concurrency, Path::new("/tmp/x.segments"));
        assert_eq!(segments.first().unwrap().start, 0);
        assert_eq!(segments.last().unwrap().end, size - 1);
        for pair in segments.windows(2) {
            assert_eq!(pair[0].end + 1, pair[1].start, "gap or overlap");
            assert_eq!(pair[0].part_index + 1, pair[1].part_index);
        }
        assert_eq!(segments.iter().map(Segment::len).sum::<u64>(), size);
    }

    #[test]
    fn test_plan_segments_partitions_range() {
        for size in [1u64, 2, 7, 100, 1001, 65_537] {
            for concurrency in [1usize, 2, 3, 7] {
                assert_partition(size, concurrency);
            }
            assert_partition(size, usize::try_from(size).unwrap());
        }
    }

    #[test]
    fn test_last_segment_absorbs_remainder() {
        let segments = plan_segments(10, 3, Path::new("/tmp/s"));
        let lens: Vec<u64> = segments.iter().map(Segment::len).collect();
        assert_eq!(lens, vec![3, 3, 4]);
        assert_eq!(segments[2].temp_path, PathBuf::from("/tmp/s/part2"));
    }

    #[test]
    fn test_plan_segments_clamps_concurrency() {
        assert_eq!(plan_segments(3, 8, Path::new("/tmp/s")).len(), 3);
        assert_eq!(plan_segments(3, 0, Path::new("/tmp/s")).len(), 1);
        assert!(plan_segments(0, 4, Path::new("/tmp/s")).is_empty());
    }

    #[tokio::test]
    async fn test_merge_uses_part_order_not_slice_order() {
        let dir = TempDir::new().unwrap();
        let seg_dir = dir.path().join("out.bin.segments");
        std::fs::create_dir_all(&seg_dir).unwrap();
        let mut segments = plan_segments(6, 3, &seg_dir);
        std::fs::write(&segments[0].temp_path, b"ab").unwrap();
        std::fs::write(&segments[1].temp_path, b"cd").unwrap();
        std::fs::write(&segments[2].temp_path, b"ef").unwrap();
        segments.reverse();

        let dest = dir.path().join("out.bin");
        let written = merge_segments(&dest, &segments, 6).await.unwrap();

        assert_eq!(written, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
        assert!(!part_path(&dest).exists());
    }

    #[tokio::test]
    async fn test_merge_size_mismatch_leaves_no_destination() {
        let dir = TempDir::new().unwrap();
        let seg_dir = dir.path().join("out.bin.segments");
        std::fs::create_dir_all(&seg_dir).unwrap();
        let segments = plan_segments(4, 2, &seg_dir);
        std::fs::write(&segments[0].temp_path, b"ab").unwrap();
        std::fs::write(&segments[1].temp_path, b"c").unwrap();

        let dest = dir.path().join("out.bin");
        let result = merge_segments(&dest, &segments, 4).await;

        assert!(matches!(result, Err(DownloadError::Integrity { .. })));
        assert!(!dest.exists());
        assert!(!part_path(&dest).exists());
    }
}
