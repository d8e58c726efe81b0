//! Constants for the download module (timeouts, pacing, probing).

use std::time::Duration;

/// Default HTTP connect timeout (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Warning threshold for cumulative pacing delay per domain (30 seconds).
pub const CUMULATIVE_DELAY_WARNING_THRESHOLD: Duration = Duration::from_secs(30);

/// Maximum Retry-After value (1 hour) to prevent excessive delays.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Suffix of the in-progress sibling of a destination file.
pub const PART_SUFFIX: &str = ".part";

/// Suffix of the directory holding segment files of a ranged download.
pub const SEGMENTS_DIR_SUFFIX: &str = ".segments";

/// Largest text body inspected for session-expired markers (64 KiB).
pub const MAX_MARKER_SCAN_BYTES: u64 = 64 * 1024;
