//! Per-domain pacing for download tasks.
//!
//! The [`RateLimiter`] sleeps a worker for a fixed interval after each
//! completed task, so consecutive pages from one library are spaced out and do
//! not trip anti-scraping defenses. It paces tasks, not segments: the parallel
//! range requests inside one large download are never throttled.
//!
//! It also remembers server-mandated pauses (`Retry-After` on HTTP 429) per
//! domain; every worker about to hit that domain waits them out first.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use folio_core::download::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_secs(2));
//!
//! // after a task against example.com completes
//! limiter.throttle("example.com").await;
//!
//! // before the next request to a URL on that host
//! limiter.wait_ready("https://example.com/0002.jpg").await;
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::constants::{CUMULATIVE_DELAY_WARNING_THRESHOLD, MAX_RETRY_AFTER};

/// Per-domain task pacing.
///
/// Designed to be wrapped in `Arc` and shared across every worker of a run.
/// Domain state lives in a `DashMap`; the map guard is always released before
/// any await.
#[derive(Debug)]
pub struct RateLimiter {
    /// Sleep applied after each completed task.
    interval: Duration,

    /// Whether task pacing is disabled (`speed = 0`).
    disabled: bool,

    /// Per-domain state.
    domains: DashMap<String, Arc<DomainState>>,
}

#[derive(Debug)]
struct DomainState {
    /// Earliest instant at which the next request may be sent (Retry-After).
    blocked_until: Mutex<Option<Instant>>,

    /// Total delay applied to this domain, in milliseconds.
    cumulative_delay_ms: AtomicU64,
}

impl DomainState {
    fn new() -> Self {
        Self {
            blocked_until: Mutex::new(None),
            cumulative_delay_ms: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn add_cumulative_delay(&self, delay: Duration) -> Duration {
        let delay_ms = delay.as_millis() as u64;
        let new_total = self
            .cumulative_delay_ms
            .fetch_add(delay_ms, Ordering::SeqCst)
            + delay_ms;
        Duration::from_millis(new_total)
    }

    fn blocked_until(&self) -> Option<Instant> {
        *self
            .blocked_until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl RateLimiter {
    /// Creates a limiter that sleeps `interval` after every completed task.
    #[must_use]
    #[instrument(skip_all, fields(interval_ms = interval.as_millis()))]
    pub fn new(interval: Duration) -> Self {
        debug!("creating rate limiter");
        Self {
            interval,
            disabled: interval.is_zero(),
            domains: DashMap::new(),
        }
    }

    /// Creates a limiter from the whole-second `speed` setting.
    #[must_use]
    pub fn from_secs(seconds: u64) -> Self {
        Self::new(Duration::from_secs(seconds))
    }

    /// Creates a limiter that applies no task pacing.
    ///
    /// Server-mandated pauses recorded with
    /// [`record_rate_limit`](Self::record_rate_limit) are still honored.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns whether task pacing is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Returns the per-task interval.
    #[must_use]
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Sleeps the calling worker for the configured interval.
    ///
    /// Called once per completed task; never per segment.
    pub async fn throttle(&self, domain: &str) {
        self.throttle_for(domain, self.interval).await;
    }

    /// Sleeps the calling worker for `delay`, accounting it against `domain`.
    #[instrument(skip(self), fields(delay_ms = delay.as_millis()))]
    pub async fn throttle_for(&self, domain: &str, delay: Duration) {
        if delay.is_zero() {
            return;
        }

        let state = self.state(domain);
        let cumulative = state.add_cumulative_delay(delay);
        debug!(
            cumulative_ms = cumulative.as_millis(),
            "pausing before next task"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD
            && cumulative.saturating_sub(delay) < CUMULATIVE_DELAY_WARNING_THRESHOLD
        {
            warn!(
                domain,
                cumulative_delay_secs = cumulative.as_secs(),
                "task pacing has added considerable delay for this domain"
            );
        }

        tokio::time::sleep(delay).await;
    }

    /// Waits until any server-mandated pause for the URL's domain has elapsed.
    ///
    /// Returns immediately when the domain has never been rate limited.
    #[instrument(skip(self), fields(domain))]
    pub async fn wait_ready(&self, url: &str) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let Some(state) = self.domains.get(&domain).map(|entry| Arc::clone(entry.value())) else {
            return;
        };

        if let Some(until) = state.blocked_until() {
            let now = Instant::now();
            if until > now {
                debug!(
                    wait_ms = (until - now).as_millis(),
                    "waiting out server rate limit"
                );
                tokio::time::sleep_until(until).await;
            }
        }
    }

    /// Records a server-mandated pause (from a Retry-After header).
    ///
    /// The pause only ever extends: a shorter delay never shortens a longer
    /// pause recorded by another worker.
    #[instrument(skip(self), fields(domain))]
    pub fn record_rate_limit(&self, url: &str, delay: Duration) {
        let domain = extract_domain(url);
        tracing::Span::current().record("domain", domain.as_str());

        let state = self.state(&domain);
        let until = Instant::now() + delay.min(MAX_RETRY_AFTER);
        {
            let mut guard = state
                .blocked_until
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if guard.is_none_or(|current| current < until) {
                *guard = Some(until);
            }
        }
        let cumulative = state.add_cumulative_delay(delay);

        debug!(
            delay_ms = delay.as_millis(),
            cumulative_ms = cumulative.as_millis(),
            "recorded server rate limit"
        );
        if cumulative >= CUMULATIVE_DELAY_WARNING_THRESHOLD {
            warn!(
                domain = %domain,
                cumulative_delay_secs = cumulative.as_secs(),
                "excessive server rate limiting - site may be under heavy load"
            );
        }
    }

    /// Returns the total delay applied so far to a domain.
    #[must_use]
    pub fn cumulative_delay(&self, domain: &str) -> Duration {
        self.domains
            .get(domain)
            .map_or(Duration::ZERO, |state| {
                Duration::from_millis(state.cumulative_delay_ms.load(Ordering::SeqCst))
            })
    }

    fn state(&self, domain: &str) -> Arc<DomainState> {
        Arc::clone(
            self.domains
                .entry(domain.to_string())
                .or_insert_with(|| Arc::new(DomainState::new()))
                .value(),
        )
    }
}

/// Extracts the lowercase host from a URL.
///
/// Returns "unknown" for malformed URLs so they still share one pacing bucket.
///
/// ```
/// use folio_core::download::rate_limiter::extract_domain;
///
/// assert_eq!(extract_domain("https://Example.COM/iiif/0001.jpg"), "example.com");
/// assert_eq!(extract_domain("https://localhost:8080/x"), "localhost");
/// assert_eq!(extract_domain("not a url"), "unknown");
/// ```
#[must_use]
pub fn extract_domain(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header value into a Duration.
///
/// Supports integer seconds and HTTP-dates (RFC 7231). Values above one hour
/// are capped; dates in the past yield zero.
///
/// ```
/// use std::time::Duration;
/// use folio_core::download::rate_limiter::parse_retry_after;
///
/// assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
/// assert_eq!(parse_retry_after("invalid"), None);
/// ```
#[must_use]
#[instrument]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let Ok(seconds) = u64::try_from(seconds) else {
            debug!(seconds, "negative Retry-After value, ignoring");
            return None;
        };
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(
                seconds,
                max_seconds = MAX_RETRY_AFTER.as_secs(),
                "Retry-After exceeds maximum, capping at 1 hour"
            );
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let Ok(datetime) = httpdate::parse_http_date(header_value) else {
        debug!(header_value, "unparseable Retry-After value");
        return None;
    };
    match datetime.duration_since(std::time::SystemTime::now()) {
        Ok(duration) => Some(duration.min(MAX_RETRY_AFTER)),
        Err(_) => {
            debug!(header_value, "Retry-After date is in the past, returning zero");
            Some(Duration::ZERO)
        }
    }
}
