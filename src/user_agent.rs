//! Default User-Agent string.
//!
//! Library sites commonly reject non-browser agents, so requests default to a
//! desktop browser UA. A UA captured with the session cookies replaces it per
//! request; `--ua` replaces it for the whole run.

/// Desktop Firefox User-Agent sent when nothing else is configured.
pub const DEFAULT_BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/118.0";

/// Default User-Agent for download requests.
#[must_use]
pub fn default_download_user_agent() -> String {
    DEFAULT_BROWSER_USER_AGENT.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_user_agent_looks_like_a_browser() {
        let ua = default_download_user_agent();
        assert!(ua.starts_with("Mozilla/5.0"), "unexpected UA: {ua}");
    }
}
