//! Cookie file parsing.
//!
//! A session file can be in any of the shapes users and capture tools
//! produce, detected from the content:
//!
//! - header lines, `Name: Value` per line (`Cookie: a=1; b=2`,
//!   `User-Agent: ...`), the form written by browser capture;
//! - a bare cookie string, `a=1; b=2`;
//! - the Netscape HTTP Cookie File format (7 TAB-separated fields);
//! - JSON cookie exports (array or `{ "cookies": [...] }`).
//!
//! Everything is reduced to [`SessionHeaders`] for one request host.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use tracing::{debug, instrument, warn};

/// Detected shape of a cookie file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieFileFormat {
    /// `Name: Value` header lines.
    HeaderLines,
    /// A bare `a=1; b=2` cookie string.
    RawCookie,
    /// Netscape HTTP Cookie File.
    Netscape,
    /// JSON cookie export.
    Json,
}

/// Errors that can occur while parsing a cookie file.
#[derive(Debug, thiserror::Error)]
pub enum CookieError {
    /// JSON export could not be parsed.
    #[error("invalid cookie JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// A Netscape file contained data lines but none could be parsed.
    #[error("no valid cookies found in file ({malformed_count} lines failed to parse)")]
    NoCookiesFound {
        /// Number of malformed lines encountered.
        malformed_count: usize,
    },
}

/// Headers a session contributes to requests for one host.
///
/// The cookie value is redacted in Debug output.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionHeaders {
    cookies: Vec<(String, String)>,
    /// User-Agent captured with the cookies, if any.
    pub user_agent: Option<String>,
    /// Other captured headers (Authorization, tokens), in file order.
    pub extra: Vec<(String, String)>,
}

impl SessionHeaders {
    /// Returns true when the session contributes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty() && self.user_agent.is_none() && self.extra.is_empty()
    }

    /// Returns the `Cookie` header value, if there are any cookies.
    ///
    /// Cookie values are sensitive; avoid logging the return value.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Returns the cookie names, for logging.
    #[must_use]
    pub fn cookie_names(&self) -> Vec<&str> {
        self.cookies.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Adds cookies from a `a=1; b=2` string; later names replace earlier ones.
    pub fn merge_cookie_string(&mut self, raw: &str) {
        for (name, value) in split_cookie_pairs(raw) {
            self.set_cookie(name, value);
        }
    }

    /// Layers `other` over `self`: its cookies replace same-named ones, its
    /// User-Agent and extra headers win.
    pub fn overlay(&mut self, other: &SessionHeaders) {
        for (name, value) in &other.cookies {
            self.set_cookie(name.clone(), value.clone());
        }
        if other.user_agent.is_some() {
            self.user_agent.clone_from(&other.user_agent);
        }
        for (name, value) in &other.extra {
            self.extra.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
            self.extra.push((name.clone(), value.clone()));
        }
    }

    fn set_cookie(&mut self, name: String, value: String) {
        if let Some(slot) = self.cookies.iter_mut().find(|(existing, _)| *existing == name) {
            slot.1 = value;
        } else {
            self.cookies.push((name, value));
        }
    }
}

impl fmt::Debug for SessionHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHeaders")
            .field("cookies", &self.cookie_names())
            .field("user_agent", &self.user_agent)
            .field(
                "extra",
                &self.extra.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Detects the shape of a cookie file from its content.
#[must_use]
pub fn detect_format(contents: &str) -> CookieFileFormat {
    let trimmed = contents.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return CookieFileFormat::Json;
    }

    let mut data_lines = contents
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty() && !line.starts_with('#'));

    if contents.lines().any(|line| line.split('\t').count() == 7) {
        return CookieFileFormat::Netscape;
    }
    if data_lines.any(|line| header_line(line).is_some()) {
        return CookieFileFormat::HeaderLines;
    }
    CookieFileFormat::RawCookie
}

/// Parses a cookie file into the headers it contributes for `host`.
///
/// Netscape and JSON entries are filtered by domain; header-line and bare
/// cookie files apply to every host. Expired Netscape/JSON cookies are skipped.
///
/// # Errors
///
/// Returns [`CookieError`] for malformed JSON or a Netscape file without any
/// valid line.
#[instrument(level = "debug", skip(contents))]
pub fn parse_session_text(contents: &str, host: &str) -> Result<SessionHeaders, CookieError> {
    let format = detect_format(contents);
    debug!(?format, "parsing session text");

    let mut headers = SessionHeaders::default();
    match format {
        CookieFileFormat::HeaderLines => {
            for line in contents.lines() {
                let Some((name, value)) = header_line(line) else {
                    continue;
                };
                if name.eq_ignore_ascii_case("cookie") {
                    headers.merge_cookie_string(value);
                } else if name.eq_ignore_ascii_case("user-agent") {
                    headers.user_agent = Some(value.to_string());
                } else {
                    headers.extra.push((name.to_string(), value.to_string()));
                }
            }
        }
        CookieFileFormat::RawCookie => {
            for line in contents.lines().filter(|line| !line.starts_with('#')) {
                headers.merge_cookie_string(line);
            }
        }
        CookieFileFormat::Netscape => {
            let now = unix_now();
            for cookie in parse_netscape(contents)? {
                if cookie.matches(host, now) {
                    headers.set_cookie(cookie.name, cookie.value);
                }
            }
        }
        CookieFileFormat::Json => {
            let now = unix_now();
            for cookie in parse_json(contents)? {
                if cookie.matches(host, now) {
                    headers.set_cookie(cookie.name, cookie.value);
                }
            }
        }
    }
    Ok(headers)
}

/// Splits `a=1; b=2` into name/value pairs, dropping empty names.
/// Folds a freshly captured session for `domain` into an existing cookie
/// file.
///
/// When both are Netscape files or both are JSON exports, entries that apply
/// to `domain` are replaced by the capture and every other domain's entries
/// are kept. Header-line and bare cookie files describe a single session, so
/// the capture replaces them.
#[must_use]
pub fn merge_cookie_file(existing: &str, captured: &str, domain: &str) -> String {
    if existing.trim().is_empty() {
        return captured.to_string();
    }
    match (detect_format(existing), detect_format(captured)) {
        (CookieFileFormat::Netscape, CookieFileFormat::Netscape) => {
            merge_netscape(existing, captured, domain)
        }
        (CookieFileFormat::Json, CookieFileFormat::Json) => {
            merge_json(existing, captured, domain).unwrap_or_else(|| captured.to_string())
        }
        _ => captured.to_string(),
    }
}

/// Returns true when a cookie scoped to `cookie_domain` is sent to `host`.
fn applies_to(cookie_domain: &str, host: &str) -> bool {
    let cookie_domain = cookie_domain.trim_start_matches('.').to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    cookie_domain.is_empty() || host == cookie_domain || host.ends_with(&format!(".{cookie_domain}"))
}

fn merge_netscape(existing: &str, captured: &str, domain: &str) -> String {
    let mut merged: Vec<&str> = existing
        .lines()
        .filter(|line| {
            let cookie = line.strip_prefix("#HttpOnly_").unwrap_or(line);
            if cookie.starts_with('#') {
                return true;
            }
            let fields: Vec<&str> = cookie.split('\t').collect();
            fields.len() != 7 || !applies_to(fields[0], domain)
        })
        .collect();
    merged.extend(captured.lines().filter(|line| {
        let line = line.trim_end();
        !line.is_empty() && (!line.starts_with('#') || line.starts_with("#HttpOnly_"))
    }));

    let mut out = merged.join("\n");
    out.push('\n');
    out
}

fn merge_json(existing: &str, captured: &str, domain: &str) -> Option<String> {
    fn entries(value: serde_json::Value) -> Option<(Vec<serde_json::Value>, bool)> {
        match value {
            serde_json::Value::Array(entries) => Some((entries, false)),
            serde_json::Value::Object(mut map) => match map.remove("cookies")? {
                serde_json::Value::Array(entries) => Some((entries, true)),
                _ => None,
            },
            _ => None,
        }
    }

    let (kept, wrapped) = entries(serde_json::from_str(existing).ok()?)?;
    let (fresh, _) = entries(serde_json::from_str(captured).ok()?)?;

    let mut merged: Vec<serde_json::Value> = kept
        .into_iter()
        .filter(|entry| {
            let cookie_domain = entry
                .get("domain")
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            !applies_to(cookie_domain, domain)
        })
        .collect();
    merged.extend(fresh);

    let value = if wrapped {
        serde_json::json!({ "cookies": merged })
    } else {
        serde_json::Value::Array(merged)
    };
    serde_json::to_string_pretty(&value).ok()
}

fn split_cookie_pairs(raw: &str) -> impl Iterator<Item = (String, String)> + '_ {
    raw.split(';').filter_map(|pair| {
        let (name, value) = pair.split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name.to_string(), value.trim().to_string()))
    })
}

/// Recognizes `Name: Value` where the name is a header token.
fn header_line(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let name = name.trim();
    let is_token = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    is_token.then(|| (name, value.trim()))
}

/// One domain-scoped cookie from a Netscape or JSON file.
struct ScopedCookie {
    domain: String,
    tailmatch: bool,
    expires: u64,
    name: String,
    value: String,
}

impl ScopedCookie {
    fn matches(&self, host: &str, now: u64) -> bool {
        if self.expires > 0 && self.expires <= now {
            return false;
        }
        // no domain means "whatever host this file is used for"
        if self.domain.is_empty() {
            return true;
        }
        let domain = self.domain.trim_start_matches('.').to_ascii_lowercase();
        let host = host.to_ascii_lowercase();
        host == domain || (self.tailmatch && host.ends_with(&format!(".{domain}")))
    }
}

fn parse_netscape(contents: &str) -> Result<Vec<ScopedCookie>, CookieError> {
    let mut cookies = Vec::new();
    let mut malformed = 0;

    for (idx, line) in contents.lines().enumerate() {
        // "#HttpOnly_" prefixed lines are real cookies
        let line = line.trim_end();
        let line = line.strip_prefix("#HttpOnly_").unwrap_or(line);
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let fields: Vec<&str> = line.split('\t').collect();
        let parsed = (fields.len() == 7)
            .then(|| {
                let expires = fields[4].parse::<u64>().ok()?;
                (!fields[0].is_empty() && !fields[5].is_empty()).then(|| ScopedCookie {
                    domain: fields[0].to_string(),
                    tailmatch: fields[1].eq_ignore_ascii_case("TRUE"),
                    expires,
                    name: fields[5].to_string(),
                    value: fields[6].to_string(),
                })
            })
            .flatten();

        match parsed {
            Some(cookie) => cookies.push(cookie),
            None => {
                warn!(line = idx + 1, "skipping malformed cookie line");
                malformed += 1;
            }
        }
    }

    if cookies.is_empty() && malformed > 0 {
        return Err(CookieError::NoCookiesFound {
            malformed_count: malformed,
        });
    }
    Ok(cookies)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonCookiePayload {
    Array(Vec<JsonCookieEntry>),
    Wrapped { cookies: Vec<JsonCookieEntry> },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JsonCookieEntry {
    name: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    domain: Option<String>,
    #[serde(default)]
    host_only: Option<bool>,
    #[serde(default, alias = "expires")]
    expiration_date: Option<f64>,
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn parse_json(contents: &str) -> Result<Vec<ScopedCookie>, CookieError> {
    let entries = match serde_json::from_str::<JsonCookiePayload>(contents)? {
        JsonCookiePayload::Array(entries) | JsonCookiePayload::Wrapped { cookies: entries } => {
            entries
        }
    };

    Ok(entries
        .into_iter()
        .filter(|entry| !entry.name.is_empty())
        .map(|entry| {
            let domain = entry.domain.unwrap_or_default();
            let tailmatch = entry
                .host_only
                .map_or(domain.starts_with('.'), |host_only| !host_only);
            ScopedCookie {
                domain,
                tailmatch,
                expires: entry
                    .expiration_date
                    .filter(|secs| *secs > 0.0)
                    .map_or(0, |secs| secs as u64),
                name: entry.name,
                value: entry.value,
            }
        })
        .collect())
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}
