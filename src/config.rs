//! Engine configuration: defaults, `key = value` file loading, validation.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::download::{DEFAULT_MAX_RETRIES, DEFAULT_SEGMENT_RETRIES};
use crate::layout::PageRange;
use crate::user_agent;

/// Upper bound on worker threads.
pub const MAX_THREADS: usize = 64;

/// Upper bound on range segments per task.
pub const MAX_SEGMENT_CONCURRENCY: usize = 32;

/// Default cap on simultaneous connections (`threads × segments`).
pub const DEFAULT_MAX_CONNECTIONS: usize = 64;

/// Largest task-to-task pause, in seconds.
pub const MAX_SPEED_SECS: u64 = 60;

/// Largest retry count.
pub const MAX_RETRIES: u32 = 10;

/// Default cookie file name, relative to the working directory.
pub const DEFAULT_COOKIE_FILE: &str = "cookie.txt";

/// Every tunable of a download run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Root under which destinations are laid out.
    pub save_root: PathBuf,
    /// Tasks running at once.
    pub threads: usize,
    /// Default range segments per task (1 disables chunking).
    pub segment_concurrency: usize,
    /// Cap on `threads × segments`.
    pub max_connections: usize,
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Pause after each task, in seconds.
    pub speed_secs: u64,
    /// Default User-Agent.
    pub user_agent: String,
    /// Session cookie file.
    pub cookie_file: Option<PathBuf>,
    /// HTTP connect timeout.
    pub connect_timeout_secs: u64,
    /// HTTP read timeout.
    pub read_timeout_secs: u64,
    /// Retries per range segment.
    pub segment_retries: u32,
    /// External command capturing a new session (`{url}`, `{domain}` placeholders).
    pub reauth_command: Option<String>,
    /// Time allowed for re-authentication.
    pub reauth_timeout_secs: u64,
    /// Body patterns marking a session-expired page.
    pub session_markers: Vec<String>,
    /// Pages to fetch from each volume.
    pub page_range: PageRange,
    /// Forced file extension (with dot); derived from URLs when unset.
    pub file_ext: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        Self {
            cookie_file: Some(cwd.join(DEFAULT_COOKIE_FILE)),
            save_root: cwd,
            threads: default_threads(),
            segment_concurrency: 1,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            max_retries: DEFAULT_MAX_RETRIES,
            speed_secs: 0,
            user_agent: user_agent::default_download_user_agent(),
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            segment_retries: DEFAULT_SEGMENT_RETRIES,
            reauth_command: None,
            reauth_timeout_secs: 300,
            session_markers: Vec::new(),
            page_range: PageRange::default(),
            file_ext: None,
        }
    }
}

/// Twice the CPU count, bounded to `1..=MAX_THREADS`.
#[must_use]
pub fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map_or(1, std::num::NonZeroUsize::get)
        .saturating_mul(2)
        .clamp(1, MAX_THREADS)
}

impl EngineConfig {
    /// Returns defaults overlaid with the config file at `path`, if given.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be read, has a syntax error, an unknown key,
    /// or an out-of-range value (messages carry the line number).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(path) = path {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
            config
                .apply_str(&raw)
                .with_context(|| format!("Failed to parse config file '{}'", path.display()))?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validates values against runtime constraints, clamping `speed_secs`.
    ///
    /// # Errors
    ///
    /// Fails for out-of-range values.
    pub fn validate(&mut self) -> Result<()> {
        if !(1..=MAX_THREADS).contains(&self.threads) {
            bail!(
                "Invalid value for `threads`: {}. Expected range: 1..={MAX_THREADS}",
                self.threads
            );
        }
        if !(1..=MAX_SEGMENT_CONCURRENCY).contains(&self.segment_concurrency) {
            bail!(
                "Invalid value for `segment_concurrency`: {}. Expected range: 1..={MAX_SEGMENT_CONCURRENCY}",
                self.segment_concurrency
            );
        }
        if !(1..=1024).contains(&self.max_connections) {
            bail!(
                "Invalid value for `max_connections`: {}. Expected range: 1..=1024",
                self.max_connections
            );
        }
        if self.max_retries > MAX_RETRIES {
            bail!(
                "Invalid value for `max_retries`: {}. Expected range: 0..={MAX_RETRIES}",
                self.max_retries
            );
        }
        if self.segment_retries > MAX_RETRIES {
            bail!(
                "Invalid value for `segment_retries`: {}. Expected range: 0..={MAX_RETRIES}",
                self.segment_retries
            );
        }
        validate_timeout_secs("connect_timeout_secs", self.connect_timeout_secs)?;
        validate_timeout_secs("read_timeout_secs", self.read_timeout_secs)?;
        if !(1..=86_400).contains(&self.reauth_timeout_secs) {
            bail!(
                "Invalid value for `reauth_timeout_secs`: {}. Expected range: 1..=86400",
                self.reauth_timeout_secs
            );
        }
        if self.threads > self.max_connections {
            warn!(
                threads = self.threads,
                max_connections = self.max_connections,
                "more threads than allowed connections, reducing threads"
            );
            self.threads = self.max_connections;
        }
        if self.speed_secs > MAX_SPEED_SECS {
            warn!(
                speed = self.speed_secs,
                max = MAX_SPEED_SECS,
                "speed above maximum, capping"
            );
            self.speed_secs = MAX_SPEED_SECS;
        }
        Ok(())
    }

    /// Returns the number of tasks that may run at once, never more than
    /// `max_connections`.
    #[must_use]
    pub fn effective_threads(&self) -> usize {
        self.threads.clamp(1, self.max_connections.max(1))
    }

    /// Returns the number of range segments a task may use.
    ///
    /// `requested` (a task hint, or 0 for the configured default) is bounded
    /// so that `threads × segments` stays within `max_connections`.
    #[must_use]
    pub fn effective_segment_concurrency(&self, requested: usize) -> usize {
        let requested = if requested == 0 {
            self.segment_concurrency
        } else {
            requested
        };
        let per_thread = (self.max_connections / self.effective_threads()).max(1);
        requested.clamp(1, per_thread.min(MAX_SEGMENT_CONCURRENCY))
    }

    /// Applies `key = value` lines over the current values.
    ///
    /// # Errors
    ///
    /// Fails on syntax errors, unknown keys and unparsable values.
    pub fn apply_str(&mut self, raw: &str) -> Result<()> {
        for (line_index, raw_line) in raw.lines().enumerate() {
            let line_no = line_index + 1;
            let line = strip_inline_comment(raw_line).trim();
            if line.is_empty() || line.starts_with('[') {
                continue;
            }

            let Some((raw_key, raw_value)) = line.split_once('=') else {
                bail!("Invalid config syntax on line {line_no}: expected key = value");
            };
            let key = raw_key.trim();
            let value = raw_value.trim();
            let context = || format!("Invalid `{key}` value on line {line_no}");

            match key {
                "save_root" | "output_dir" => {
                    self.save_root = PathBuf::from(parse_string(value).with_context(context)?);
                }
                "threads" => {
                    self.threads = parse_usize(value).with_context(context)?;
                }
                "segment_concurrency" => {
                    self.segment_concurrency = parse_usize(value).with_context(context)?;
                }
                "max_connections" => {
                    self.max_connections = parse_usize(value).with_context(context)?;
                }
                "max_retries" => {
                    self.max_retries = parse_u32(value).with_context(context)?;
                }
                "segment_retries" => {
                    self.segment_retries = parse_u32(value).with_context(context)?;
                }
                "speed" => {
                    self.speed_secs = parse_u64(value).with_context(context)?;
                }
                "user_agent" => {
                    self.user_agent = parse_string(value).with_context(context)?;
                }
                "cookie_file" => {
                    let path = parse_string(value).with_context(context)?;
                    self.cookie_file = (!path.is_empty()).then(|| PathBuf::from(path));
                }
                "connect_timeout_secs" => {
                    self.connect_timeout_secs = parse_u64(value).with_context(context)?;
                }
                "read_timeout_secs" => {
                    self.read_timeout_secs = parse_u64(value).with_context(context)?;
                }
                "reauth_command" => {
                    let command = parse_string(value).with_context(context)?;
                    self.reauth_command = (!command.trim().is_empty()).then_some(command);
                }
                "reauth_timeout_secs" => {
                    self.reauth_timeout_secs = parse_u64(value).with_context(context)?;
                }
                "session_markers" => {
                    self.session_markers = parse_string(value)
                        .with_context(context)?
                        .split(',')
                        .map(str::trim)
                        .filter(|marker| !marker.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "seq" => {
                    let text = parse_string(value).with_context(context)?;
                    self.page_range = PageRange::parse(&text).with_context(context)?;
                }
                "ext" => {
                    let ext = parse_string(value).with_context(context)?;
                    self.file_ext = normalize_ext(&ext);
                }
                unknown => {
                    bail!("Unknown configuration key: '{unknown}' on line {line_no}");
                }
            }
        }
        Ok(())
    }
}

/// Returns `ext` with a leading dot, or `None` when blank.
#[must_use]
pub fn normalize_ext(ext: &str) -> Option<String> {
    let ext = ext.trim();
    if ext.is_empty() {
        return None;
    }
    Some(if ext.starts_with('.') {
        ext.to_string()
    } else {
        format!(".{ext}")
    })
}

fn validate_timeout_secs(field: &str, value: u64) -> Result<()> {
    if !(1..=3600).contains(&value) {
        bail!("Invalid value for `{field}`: {value}. Expected range: 1..=3600");
    }
    Ok(())
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' | ';' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

/// Accepts a double-quoted string, or a bare token without spaces.
fn parse_string(raw_value: &str) -> Result<String> {
    if raw_value.len() >= 2 && raw_value.starts_with('"') && raw_value.ends_with('"') {
        return Ok(raw_value[1..raw_value.len() - 1].to_string());
    }
    if raw_value.starts_with('"') || raw_value.contains(char::is_whitespace) {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value.to_string())
}

fn parse_u64(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_u32(raw_value: &str) -> Result<u32> {
    u32::try_from(parse_u64(raw_value)?)
        .map_err(|_| anyhow::anyhow!("Integer value out of range for u32"))
}

fn parse_usize(raw_value: &str) -> Result<usize> {
    usize::try_from(parse_u64(raw_value)?)
        .map_err(|_| anyhow::anyhow!("Integer value out of range"))
}
