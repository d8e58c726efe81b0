//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Bulk download of document pages and images.
///
/// Tasks come from a tab-separated file (`uri<TAB>destination[<TAB>segments]`)
/// or from page URLs given as arguments, which are numbered in order and laid
/// out under the output directory.
#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(author, version, about)]
pub struct Args {
    /// Page URLs, in page order
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// Task file with one `uri<TAB>destination[<TAB>segments]` per line
    #[arg(short = 'i', long = "input", value_name = "FILE", conflicts_with = "urls")]
    pub task_file: Option<PathBuf>,

    /// Save root for URL arguments (defaults to the current directory)
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output: Option<PathBuf>,

    /// Configuration file (`key = value` lines)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Session cookie file
    #[arg(short = 'c', long, value_name = "FILE")]
    pub cookie: Option<PathBuf>,

    /// Tasks downloaded at once (1-64)
    #[arg(short = 'n', long, value_parser = clap::value_parser!(u8).range(1..=64))]
    pub threads: Option<u8>,

    /// Parallel range segments per file (1-32, 1 disables chunking)
    #[arg(long, value_parser = clap::value_parser!(u8).range(1..=32))]
    pub segments: Option<u8>,

    /// Maximum retry attempts for transient failures (0-10)
    #[arg(short = 'r', long, value_parser = clap::value_parser!(u8).range(0..=10))]
    pub max_retries: Option<u8>,

    /// Pause after each file in seconds (0 to disable, capped at 60)
    #[arg(long, value_name = "SECS")]
    pub speed: Option<u64>,

    /// Pages to fetch, inclusive start and exclusive end, e.g. 4:434
    #[arg(long, value_name = "START:END")]
    pub seq: Option<String>,

    /// Book identifier appended to the host directory
    #[arg(long)]
    pub book_id: Option<String>,

    /// Volume identifier used as a subdirectory
    #[arg(long)]
    pub volume_id: Option<String>,

    /// File extension for URL arguments (derived from each URL by default)
    #[arg(long)]
    pub ext: Option<String>,

    /// User-Agent header
    #[arg(long = "ua", value_name = "USER_AGENT")]
    pub user_agent: Option<String>,

    /// Command that captures a fresh session (`{url}` and `{domain}` are substituted)
    #[arg(long, value_name = "COMMAND")]
    pub reauth_command: Option<String>,

    /// Re-download files that already exist
    #[arg(long)]
    pub overwrite: bool,

    /// Write the run summary as JSON to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<PathBuf>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_default_args_parses_successfully() {
        let args = Args::try_parse_from(["folio"]).unwrap();
        assert!(args.urls.is_empty());
        assert_eq!(args.verbose, 0);
        assert!(!args.quiet);
        assert!(args.threads.is_none());
        assert!(!args.overwrite);
    }

    #[test]
    fn test_cli_verbose_flag_increments_count() {
        let args = Args::try_parse_from(["folio", "-vv"]).unwrap();
        assert_eq!(args.verbose, 2);
    }

    #[test]
    fn test_cli_parses_engine_options() {
        let args = Args::try_parse_from([
            "folio",
            "-n",
            "8",
            "--segments",
            "4",
            "-r",
            "5",
            "--speed",
            "2",
            "--seq",
            "4:434",
            "--book-id",
            "rb1",
            "https://a.example/1.jpg",
        ])
        .unwrap();
        assert_eq!(args.threads, Some(8));
        assert_eq!(args.segments, Some(4));
        assert_eq!(args.max_retries, Some(5));
        assert_eq!(args.speed, Some(2));
        assert_eq!(args.seq.as_deref(), Some("4:434"));
        assert_eq!(args.book_id.as_deref(), Some("rb1"));
        assert_eq!(args.urls, vec!["https://a.example/1.jpg".to_string()]);
    }

    #[test]
    fn test_cli_rejects_out_of_range_threads() {
        assert!(Args::try_parse_from(["folio", "-n", "0"]).is_err());
        assert!(Args::try_parse_from(["folio", "-n", "65"]).is_err());
        assert!(Args::try_parse_from(["folio", "--segments", "33"]).is_err());
        assert!(Args::try_parse_from(["folio", "-r", "11"]).is_err());
    }

    #[test]
    fn test_cli_task_file_conflicts_with_urls() {
        let result = Args::try_parse_from(["folio", "-i", "tasks.tsv", "https://a.example/1"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_cli_help_flag_shows_usage() {
        let err = Args::try_parse_from(["folio", "--help"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::DisplayHelp);
    }
}
