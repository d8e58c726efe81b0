//! Task file parsing for the binary.
//!
//! One task per line: `uri<TAB>destination[<TAB>segments]`. Blank lines and
//! lines starting with `#` are ignored; relative destinations resolve against
//! the save root.

use std::path::Path;

use anyhow::{Context, Result, bail};
use folio_core::download::DownloadTask;

/// Parses a task file into tasks.
///
/// `default_segments` applies to lines without a segment column.
pub(crate) fn parse_task_file(
    contents: &str,
    save_root: &Path,
    default_segments: usize,
) -> Result<Vec<DownloadTask>> {
    let mut tasks = Vec::new();
    for (index, raw_line) in contents.lines().enumerate() {
        let line_no = index + 1;
        let line = raw_line.trim_end_matches('\r');
        if line.trim().is_empty() || line.trim_start().starts_with('#') {
            continue;
        }

        let mut fields = line.split('\t').map(str::trim);
        let uri = fields.next().unwrap_or_default();
        let Some(destination) = fields.next().filter(|d| !d.is_empty()) else {
            bail!("Invalid task on line {line_no}: expected uri<TAB>destination");
        };
        if url::Url::parse(uri).is_err() {
            bail!("Invalid task on line {line_no}: '{uri}' is not an absolute URL");
        }
        let segments = match fields.next().filter(|s| !s.is_empty()) {
            Some(raw) => raw
                .parse::<usize>()
                .with_context(|| format!("Invalid segment count on line {line_no}"))?,
            None => default_segments,
        };

        tasks.push(
            DownloadTask::new(uri, save_root.join(destination)).with_concurrency(segments),
        );
    }
    Ok(tasks)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_parse_task_file_reads_columns() {
        let contents = "# book 1\nhttps://a.example/1.jpg\tb1/0001.jpg\n\nhttps://a.example/2.jpg\t/abs/0002.jpg\t4\r\n";
        let tasks = parse_task_file(contents, Path::new("/data"), 1).unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].destination, PathBuf::from("/data/b1/0001.jpg"));
        assert_eq!(tasks[0].concurrency, 1);
        assert_eq!(tasks[1].destination, PathBuf::from("/abs/0002.jpg"));
        assert_eq!(tasks[1].concurrency, 4);
    }

    #[test]
    fn test_parse_task_file_rejects_missing_destination() {
        let err = parse_task_file("https://a.example/1.jpg\n", Path::new("/data"), 1).unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn test_parse_task_file_rejects_relative_uri() {
        let err = parse_task_file("x\t/data/1\n", Path::new("/data"), 1).unwrap_err();
        assert!(err.to_string().contains("not an absolute URL"));
    }
}
