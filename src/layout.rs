//! Destination path convention.
//!
//! Pages land at
//! `<save_root>/<host>[_<book_id>][/<volume_id>]/<sequence><ext>`, where the
//! host has any `:` removed and `<sequence>` is a zero-padded page number, so
//! a lexical sort of the directory matches page order.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Default extension when the URL does not reveal one.
pub const DEFAULT_FILE_EXT: &str = ".jpg";

/// Characters that are not allowed in a directory name on common filesystems.
#[allow(clippy::expect_used)]
static RESERVED_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"[/\\:*?"<>|]+"#).expect("reserved-character regex is valid") // Static pattern, safe to panic
});

/// Returns the zero-padded sequence name for a 1-based page number.
///
/// Four digits wide; larger numbers widen naturally.
///
/// ```
/// use folio_core::layout::sorted_sequence;
///
/// assert_eq!(sorted_sequence(7), "0007");
/// assert_eq!(sorted_sequence(12345), "12345");
/// ```
#[must_use]
pub fn sorted_sequence(page: usize) -> String {
    format!("{page:04}")
}

/// Removes filesystem-reserved characters from a book or volume id.
#[must_use]
pub fn escape_id(id: &str) -> String {
    RESERVED_CHARS.replace_all(id.trim(), "").into_owned()
}

/// Derives the file extension (with leading dot) from a URL path.
///
/// Returns [`DEFAULT_FILE_EXT`] when the last path segment has no short
/// alphanumeric extension.
#[must_use]
pub fn file_ext(uri: &str) -> String {
    let Ok(url) = Url::parse(uri) else {
        return DEFAULT_FILE_EXT.to_string();
    };
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|last| last.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .filter(|ext| {
            !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
        })
        .map_or_else(
            || DEFAULT_FILE_EXT.to_string(),
            |ext| format!(".{}", ext.to_ascii_lowercase()),
        )
}

/// Builds destination paths under a save root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationLayout {
    save_root: PathBuf,
}

impl DestinationLayout {
    /// Creates a layout rooted at `save_root`.
    #[must_use]
    pub fn new(save_root: impl Into<PathBuf>) -> Self {
        Self {
            save_root: save_root.into(),
        }
    }

    /// Returns the save root.
    #[must_use]
    pub fn save_root(&self) -> &Path {
        &self.save_root
    }

    /// Returns `<save_root>/<host>[_<book_id>][/<volume_id>]`.
    ///
    /// Returns `None` when `page_url` has no host.
    #[must_use]
    pub fn volume_dir(
        &self,
        page_url: &str,
        book_id: Option<&str>,
        volume_id: Option<&str>,
    ) -> Option<PathBuf> {
        let url = Url::parse(page_url).ok()?;
        let host = url.host_str()?;
        let mut dir_name = match url.port() {
            Some(port) => format!("{host}{port}"),
            None => host.to_string(),
        };
        dir_name = dir_name.replace(':', "");

        if let Some(id) = book_id.map(escape_id).filter(|id| !id.is_empty()) {
            dir_name.push('_');
            dir_name.push_str(&id);
        }

        let mut dir = self.save_root.join(dir_name);
        if let Some(volume) = volume_id.map(escape_id).filter(|id| !id.is_empty()) {
            dir.push(volume);
        }
        Some(dir)
    }

    /// Returns the destination of 1-based page `page` of a volume.
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use folio_core::layout::DestinationLayout;
    ///
    /// let layout = DestinationLayout::new("/data");
    /// let dest = layout
    ///     .dest_path("https://iiif.example.org:8443/p/1/full.jpg", Some("b:12"), Some("v2"), 3, ".jpg")
    ///     .unwrap();
    /// assert_eq!(dest, PathBuf::from("/data/iiif.example.org8443_b12/v2/0003.jpg"));
    /// ```
    #[must_use]
    pub fn dest_path(
        &self,
        page_url: &str,
        book_id: Option<&str>,
        volume_id: Option<&str>,
        page: usize,
        ext: &str,
    ) -> Option<PathBuf> {
        let dir = self.volume_dir(page_url, book_id, volume_id)?;
        Some(dir.join(format!("{}{ext}", sorted_sequence(page))))
    }
}

/// Errors parsing a page range.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PageRangeError {
    /// The text is not `start:end`.
    #[error("invalid page range '{0}': expected start:end, e.g. 4:434")]
    Syntax(String),

    /// A bound is not a positive integer.
    #[error("invalid page number '{0}': pages are numbered from 1")]
    Page(String),

    /// The end does not come after the start.
    #[error("empty page range {start}:{end}")]
    Empty {
        /// First page.
        start: usize,
        /// Excluded end page.
        end: usize,
    },
}

/// A 1-indexed page filter: inclusive start, exclusive end.
///
/// Either bound may be open. The default range contains every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageRange {
    /// First page included.
    pub start: Option<usize>,
    /// First page excluded.
    pub end: Option<usize>,
}

impl PageRange {
    /// Parses `start:end`, `start:`, `:end`, or an empty string.
    ///
    /// # Errors
    ///
    /// Returns [`PageRangeError`] for malformed text, zero pages, or an empty range.
    pub fn parse(text: &str) -> Result<Self, PageRangeError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Self::default());
        }
        let Some((start, end)) = text.split_once(':') else {
            return Err(PageRangeError::Syntax(text.to_string()));
        };
        let range = Self {
            start: parse_bound(start)?,
            end: parse_bound(end)?,
        };
        if let (Some(start), Some(end)) = (range.start, range.end)
            && end <= start
        {
            return Err(PageRangeError::Empty { start, end });
        }
        Ok(range)
    }

    /// Returns true when 1-based `page` is inside the range.
    #[must_use]
    pub fn contains(&self, page: usize) -> bool {
        self.start.is_none_or(|start| page >= start) && self.end.is_none_or(|end| page < end)
    }
}

impl FromStr for PageRange {
    type Err = PageRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

fn parse_bound(text: &str) -> Result<Option<usize>, PageRangeError> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    match text.parse::<usize>() {
        Ok(page) if page >= 1 => Ok(Some(page)),
        _ => Err(PageRangeError::Page(text.to_string())),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sorted_sequence_sorts_lexically() {
        let mut names: Vec<String> = [10, 2, 1000, 99].into_iter().map(sorted_sequence).collect();
        names.sort();
        assert_eq!(names, vec!["0002", "0010", "0099", "1000"]);
    }

    #[test]
    fn test_escape_id_strips_reserved_characters() {
        assert_eq!(escape_id(r#"a/b\c:d*e?f"g<h>i|j"#), "abcdefghij");
        assert_eq!(escape_id(" rb-123.4 "), "rb-123.4");
    }

    #[test]
    fn test_file_ext_from_url() {
        assert_eq!(file_ext("https://example.com/iiif/1/full/full/0/default.JPG"), ".jpg");
        assert_eq!(file_ext("https://example.com/scan/0001.tif?x=1"), ".tif");
        assert_eq!(file_ext("https://example.com/getimage?id=3"), ".jpg");
        assert_eq!(file_ext("https://example.com/a.b/c"), ".jpg");
        assert_eq!(file_ext("not a url"), ".jpg");
    }

    #[test]
    fn test_dest_path_without_ids() {
        let layout = DestinationLayout::new("/data");
        let dest = layout
            .dest_path("https://lib.example.com/p/7.png", None, None, 7, ".png")
            .unwrap();
        assert_eq!(dest, PathBuf::from("/data/lib.example.com/0007.png"));
        assert!(layout.dest_path("no-host", None, None, 1, ".jpg").is_none());
    }

    #[test]
    fn test_dest_path_ignores_blank_ids() {
        let layout = DestinationLayout::new("/data");
        let dest = layout
            .dest_path("https://lib.example.com/p/1", Some("  "), Some(""), 1, ".jpg")
            .unwrap();
        assert_eq!(dest, PathBuf::from("/data/lib.example.com/0001.jpg"));
    }

    #[test]
    fn test_page_range_inclusive_start_exclusive_end() {
        let range = PageRange::parse("4:434").unwrap();
        assert!(!range.contains(3));
        assert!(range.contains(4));
        assert!(range.contains(433));
        assert!(!range.contains(434));
    }

    #[test]
    fn test_page_range_open_ends() {
        let from = PageRange::parse("5:").unwrap();
        assert!(!from.contains(4));
        assert!(from.contains(100_000));

        let until: PageRange = ":3".parse().unwrap();
        assert!(until.contains(1));
        assert!(until.contains(2));
        assert!(!until.contains(3));

        assert!(PageRange::parse("").unwrap().contains(1));
    }

    #[test]
    fn test_page_range_rejects_bad_input() {
        assert!(matches!(PageRange::parse("4"), Err(PageRangeError::Syntax(_))));
        assert!(matches!(PageRange::parse("0:4"), Err(PageRangeError::Page(_))));
        assert!(matches!(PageRange::parse("a:4"), Err(PageRangeError::Page(_))));
        assert_eq!(
            PageRange::parse("9:9"),
            Err(PageRangeError::Empty { start: 9, end: 9 })
        );
    }
}
