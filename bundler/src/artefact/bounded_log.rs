//! Size-bounded tool logs.
//!
//! Extraction tools can be extremely chatty on large archives. Logs are
//! capped so that a bundle directory never fills up with diagnostics: the
//! in-process extractor keeps the first warnings, while subprocess logs keep
//! their tail, where the fatal message usually is.

use camino::Utf8Path;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};

/// Default cap for a single tool log.
pub const DEFAULT_LOG_LIMIT: usize = 64 * 1024;

const TRUNCATION_NOTE: &str = "[log truncated]";

/// An in-memory log that stops growing at a byte limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedLog {
    limit: usize,
    text: String,
    truncated: bool,
}

impl BoundedLog {
    /// Create an empty log capped at `limit` bytes.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            text: String::new(),
            truncated: false,
        }
    }

    /// Append one line, dropping it once the cap is reached.
    pub fn push_line(&mut self, line: &str) {
        if self.truncated {
            return;
        }
        if self.text.len() + line.len() + 1 > self.limit {
            self.truncated = true;
            return;
        }
        self.text.push_str(line);
        self.text.push('\n');
    }

    /// Returns `true` when nothing has been logged.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && !self.truncated
    }

    /// Finish the log, appending a note if lines were dropped.
    #[must_use]
    pub fn into_string(mut self) -> String {
        if self.truncated {
            self.text.push_str(TRUNCATION_NOTE);
            self.text.push('\n');
        }
        self.text
    }
}

/// Return at most the last `limit` bytes of `text`, on a character boundary.
///
/// # Examples
///
/// ```
/// use airgap_bundler::artefact::bounded_log::tail;
///
/// assert_eq!(tail("abcdef", 3), "def");
/// assert_eq!(tail("abc", 10), "abc");
/// ```
#[must_use]
pub fn tail(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text.get(start..).unwrap_or_default()
}

/// Read the last `limit` bytes of the file at `path`.
///
/// # Errors
///
/// Returns I/O errors from opening or reading the file.
pub fn read_tail(path: &Utf8Path, limit: usize) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let limit = u64::try_from(limit).unwrap_or(u64::MAX);
    if len > limit {
        file.seek(SeekFrom::Start(len - limit))?;
    }
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Shrink the log at `path` to its last `limit` bytes.
///
/// Returns the retained text.
///
/// # Errors
///
/// Returns I/O errors from reading or rewriting the file.
pub fn truncate_to_tail(path: &Utf8Path, limit: usize) -> std::io::Result<String> {
    let len = std::fs::metadata(path)?.len();
    let retained = read_tail(path, limit)?;
    if len > u64::try_from(limit).unwrap_or(u64::MAX) {
        std::fs::write(path, format!("{TRUNCATION_NOTE}\n{retained}"))?;
    }
    Ok(retained)
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;

    #[test]
    fn bounded_log_stops_at_limit() {
        let mut log = BoundedLog::new(12);
        log.push_line("warning 1");
        log.push_line("warning 2");
        let text = log.into_string();
        assert_eq!(text, "warning 1\n[log truncated]\n");
    }

    #[test]
    fn empty_log_reports_empty() {
        assert!(BoundedLog::new(10).is_empty());
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = "ab\u{e9}cd";
        let kept = tail(text, 3);
        assert_eq!(kept, "cd");
    }

    #[test]
    fn truncate_to_tail_keeps_the_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("tar.log")).expect("utf8");
        let mut body = "noise\n".repeat(100);
        body.push_str("tar: Error is not recoverable\n");
        std::fs::write(&path, &body).expect("write log");

        let retained = truncate_to_tail(&path, 40).expect("truncate");

        assert!(retained.ends_with("tar: Error is not recoverable\n"));
        let on_disk = std::fs::read_to_string(&path).expect("read log");
        assert!(on_disk.starts_with(TRUNCATION_NOTE));
        assert!(on_disk.len() < body.len());
    }

    #[test]
    fn short_log_is_left_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = Utf8PathBuf::from_path_buf(dir.path().join("tar.log")).expect("utf8");
        std::fs::write(&path, "ok\n").expect("write log");

        assert_eq!(truncate_to_tail(&path, 40).expect("truncate"), "ok\n");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "ok\n");
    }
}
