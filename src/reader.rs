//! Incremental log file reader with rotation detection.
//!
//! A [`LogSource`] remembers how far into a file it has read plus a
//! fingerprint of the file: its (device, inode) identity, its size and its
//! first bytes. Any of these changing in a way that cannot be an append
//! means the file was rotated or truncated, and reading restarts at offset 0.

use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::ReadError;

/// Lines longer than this are discarded and counted as skipped.
pub const MAX_LINE_BYTES: usize = 16 * 1024;

/// Default per-poll read budget.
pub const DEFAULT_READ_BUDGET: u64 = 1024 * 1024;

/// Number of leading bytes remembered to detect in-place rewrites.
const HEAD_BYTES: usize = 64;

/// Lines produced by one poll.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub lines: Vec<String>,
    /// Oversized lines dropped during this poll
    pub skipped: u64,
}

impl ReadBatch {
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty() && self.skipped == 0
    }
}

/// A monitored log file and its read position. Never persisted.
#[derive(Debug)]
pub struct LogSource {
    path: PathBuf,
    rule_set: String,
    offset: u64,
    identity: Option<(u64, u64)>,
    size: u64,
    head: Vec<u8>,
    missing: bool,
    /// Inside an oversized line whose end has not been seen yet
    discarding: bool,
    budget: u64,
}

impl LogSource {
    /// Create a source positioned at the current end of the file, so history
    /// already judged by a previous run is not scanned again.
    pub fn at_end(path: impl Into<PathBuf>, rule_set: impl Into<String>, budget: u64) -> Self {
        let mut source = Self::unprimed(path.into(), rule_set.into(), budget);
        match std::fs::metadata(&source.path) {
            Ok(meta) => {
                source.identity = Some((meta.dev(), meta.ino()));
                source.size = meta.len();
                source.offset = meta.len();
                source.head = read_head(&source.path).unwrap_or_default();
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("Log source {} does not exist yet", source.path.display());
                source.missing = true;
            }
            Err(e) => {
                // Surfaces again on the first poll.
                debug!("Cannot stat {}: {}", source.path.display(), e);
            }
        }
        source
    }

    /// Create a source that reads the file from the beginning.
    pub fn from_start(path: impl Into<PathBuf>, rule_set: impl Into<String>, budget: u64) -> Self {
        Self::unprimed(path.into(), rule_set.into(), budget)
    }

    fn unprimed(path: PathBuf, rule_set: String, budget: u64) -> Self {
        Self {
            path,
            rule_set,
            offset: 0,
            identity: None,
            size: 0,
            head: Vec::new(),
            missing: false,
            discarding: false,
            // A budget below one maximal line could never make progress.
            budget: budget.max(MAX_LINE_BYTES as u64 + 1),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rule_set(&self) -> &str {
        &self.rule_set
    }

    pub fn set_rule_set(&mut self, rule_set: impl Into<String>) {
        self.rule_set = rule_set.into();
    }

    pub fn set_budget(&mut self, budget: u64) {
        self.budget = budget.max(MAX_LINE_BYTES as u64 + 1);
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    /// Read whatever complete lines were appended since the last poll.
    ///
    /// Returns promptly; at most `budget` bytes are read per call. A missing
    /// file yields an empty batch (warned about once). Other I/O errors are
    /// returned and the position is left untouched.
    pub fn poll(&mut self) -> Result<ReadBatch, ReadError> {
        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.mark_missing();
                return Ok(ReadBatch::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        if self.missing {
            info!("Log source {} is available again", self.path.display());
            self.missing = false;
            self.reset();
        }

        if meta.is_dir() {
            return Err(self.io_error(std::io::Error::new(
                ErrorKind::Other,
                "log source is a directory",
            )));
        }

        let identity = (meta.dev(), meta.ino());
        let len = meta.len();

        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.mark_missing();
                return Ok(ReadBatch::default());
            }
            Err(source) => return Err(self.io_error(source)),
        };

        if self.rotated(identity, len, &mut file)? {
            info!(
                "Log source {} was rotated or truncated, reading from the start",
                self.path.display()
            );
            self.reset();
        }
        self.identity = Some(identity);
        self.size = len;

        if len <= self.offset {
            return Ok(ReadBatch::default());
        }

        let mut chunk = Vec::new();
        file.seek(SeekFrom::Start(self.offset))
            .map_err(|e| self.io_error(e))?;
        (&mut file)
            .take(self.budget)
            .read_to_end(&mut chunk)
            .map_err(|e| self.io_error(e))?;

        if self.head.len() < HEAD_BYTES && self.offset < HEAD_BYTES as u64 {
            self.head = read_head_from(&mut file).map_err(|e| self.io_error(e))?;
        }

        Ok(self.consume(&chunk))
    }

    /// Split a chunk into complete lines and advance the offset past them.
    fn consume(&mut self, chunk: &[u8]) -> ReadBatch {
        let mut batch = ReadBatch::default();

        let Some(last_newline) = chunk.iter().rposition(|&b| b == b'\n') else {
            // No complete line in this chunk
            if chunk.len() > MAX_LINE_BYTES {
                self.discarding = true;
                self.offset += chunk.len() as u64;
            }
            return batch;
        };

        for raw in chunk[..last_newline].split(|&b| b == b'\n') {
            if self.discarding {
                // Tail of an oversized line that began in an earlier chunk
                self.discarding = false;
                batch.skipped += 1;
                continue;
            }
            let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
            if raw.len() > MAX_LINE_BYTES {
                batch.skipped += 1;
                continue;
            }
            if raw.is_empty() {
                continue;
            }
            batch.lines.push(String::from_utf8_lossy(raw).into_owned());
        }
        self.offset += last_newline as u64 + 1;

        // A trailing partial line stays unconsumed unless it is already
        // too long to ever be accepted.
        let tail = chunk.len() - (last_newline + 1);
        if tail > MAX_LINE_BYTES {
            self.discarding = true;
            self.offset += tail as u64;
        }

        batch
    }

    fn rotated(&self, identity: (u64, u64), len: u64, file: &mut File) -> Result<bool, ReadError> {
        if let Some(previous) = self.identity {
            if previous != identity {
                return Ok(true);
            }
        }
        if len < self.offset {
            return Ok(true);
        }
        if !self.head.is_empty() && len >= self.head.len() as u64 {
            let mut current = vec![0u8; self.head.len()];
            file.seek(SeekFrom::Start(0))
                .map_err(|e| self.io_error(e))?;
            file.read_exact(&mut current)
                .map_err(|e| self.io_error(e))?;
            if current != self.head {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.head.clear();
        self.discarding = false;
    }

    fn mark_missing(&mut self) {
        if !self.missing {
            warn!(
                "Log source {} is missing, will keep polling",
                self.path.display()
            );
            self.missing = true;
        }
        self.identity = None;
    }

    fn io_error(&self, source: std::io::Error) -> ReadError {
        ReadError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file = File::open(path)?;
    read_head_from(&mut file)
}

fn read_head_from(file: &mut File) -> std::io::Result<Vec<u8>> {
    let mut head = Vec::with_capacity(HEAD_BYTES);
    file.seek(SeekFrom::Start(0))?;
    file.take(HEAD_BYTES as u64).read_to_end(&mut head)?;
    Ok(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::TempDir;

    fn append(path: &Path, data: &str) {
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(data.as_bytes()).unwrap();
    }

    #[test]
    fn test_starts_at_end_of_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "old line 1\nold line 2\n");

        let mut source = LogSource::at_end(&path, "sshd", DEFAULT_READ_BUDGET);
        assert!(source.poll().unwrap().lines.is_empty());

        append(&path, "new line\n");
        assert_eq!(source.poll().unwrap().lines, vec!["new line"]);
        assert!(source.poll().unwrap().lines.is_empty());
    }

    #[test]
    fn test_partial_line_held_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);

        append(&path, "complete\npart");
        assert_eq!(source.poll().unwrap().lines, vec!["complete"]);

        append(&path, "ial\n");
        assert_eq!(source.poll().unwrap().lines, vec!["partial"]);
    }

    #[test]
    fn test_crlf_stripped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "windows line\r\n");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        assert_eq!(source.poll().unwrap().lines, vec!["windows line"]);
    }

    #[test]
    fn test_truncate_and_rewrite_resumes_at_zero() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "before rotation one\nbefore rotation two\n");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        assert_eq!(source.poll().unwrap().lines.len(), 2);

        // Shorter content in place
        fs::write(&path, "after\n").unwrap();
        assert_eq!(source.poll().unwrap().lines, vec!["after"]);
        assert!(source.poll().unwrap().lines.is_empty());
    }

    #[test]
    fn test_in_place_rewrite_longer_than_offset_detected_by_head() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "aaaa\n");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        assert_eq!(source.poll().unwrap().lines, vec!["aaaa"]);

        // Same inode, bigger than the old offset, different first bytes
        fs::write(&path, "bbbbbbbbbb\ncccccccccc\n").unwrap();
        let lines = source.poll().unwrap().lines;
        assert_eq!(lines, vec!["bbbbbbbbbb", "cccccccccc"]);
    }

    #[test]
    fn test_rename_rotation_detected_by_inode() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "first generation line\n");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        assert_eq!(source.poll().unwrap().lines.len(), 1);

        fs::rename(&path, dir.path().join("auth.log.1")).unwrap();
        append(&path, "first generation line\nsecond generation\n");
        let lines = source.poll().unwrap().lines;
        assert_eq!(lines, vec!["first generation line", "second generation"]);
    }

    #[test]
    fn test_missing_file_then_reappears() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("later.log");
        let mut source = LogSource::at_end(&path, "sshd", DEFAULT_READ_BUDGET);
        assert!(source.is_missing());
        assert!(source.poll().unwrap().is_empty());
        assert!(source.poll().unwrap().is_empty());

        append(&path, "hello\n");
        assert_eq!(source.poll().unwrap().lines, vec!["hello"]);
        assert!(!source.is_missing());
    }

    #[test]
    fn test_file_removed_while_tracked() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        append(&path, "x\n");
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        source.poll().unwrap();
        fs::remove_file(&path).unwrap();
        assert!(source.poll().unwrap().is_empty());
        assert!(source.is_missing());
    }

    #[test]
    fn test_oversized_line_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let big = "x".repeat(MAX_LINE_BYTES + 10);
        append(&path, &format!("short\n{}\nafter\n", big));

        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        let batch = source.poll().unwrap();
        assert_eq!(batch.lines, vec!["short", "after"]);
        assert_eq!(batch.skipped, 1);
    }

    #[test]
    fn test_oversized_line_spanning_polls() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        // Budget gets clamped to MAX_LINE_BYTES + 1; the line is larger
        let big = "y".repeat(MAX_LINE_BYTES * 3);
        append(&path, &format!("{}\nnext\n", big));

        let mut source = LogSource::from_start(&path, "sshd", 1);
        let mut lines = Vec::new();
        let mut skipped = 0;
        for _ in 0..10 {
            let batch = source.poll().unwrap();
            lines.extend(batch.lines);
            skipped += batch.skipped;
        }
        assert_eq!(lines, vec!["next"]);
        assert_eq!(skipped, 1);
    }

    #[test]
    fn test_read_budget_limits_each_poll() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        let line = format!("{}\n", "z".repeat(99));
        for _ in 0..1000 {
            append(&path, &line);
        }
        // 100 KB of data, budget clamps to 16 KiB + 1
        let mut source = LogSource::from_start(&path, "sshd", 0);
        let first = source.poll().unwrap().lines.len();
        assert!(first > 0 && first < 1000);

        let mut total = first;
        while total < 1000 {
            let n = source.poll().unwrap().lines.len();
            assert!(n > 0);
            total += n;
        }
        assert_eq!(total, 1000);
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.log");
        fs::write(&path, b"bad \xff byte\n").unwrap();
        let mut source = LogSource::from_start(&path, "sshd", DEFAULT_READ_BUDGET);
        let lines = source.poll().unwrap().lines;
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("bad "));
        assert!(lines[0].contains('\u{FFFD}'));
    }

    #[test]
    fn test_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        let mut source = LogSource::from_start(dir.path(), "sshd", DEFAULT_READ_BUDGET);
        assert!(source.poll().is_err());
    }
}
