//! A single tracked log file: read offset, fingerprint, rotation detection,
//! and line reassembly across read boundaries.
//!
//! Grounded on `logFile` and its methods in `logfile.go`. The async I/O
//! shape (an `Option<tokio::fs::File>` reopened lazily, gate-guarded reads)
//! follows `FileWatcher` in `lib/file-source/src/file_watcher/mod.rs`.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::watch;
use tracing::warn;

use crate::collector::checkpoint::Checkpoint;
use crate::collector::fingerprint::calc_fingerprint;
use crate::collector::processor::LineProcessor;
use crate::concurrency::{acquire_process, acquire_read};
use crate::fatal;

/// Container runtimes pre-split lines at roughly 16 KiB; a reassembled line
/// past this is either a misparse or a pathological writer, and either way
/// must not be allowed to grow the tail buffer without bound.
const MAX_LOG_LINE_SIZE: usize = 2 * 1024 * 1024;

/// Read buffer size. Matches the Go pool's `256 * 1024`.
const READ_BUF_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFileStatus {
    NotRotated,
    Rotated,
    Deleted,
}

pub struct LogFile {
    path: PathBuf,
    file: Option<tokio::fs::File>,

    inode: u64,
    fingerprint: u64,
    offset: u64,

    commit_inode: u64,
    commit_fingerprint: u64,
    commit_offset: u64,

    /// The last incomplete line read from the file, carried across reads.
    tail: Vec<u8>,
    /// Tracks the true accumulated size of an incomplete line even past the
    /// point where `tail` itself stops growing, so an oversized line is
    /// still detected without holding all of it in memory.
    tail_size: usize,
}

impl LogFile {
    /// A reader not yet backed by an open file handle; the first call to
    /// `read_lines` or `try_reopen` opens it.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        LogFile {
            path: path.into(),
            file: None,
            inode: 0,
            fingerprint: 0,
            offset: 0,
            commit_inode: 0,
            commit_fingerprint: 0,
            commit_offset: 0,
            tail: Vec::new(),
            tail_size: 0,
        }
    }

    /// Build a `LogFile` around an already-open handle, used when resuming
    /// onto a renamed sibling found by the file collector's directory scan.
    pub async fn from_file(
        file: tokio::fs::File,
        fingerprint: u64,
        path: impl Into<PathBuf>,
    ) -> std::io::Result<Self> {
        let metadata = file.metadata().await?;
        let inode = metadata.ino();
        Ok(LogFile {
            path: path.into(),
            file: Some(file),
            inode,
            fingerprint,
            offset: 0,
            commit_inode: inode,
            commit_fingerprint: fingerprint,
            commit_offset: 0,
            tail: Vec::new(),
            tail_size: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Pull bytes from the file, reassemble lines, and feed each to
    /// `processor`. Returns `true` iff at least one byte was read. Checks
    /// `stop` only between read attempts: an in-flight read is never
    /// interrupted mid-syscall, matching the Go original.
    pub async fn read_lines(
        &mut self,
        stop: &mut watch::Receiver<bool>,
        processor: &mut dyn LineProcessor,
    ) -> bool {
        if self.file.is_none() && !self.try_reopen().await {
            return false;
        }

        let mut any_read = false;
        let mut buf = BytesMut::zeroed(READ_BUF_SIZE);

        loop {
            if *stop.borrow() {
                return any_read;
            }

            let n = {
                let _permit = acquire_read().await;
                let file = self.file.as_mut().expect("checked above");
                match file.read(&mut buf[..]).await {
                    Ok(0) => return any_read,
                    Ok(n) => n,
                    Err(error) => fatal!(
                        message = "cannot read from log file",
                        path = %self.path.display(),
                        %error
                    ),
                }
            };

            any_read = true;

            {
                let _permit = acquire_process().await;
                self.process_lines(&buf[..n], processor);
            }

            if n < buf.len() {
                return any_read;
            }
        }
    }

    fn process_lines(&mut self, data: &[u8], processor: &mut dyn LineProcessor) {
        if data.is_empty() {
            return;
        }

        let Some((mut data, tail)) = self.try_complete_tail(data) else {
            return;
        };

        if let Some(tail) = tail {
            self.add_line(processor, &tail);
        }

        while let Some(n) = data.iter().position(|&b| b == b'\n') {
            let line = &data[..n];
            self.add_line(processor, line);
            data = &data[n + 1..];
        }

        self.set_tail(data);
    }

    /// Complete any incomplete line carried from the previous read. Returns
    /// `None` if the tail is still incomplete (caller should stop scanning
    /// this buffer), otherwise the remaining data and an optional completed
    /// tail line to deliver first.
    fn try_complete_tail<'d>(&mut self, data: &'d [u8]) -> Option<(&'d [u8], Option<Vec<u8>>)> {
        if self.tail_size == 0 {
            return Some((data, None));
        }

        let Some(n) = data.iter().position(|&b| b == b'\n') else {
            self.tail_size += data.len();
            if self.tail_size <= MAX_LOG_LINE_SIZE {
                self.tail.extend_from_slice(data);
            }
            return None;
        };

        let tail_end = &data[..n];
        let rest = &data[n + 1..];

        self.tail_size += tail_end.len();
        if self.tail_size > MAX_LOG_LINE_SIZE {
            warn!(
                message = "log line exceeds maximum allowed size, dropping it",
                path = %self.path.display(),
                size = self.tail_size,
                max = MAX_LOG_LINE_SIZE,
            );

            if self.offset == 0 {
                self.fingerprint = calc_fingerprint(&self.tail);
            }
            self.offset += (self.tail_size + 1) as u64;

            self.tail_size = 0;
            self.tail.clear();

            return Some((rest, None));
        }

        self.tail.extend_from_slice(tail_end);
        let tail = std::mem::take(&mut self.tail);
        self.tail_size = 0;

        Some((rest, Some(tail)))
    }

    fn set_tail(&mut self, tail: &[u8]) {
        debug_assert_eq!(self.tail_size, 0, "cannot set tail when previous tail is not empty");

        if tail.is_empty() {
            self.tail.clear();
            return;
        }

        self.tail.clear();
        self.tail.extend_from_slice(tail);
        self.tail_size = tail.len();
    }

    fn add_line(&mut self, processor: &mut dyn LineProcessor, line: &[u8]) {
        if self.offset == 0 {
            self.fingerprint = calc_fingerprint(line);
        }

        let commit = processor.try_add_line(line);
        self.offset += line.len() as u64 + 1;
        if commit {
            self.commit_inode = self.inode;
            self.commit_fingerprint = self.fingerprint;
            self.commit_offset = self.offset;
        }
    }

    /// Classify the file against the symlink at `path`, per the five-step
    /// order in the module doc: deleted, missing target, same inode, empty
    /// target, otherwise rotated.
    pub async fn status(&self) -> LogFileStatus {
        if tokio::fs::symlink_metadata(&self.path).await.is_err() {
            return LogFileStatus::Deleted;
        }

        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return LogFileStatus::NotRotated;
            }
            Err(error) => fatal!(
                message = "cannot stat log file target",
                path = %self.path.display(),
                %error
            ),
        };

        let new_inode = metadata.ino();
        if self.inode == new_inode {
            return LogFileStatus::NotRotated;
        }
        if metadata.len() == 0 {
            return LogFileStatus::NotRotated;
        }
        LogFileStatus::Rotated
    }

    /// Seek to `offset` and install commit pointers there. Requires a
    /// fingerprint to already be set; callers resuming from a checkpoint are
    /// expected to have already verified the fingerprint matches before
    /// calling this.
    pub async fn set_offset(&mut self, offset: u64) {
        assert_ne!(self.fingerprint, 0, "cannot set offset when no fingerprint is set");

        let file = self.file.as_mut().expect("set_offset requires an open file");
        if let Err(error) = file.seek(std::io::SeekFrom::Start(offset)).await {
            fatal!(
                message = "cannot seek in log file",
                path = %self.path.display(),
                offset,
                %error
            );
        }

        self.offset = offset;
        self.commit_inode = self.inode;
        self.commit_fingerprint = self.fingerprint;
        self.commit_offset = offset;
    }

    /// Close any existing handle, open the symlink target fresh, and reset
    /// offset/fingerprint tracking. Returns `false` if the target doesn't
    /// exist (a race with the container runtime or an in-progress rotation).
    pub async fn try_reopen(&mut self) -> bool {
        let (file, inode) = match open_file_with_inode(&self.path).await {
            Some(pair) => pair,
            None => return false,
        };

        self.close();

        self.file = Some(file);
        self.fingerprint = 0;
        self.inode = inode;
        self.offset = 0;

        true
    }

    pub fn close(&mut self) {
        self.file = None;
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            inode: self.commit_inode,
            fingerprint: self.commit_fingerprint,
            offset: self.commit_offset,
        }
    }
}

pub(crate) async fn open_file_with_inode(path: &Path) -> Option<(tokio::fs::File, u64)> {
    let file = tokio::fs::File::open(path).await.ok()?;
    let metadata = file.metadata().await.ok()?;
    Some((file, metadata.ino()))
}

/// Fingerprint the first line of `file`, reading from its current position
/// (expected to be the start of the file). Mirrors the `calc_fingerprint`
/// call `add_line` makes on the first line of a fresh read, so the result is
/// directly comparable against a previously persisted fingerprint.
///
/// Returns `None` if the file doesn't have a complete first line yet (empty,
/// or its only content so far is an unterminated partial line) — there's not
/// enough information to confirm or rule out anything, so the caller should
/// fall back to trusting whatever checkpoint it has.
///
/// Leaves the file's cursor wherever the read left it; callers that go on to
/// seek always do so with an absolute offset, so the cursor position here is
/// not load-bearing.
pub(crate) async fn first_line_fingerprint(file: &mut tokio::fs::File) -> Option<u64> {
    use crate::collector::fingerprint::MAX_FINGERPRINT_DATA_LEN;

    let mut buf = vec![0u8; MAX_FINGERPRINT_DATA_LEN];
    let mut len = 0usize;

    while len < buf.len() {
        let n = file.read(&mut buf[len..]).await.ok()?;
        if n == 0 {
            break;
        }
        if let Some(pos) = buf[len..len + n].iter().position(|&b| b == b'\n') {
            return Some(calc_fingerprint(&buf[..len + pos]));
        }
        len += n;
    }

    if len == 0 {
        return None;
    }

    if len == buf.len() {
        // A full fingerprint window read with no newline in it: the line is
        // at least this long, which is all `calc_fingerprint` ever looks at.
        return Some(calc_fingerprint(&buf[..len]));
    }

    // Fewer than a full window and no newline: the first line is still being
    // written.
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{self, GateCapacities};

    struct CollectLines(Vec<Vec<u8>>);

    impl LineProcessor for CollectLines {
        fn try_add_line(&mut self, line: &[u8]) -> bool {
            self.0.push(line.to_vec());
            true
        }

        fn must_close(&mut self) {}
    }

    fn ensure_gates() {
        concurrency::init(GateCapacities { read: 4, process: 4 });
    }

    #[tokio::test]
    async fn reads_complete_lines_split_across_reads() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.log");
        tokio::fs::write(&path, b"line one\nline two\npartial").await.unwrap();

        let mut lf = LogFile::new(&path);
        let (_tx, mut rx) = watch::channel(false);
        let mut proc = CollectLines(Vec::new());

        let read_something = lf.read_lines(&mut rx, &mut proc).await;
        assert!(read_something);
        assert_eq!(proc.0, vec![b"line one".to_vec(), b"line two".to_vec()]);
        assert_eq!(lf.tail, b"partial");
    }

    #[tokio::test]
    async fn status_reports_deleted_when_symlink_gone() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.log");
        tokio::fs::write(&path, b"hello\n").await.unwrap();

        let mut lf = LogFile::new(&path);
        lf.try_reopen().await;
        tokio::fs::remove_file(&path).await.unwrap();

        assert_eq!(lf.status().await, LogFileStatus::Deleted);
    }

    #[tokio::test]
    async fn status_reports_rotated_on_new_nonempty_inode() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.log");
        tokio::fs::write(&path, b"hello\n").await.unwrap();

        let mut lf = LogFile::new(&path);
        lf.try_reopen().await;

        tokio::fs::remove_file(&path).await.unwrap();
        tokio::fs::write(&path, b"new file contents\n").await.unwrap();

        assert_eq!(lf.status().await, LogFileStatus::Rotated);
    }

    #[tokio::test]
    async fn oversized_line_is_dropped_and_offset_advances() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.log");

        let huge = vec![b'a'; MAX_LOG_LINE_SIZE + 1];
        let mut contents = huge.clone();
        contents.push(b'\n');
        contents.extend_from_slice(b"next\n");
        tokio::fs::write(&path, &contents).await.unwrap();

        let mut lf = LogFile::new(&path);
        let (_tx, mut rx) = watch::channel(false);
        let mut proc = CollectLines(Vec::new());

        lf.read_lines(&mut rx, &mut proc).await;
        assert_eq!(proc.0, vec![b"next".to_vec()]);
    }

    #[tokio::test]
    async fn fingerprint_is_set_from_first_line() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("container.log");
        tokio::fs::write(&path, b"first\nsecond\n").await.unwrap();

        let mut lf = LogFile::new(&path);
        let (_tx, mut rx) = watch::channel(false);
        let mut proc = CollectLines(Vec::new());
        lf.read_lines(&mut rx, &mut proc).await;

        assert_ne!(lf.fingerprint(), 0);
    }
}
