//! Owns one reader per tracked log-file path, life-cycles readers against
//! the checkpoint store, and reconciles against stale checkpoints. Grounded
//! on `fileCollector` in `file_collector.go`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use dashmap::DashSet;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::backoff::BackoffTimer;
use crate::collector::checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreError};
use crate::collector::log_file::{first_line_fingerprint, open_file_with_inode, LogFile, LogFileStatus};
use crate::collector::processor::LineProcessor;
use crate::fatal;

pub type CommonFields = Arc<Vec<(String, String)>>;
pub type ExcludeFilter = Arc<dyn Fn(&[(String, String)]) -> bool + Send + Sync>;
pub type ProcessorFactory =
    Arc<dyn Fn(CommonFields, &Path) -> Box<dyn LineProcessor> + Send + Sync>;

const BACKOFF_FLOOR: Duration = Duration::from_millis(100);
const BACKOFF_CEILING: Duration = Duration::from_secs(10);

pub struct FileCollector {
    log_files: Arc<DashSet<PathBuf>>,
    exclude_filter: Option<ExcludeFilter>,
    new_processor: ProcessorFactory,
    checkpoints: Arc<CheckpointStore>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl FileCollector {
    pub async fn start(
        checkpoints_path: impl Into<PathBuf>,
        exclude_filter: Option<ExcludeFilter>,
        new_processor: ProcessorFactory,
    ) -> Result<Self, CheckpointStoreError> {
        let checkpoints = Arc::new(CheckpointStore::start(checkpoints_path).await?);
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(FileCollector {
            log_files: Arc::new(DashSet::new()),
            exclude_filter,
            new_processor,
            checkpoints,
            stop_tx,
            stop_rx,
            tasks: StdMutex::new(Vec::new()),
        })
    }

    /// Idempotent: a path already tracked is a no-op. Otherwise spawns a
    /// worker that owns the reader for the rest of the file's lifetime.
    pub fn start_read(&self, path: PathBuf, common_fields: CommonFields) {
        if !self.log_files.insert(path.clone()) {
            return;
        }

        let log_files = Arc::clone(&self.log_files);
        let checkpoints = Arc::clone(&self.checkpoints);
        let new_processor = Arc::clone(&self.new_processor);
        let exclude_filter = self.exclude_filter.clone();
        let mut stop_rx = self.stop_rx.clone();

        let handle = tokio::spawn(async move {
            let lf = open_log_file(&checkpoints, &path).await;
            run_tail_loop(
                lf,
                common_fields,
                log_files,
                checkpoints,
                new_processor,
                exclude_filter,
                &mut stop_rx,
            )
            .await;
        });

        self.tasks.lock().expect("tasks lock poisoned").push(handle);
    }

    /// Delete the checkpoint for every path that isn't currently tracked.
    /// Called once, after the initial pod list has seeded every reader, so
    /// checkpoints for containers that vanished while we were down don't
    /// accumulate forever.
    pub fn cleanup_checkpoints(&self) {
        let all = self.checkpoints.get_all();
        let unused: Vec<PathBuf> = all
            .into_iter()
            .filter(|(path, _)| !self.log_files.contains(path))
            .map(|(path, _)| path)
            .collect();

        if unused.is_empty() {
            return;
        }

        let example = unused[0].clone();
        let count = unused.len();
        for path in &unused {
            self.checkpoints.delete(path);
        }

        warn!(
            message = "deleted checkpoints for log files that no longer exist",
            count,
            example = %example.display(),
        );
    }

    /// Signal every worker to stop, wait for them, then flush and stop the
    /// checkpoint store.
    pub async fn stop(&self) {
        let _ = self.stop_tx.send(true);

        let tasks: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.tasks.lock().expect("tasks lock poisoned"));
        for task in tasks {
            if let Err(error) = task.await {
                warn!(message = "file reader task panicked", %error);
            }
        }

        self.checkpoints.stop().await;
    }
}

async fn open_log_file(checkpoints: &CheckpointStore, path: &Path) -> LogFile {
    let Some(cp) = checkpoints.get(path) else {
        return LogFile::new(path);
    };

    match try_resume_from_checkpoint(path, cp).await {
        Some(lf) => lf,
        None => {
            checkpoints.delete(path);
            LogFile::new(path)
        }
    }
}

async fn try_resume_from_checkpoint(path: &Path, cp: Checkpoint) -> Option<LogFile> {
    let (mut file, mut inode) = match open_file_with_inode(path).await {
        Some(pair) => pair,
        None => {
            warn!(
                message = "log file was deleted before being fully read; expected if its pod was deleted while we were starting",
                path = %path.display(),
            );
            return None;
        }
    };

    if inode != cp.inode {
        drop(file);
        match find_renamed_file(path, cp.inode).await {
            Some(pair) => (file, inode) = pair,
            None => {
                warn!(
                    message = "log file was rotated before being fully read; expected when rotation outpaces downtime",
                    path = %path.display(),
                );
                return None;
            }
        }
    }

    // An inode match alone isn't proof this is the same file we checkpointed;
    // operating systems reuse inodes across restarts. Recompute the first
    // line's fingerprint and compare before trusting `cp.offset`.
    match first_line_fingerprint(&mut file).await {
        Some(actual) if actual != cp.fingerprint => {
            warn!(
                message = "log file's inode was reused with different content since the last checkpoint; discarding stale checkpoint",
                path = %path.display(),
                expected_fingerprint = cp.fingerprint,
                actual_fingerprint = actual,
            );
            return None;
        }
        _ => {}
    }

    let mut lf = LogFile::from_file(file, cp.fingerprint, path.to_path_buf())
        .await
        .unwrap_or_else(|error| {
            fatal!(message = "cannot stat resumed log file", path = %path.display(), %error)
        });
    lf.set_offset(cp.offset).await;
    Some(lf)
}

/// Scan the symlink target's directory for a non-`.gz` file with `inode`.
/// Kubelet renames the previous file with a timestamp suffix on rotation
/// rather than deleting it outright; this recovers the renamed sibling so a
/// restart doesn't lose the tail of the previous file.
async fn find_renamed_file(log_path: &Path, inode: u64) -> Option<(tokio::fs::File, u64)> {
    let actual_path = tokio::fs::read_link(log_path).await.unwrap_or_else(|_| log_path.to_path_buf());
    let dir = actual_path.parent()?.to_path_buf();

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
        Err(error) => fatal!(message = "cannot read directory", dir = %dir.display(), %error),
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_type = match entry.file_type().await {
            Ok(ft) => ft,
            Err(_) => continue,
        };
        if file_type.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().ends_with(".gz") {
            continue;
        }

        let candidate = entry.path();
        let Some((file, candidate_inode)) = open_file_with_inode(&candidate).await else {
            continue;
        };
        if candidate_inode == inode {
            return Some((file, candidate_inode));
        }
    }

    None
}

#[allow(clippy::too_many_arguments)]
async fn run_tail_loop(
    mut lf: LogFile,
    common_fields: CommonFields,
    log_files: Arc<DashSet<PathBuf>>,
    checkpoints: Arc<CheckpointStore>,
    new_processor: ProcessorFactory,
    exclude_filter: Option<ExcludeFilter>,
    stop_rx: &mut watch::Receiver<bool>,
) {
    let path = lf.path().to_path_buf();

    if let Some(filter) = &exclude_filter {
        if filter(&common_fields) {
            forget_file(&checkpoints, &log_files, &path);
            return;
        }
    }

    let mut backoff = BackoffTimer::new(BACKOFF_FLOOR, BACKOFF_CEILING);
    let mut processor = new_processor(Arc::clone(&common_fields), &path);

    loop {
        if *stop_rx.borrow() {
            break;
        }

        if lf.read_lines(stop_rx, processor.as_mut()).await {
            checkpoints.set(path.clone(), lf.checkpoint());
            backoff.reset();
            backoff.wait(stop_rx).await;
            continue;
        }

        match lf.status().await {
            LogFileStatus::NotRotated => {
                backoff.wait(stop_rx).await;
            }
            LogFileStatus::Rotated => {
                // Flush whatever is left in the old file. This must not be
                // interrupted by shutdown or the unread suffix is lost.
                let (_never_tx, mut never_rx) = watch::channel(false);
                backoff.reset();
                backoff.wait_uncancellable().await;

                if lf.read_lines(&mut never_rx, processor.as_mut()).await {
                    backoff.wait_uncancellable().await;
                    if lf.read_lines(&mut never_rx, processor.as_mut()).await {
                        fatal!(message = "log file was appended after rotation", path = %path.display());
                    }
                }

                if lf.try_reopen().await {
                    checkpoints.set(path.clone(), lf.checkpoint());
                } else {
                    backoff.wait(stop_rx).await;
                }
            }
            LogFileStatus::Deleted => {
                forget_file(&checkpoints, &log_files, &path);
                processor.must_close();
                lf.close();
                return;
            }
        }
    }

    processor.must_close();
    lf.close();
}

fn forget_file(checkpoints: &CheckpointStore, log_files: &DashSet<PathBuf>, path: &Path) {
    checkpoints.delete(path);
    log_files.remove(path);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::fingerprint::calc_fingerprint;
    use crate::collector::processor::{ContainerLogLineProcessor, Record, RecordSink};
    use crate::concurrency::{self, GateCapacities};
    use std::os::unix::fs::MetadataExt;
    use std::sync::Mutex as StdSyncMutex;
    use tokio::time::{sleep, timeout};

    struct CollectSink(Arc<StdSyncMutex<Vec<String>>>);

    impl RecordSink for CollectSink {
        fn emit(&self, record: Record) {
            self.0.lock().unwrap().push(record.msg);
        }
    }

    fn ensure_gates() {
        concurrency::init(GateCapacities { read: 4, process: 4 });
    }

    fn processor_factory(sink: Arc<StdSyncMutex<Vec<String>>>) -> ProcessorFactory {
        Arc::new(move |common_fields, path| {
            let sink: Arc<dyn RecordSink> = Arc::new(CollectSink(Arc::clone(&sink)));
            Box::new(ContainerLogLineProcessor::new(
                common_fields,
                3,
                sink,
                path.to_string_lossy().to_string(),
            ))
        })
    }

    #[tokio::test]
    async fn reads_existing_file_from_the_start() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        let checkpoints_path = dir.path().join("checkpoints.json");
        tokio::fs::write(
            &log_path,
            b"2025-10-16T15:37:36.1Z stdout F line1\n2025-10-16T15:37:36.2Z stdout F line2\n",
        )
        .await
        .unwrap();

        let messages = Arc::new(StdSyncMutex::new(Vec::new()));
        let fc = FileCollector::start(&checkpoints_path, None, processor_factory(Arc::clone(&messages)))
            .await
            .unwrap();

        fc.start_read(log_path.clone(), Arc::new(vec![]));

        timeout(Duration::from_secs(2), async {
            loop {
                if messages.lock().unwrap().len() >= 2 {
                    break;
                }
                sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("lines were not delivered in time");

        fc.stop().await;
        assert_eq!(&*messages.lock().unwrap(), &["line1".to_string(), "line2".to_string()]);
    }

    #[tokio::test]
    async fn start_read_is_idempotent() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        let checkpoints_path = dir.path().join("checkpoints.json");
        tokio::fs::write(&log_path, b"").await.unwrap();

        let messages = Arc::new(StdSyncMutex::new(Vec::new()));
        let fc = FileCollector::start(&checkpoints_path, None, processor_factory(messages))
            .await
            .unwrap();

        fc.start_read(log_path.clone(), Arc::new(vec![]));
        fc.start_read(log_path.clone(), Arc::new(vec![]));
        assert_eq!(fc.tasks.lock().unwrap().len(), 1);

        fc.stop().await;
    }

    #[tokio::test]
    async fn cleanup_checkpoints_drops_untracked_entries() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let checkpoints_path = dir.path().join("checkpoints.json");

        let messages = Arc::new(StdSyncMutex::new(Vec::new()));
        let fc = FileCollector::start(&checkpoints_path, None, processor_factory(messages))
            .await
            .unwrap();

        fc.checkpoints.set(
            PathBuf::from("/var/log/containers/gone.log"),
            Checkpoint {
                inode: 1,
                fingerprint: 2,
                offset: 3,
            },
        );
        fc.cleanup_checkpoints();
        assert!(fc.checkpoints.get(Path::new("/var/log/containers/gone.log")).is_none());

        fc.stop().await;
    }

    #[tokio::test]
    async fn try_resume_from_checkpoint_rejects_stale_fingerprint_on_inode_reuse() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        tokio::fs::write(&log_path, b"2025-10-16T15:37:36.1Z stdout F line1\n").await.unwrap();
        let inode = tokio::fs::metadata(&log_path).await.unwrap().ino();

        // Same inode as the checkpoint, but a fingerprint that doesn't match
        // this file's actual first line — as if the inode were reused by an
        // unrelated file across a restart.
        let cp = Checkpoint {
            inode,
            fingerprint: 0xdead_beef,
            offset: 10,
        };

        let resumed = try_resume_from_checkpoint(&log_path, cp).await;
        assert!(
            resumed.is_none(),
            "a fingerprint mismatch on a matching inode must be treated as a stale checkpoint"
        );
    }

    #[tokio::test]
    async fn try_resume_from_checkpoint_honors_matching_fingerprint() {
        ensure_gates();
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("a.log");
        let line1 = b"2025-10-16T15:37:36.1Z stdout F line1\n";
        tokio::fs::write(&log_path, line1).await.unwrap();
        let inode = tokio::fs::metadata(&log_path).await.unwrap().ino();

        let cp = Checkpoint {
            inode,
            fingerprint: calc_fingerprint(&line1[..line1.len() - 1]),
            offset: line1.len() as u64,
        };

        let resumed = try_resume_from_checkpoint(&log_path, cp).await;
        let lf = resumed.expect("a matching fingerprint must resume from the checkpoint");
        assert_eq!(lf.checkpoint().offset, line1.len() as u64);
    }
}
