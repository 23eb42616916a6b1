//! Durable mapping from log-file path to last-committed read offset.
//!
//! Grounded on `checkpointsDB` (`file_collector.go`) for the operation set
//! (`get`/`set`/`delete`/`getAll`/`stop`) and on `Checkpointer`/
//! `CheckpointsView` (`lib/file-source/src/checkpointer.rs`) for the
//! concurrent-map-plus-debounced-disk-writer shape: a `DashMap` is the
//! source of truth in memory, and a background task snapshots it to disk
//! on a short interval via atomic tmp-file-then-rename, rather than
//! fsync'ing on every mutation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// A checkpoint identifies the concrete file a stable symlink path pointed
/// to at commit time, and the first unread byte within it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checkpoint {
    pub inode: u64,
    pub fingerprint: u64,
    pub offset: u64,
}

const PERSIST_INTERVAL: Duration = Duration::from_millis(500);
const TMP_FILE_SUFFIX: &str = ".tmp";

#[derive(Debug, Snafu)]
pub enum CheckpointStoreError {
    #[snafu(display("cannot read checkpoints file {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("checkpoints file {} contains malformed JSON: {source}", path.display()))]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

pub struct CheckpointStore {
    path: PathBuf,
    checkpoints: Arc<DashMap<PathBuf, Checkpoint>>,
    dirty: Arc<AtomicBool>,
    notify: Arc<Notify>,
    stop: Arc<Notify>,
    persist_task: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointStore {
    /// Load the persisted checkpoints file (tolerating a missing file, but
    /// not a malformed one) and start the background persistence task.
    pub async fn start(path: impl Into<PathBuf>) -> Result<Self, CheckpointStoreError> {
        let path = path.into();
        let checkpoints = Arc::new(load(&path)?);

        let dirty = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let stop = Arc::new(Notify::new());

        let task = {
            let checkpoints = Arc::clone(&checkpoints);
            let dirty = Arc::clone(&dirty);
            let notify = Arc::clone(&notify);
            let stop = Arc::clone(&stop);
            let path = path.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(PERSIST_INTERVAL) => {}
                        _ = notify.notified() => {}
                        _ = stop.notified() => {
                            flush_if_dirty(&path, &checkpoints, &dirty);
                            return;
                        }
                    }
                    flush_if_dirty(&path, &checkpoints, &dirty);
                }
            })
        };

        Ok(CheckpointStore {
            path,
            checkpoints,
            dirty,
            notify,
            stop,
            persist_task: Mutex::new(Some(task)),
        })
    }

    pub fn get(&self, path: &Path) -> Option<Checkpoint> {
        self.checkpoints.get(path).map(|r| *r.value())
    }

    pub fn set(&self, path: PathBuf, checkpoint: Checkpoint) {
        self.checkpoints.insert(path, checkpoint);
        self.mark_dirty();
    }

    pub fn delete(&self, path: &Path) {
        self.checkpoints.remove(path);
        self.mark_dirty();
    }

    pub fn get_all(&self) -> Vec<(PathBuf, Checkpoint)> {
        self.checkpoints
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Flush any pending mutations and stop the background task. All
    /// persistence is guaranteed complete once this returns. Safe to call
    /// more than once; only the first call has any effect.
    pub async fn stop(&self) {
        self.stop.notify_one();
        if let Some(task) = self.persist_task.lock().await.take() {
            if let Err(error) = task.await {
                error!(message = "checkpoint persistence task panicked", %error);
            }
        }
    }
}

fn flush_if_dirty(path: &Path, checkpoints: &DashMap<PathBuf, Checkpoint>, dirty: &AtomicBool) {
    if !dirty.swap(false, Ordering::SeqCst) {
        return;
    }
    if let Err(error) = persist(path, checkpoints) {
        warn!(message = "failed to persist checkpoints file", %error, path = %path.display());
        // Leave `dirty` cleared regardless: the next mutation will re-mark
        // it and retry on the following interval tick.
    }
}

fn persist(path: &Path, checkpoints: &DashMap<PathBuf, Checkpoint>) -> std::io::Result<()> {
    let snapshot: BTreeMap<PathBuf, Checkpoint> = checkpoints
        .iter()
        .map(|e| (e.key().clone(), *e.value()))
        .collect();

    let tmp_path = path.with_extension(TMP_FILE_SUFFIX.trim_start_matches('.'));
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    {
        let file = std::fs::File::create(&tmp_path)?;
        let mut writer = std::io::BufWriter::new(file);
        serde_json::to_writer(&mut writer, &snapshot)?;
        use std::io::Write;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

fn load(path: &Path) -> Result<DashMap<PathBuf, Checkpoint>, CheckpointStoreError> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(DashMap::new()),
        Err(error) => {
            return Err(error).with_context(|_| ReadSnafu { path: path.to_path_buf() })
        }
    };
    if data.is_empty() {
        return Ok(DashMap::new());
    }
    let map: BTreeMap<PathBuf, Checkpoint> =
        serde_json::from_slice(&data).with_context(|_| ParseSnafu { path: path.to_path_buf() })?;
    Ok(map.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cp(inode: u64, offset: u64) -> Checkpoint {
        Checkpoint {
            inode,
            fingerprint: 42,
            offset,
        }
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");

        let store = CheckpointStore::start(&path).await.unwrap();
        store.set(PathBuf::from("/var/log/a.log"), cp(1, 10));
        store.set(PathBuf::from("/var/log/b.log"), cp(2, 20));
        store.stop().await;

        let store2 = CheckpointStore::start(&path).await.unwrap();
        assert_eq!(
            store2.get(Path::new("/var/log/a.log")),
            Some(cp(1, 10))
        );
        assert_eq!(
            store2.get(Path::new("/var/log/b.log")),
            Some(cp(2, 20))
        );
        store2.stop().await;
    }

    #[tokio::test]
    async fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("does-not-exist.json");
        let store = CheckpointStore::start(&path).await.unwrap();
        assert!(store.get_all().is_empty());
        store.stop().await;
    }

    #[tokio::test]
    async fn malformed_file_fails_startup() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        std::fs::write(&path, b"not json").unwrap();
        assert!(CheckpointStore::start(&path).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints.json");
        let store = CheckpointStore::start(&path).await.unwrap();
        store.set(PathBuf::from("/var/log/a.log"), cp(1, 10));
        store.delete(Path::new("/var/log/a.log"));
        assert_eq!(store.get(Path::new("/var/log/a.log")), None);
        store.stop().await;
    }
}
