//! Occupancy store - live counter plus hourly snapshot history
//!
//! `FileStore` keeps two files in its directory:
//! - `count.json` - single-row counter `{"id":1,"current_count":N}`,
//!   replaced atomically (write temp file, rename)
//! - `snapshots.jsonl` - one `Snapshot` per line, append-only except for
//!   retention purges
//!
//! The counter never goes below zero: decrementing an empty room is a no-op
//! that still succeeds and returns 0.

use crate::domain::types::Snapshot;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, TimeDelta};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::{debug, info, warn};

const COUNT_FILE: &str = "count.json";
const SNAPSHOT_FILE: &str = "snapshots.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt counter data in {path}: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// Transient errors are retried; anything else needs an operator
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Unavailable(_) | StoreError::Io(_) => true,
            StoreError::Corrupt { .. } => false,
        }
    }
}

/// Counter and snapshot log shared by the poll loop and the hourly logger.
///
/// Each method is a single atomic operation on the store side.
#[async_trait]
pub trait OccupancyStore: Send + Sync {
    /// Add one person, returning the new count
    async fn increment(&self) -> Result<i64, StoreError>;
    /// Remove one person (floored at zero), returning the new count
    async fn decrement(&self) -> Result<i64, StoreError>;
    async fn get_count(&self) -> Result<i64, StoreError>;
    async fn reset_to_zero(&self) -> Result<(), StoreError>;
    async fn log_snapshot(
        &self,
        timestamp: DateTime<FixedOffset>,
        count: i64,
    ) -> Result<(), StoreError>;
    /// Delete snapshots older than `age`, returning how many were removed
    async fn purge_snapshots_older_than(&self, age: TimeDelta) -> Result<usize, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct CounterRow {
    id: u32,
    current_count: i64,
}

/// File-backed store for a single doorway
pub struct FileStore {
    dir: PathBuf,
    /// Serializes read-modify-write on the counter and snapshot files
    lock: Mutex<()>,
}

impl FileStore {
    /// Open (creating if needed) a store directory
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "store_opened");
        Ok(Self { dir, lock: Mutex::new(()) })
    }

    fn count_path(&self) -> PathBuf {
        self.dir.join(COUNT_FILE)
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join(SNAPSHOT_FILE)
    }

    fn read_count(&self) -> Result<i64, StoreError> {
        let path = self.count_path();
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let row: CounterRow = serde_json::from_str(&content)
            .map_err(|source| StoreError::Corrupt { path: path.display().to_string(), source })?;
        Ok(row.current_count)
    }

    fn write_count(&self, count: i64) -> Result<(), StoreError> {
        let path = self.count_path();
        let tmp = path.with_extension("json.tmp");
        let row = CounterRow { id: 1, current_count: count };
        let json = serde_json::to_string(&row)
            .map_err(|source| StoreError::Corrupt { path: path.display().to_string(), source })?;

        let mut file = fs::File::create(&tmp)?;
        writeln!(file, "{}", json)?;
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        debug!(count = %count, "store_count_written");
        Ok(())
    }

    fn update_count(&self, f: impl FnOnce(i64) -> i64) -> Result<i64, StoreError> {
        let _guard = self.lock.lock();
        let next = f(self.read_count()?);
        self.write_count(next)?;
        Ok(next)
    }

    fn read_snapshots(&self) -> Result<Vec<Snapshot>, StoreError> {
        let file = match fs::File::open(self.snapshot_path()) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Snapshot>(&line) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => {
                    warn!(line = line_no + 1, error = %e, "store_snapshot_line_skipped");
                }
            }
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl OccupancyStore for FileStore {
    async fn increment(&self) -> Result<i64, StoreError> {
        self.update_count(|count| count + 1)
    }

    async fn decrement(&self) -> Result<i64, StoreError> {
        self.update_count(|count| (count - 1).max(0))
    }

    async fn get_count(&self) -> Result<i64, StoreError> {
        let _guard = self.lock.lock();
        self.read_count()
    }

    async fn reset_to_zero(&self) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        self.write_count(0)
    }

    async fn log_snapshot(
        &self,
        timestamp: DateTime<FixedOffset>,
        count: i64,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let snapshot = Snapshot { datetime: timestamp, num_people: count };
        let json = serde_json::to_string(&snapshot).map_err(|source| StoreError::Corrupt {
            path: self.snapshot_path().display().to_string(),
            source,
        })?;

        let mut file = OpenOptions::new().create(true).append(true).open(self.snapshot_path())?;
        writeln!(file, "{}", json)?;
        debug!(count = %count, datetime = %timestamp, "store_snapshot_appended");
        Ok(())
    }

    async fn purge_snapshots_older_than(&self, age: TimeDelta) -> Result<usize, StoreError> {
        let _guard = self.lock.lock();
        let cutoff = Local::now().fixed_offset() - age;
        let snapshots = self.read_snapshots()?;
        let before = snapshots.len();
        let kept: Vec<&Snapshot> = snapshots.iter().filter(|s| s.datetime >= cutoff).collect();
        let removed = before - kept.len();
        if removed == 0 {
            return Ok(0);
        }

        let path = self.snapshot_path();
        let tmp = path.with_extension("jsonl.tmp");
        let mut file = fs::File::create(&tmp)?;
        for snapshot in kept {
            let json = serde_json::to_string(snapshot).map_err(|source| StoreError::Corrupt {
                path: path.display().to_string(),
                source,
            })?;
            writeln!(file, "{}", json)?;
        }
        file.sync_all()?;
        fs::rename(&tmp, &path)?;
        Ok(removed)
    }
}

/// In-memory store with a switch to simulate an unreachable backend
#[derive(Default)]
pub struct MemoryStore {
    count: Mutex<i64>,
    snapshots: Mutex<Vec<Snapshot>>,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with `StoreError::Unavailable` until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().clone()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl OccupancyStore for MemoryStore {
    async fn increment(&self) -> Result<i64, StoreError> {
        self.check()?;
        let mut count = self.count.lock();
        *count += 1;
        Ok(*count)
    }

    async fn decrement(&self) -> Result<i64, StoreError> {
        self.check()?;
        let mut count = self.count.lock();
        *count = (*count - 1).max(0);
        Ok(*count)
    }

    async fn get_count(&self) -> Result<i64, StoreError> {
        self.check()?;
        Ok(*self.count.lock())
    }

    async fn reset_to_zero(&self) -> Result<(), StoreError> {
        self.check()?;
        *self.count.lock() = 0;
        Ok(())
    }

    async fn log_snapshot(
        &self,
        timestamp: DateTime<FixedOffset>,
        count: i64,
    ) -> Result<(), StoreError> {
        self.check()?;
        self.snapshots.lock().push(Snapshot { datetime: timestamp, num_people: count });
        Ok(())
    }

    async fn purge_snapshots_older_than(&self, age: TimeDelta) -> Result<usize, StoreError> {
        self.check()?;
        let cutoff = Local::now().fixed_offset() - age;
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|s| s.datetime >= cutoff);
        Ok(before - snapshots.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn now() -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    #[tokio::test]
    async fn test_file_store_counts() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.get_count().await.unwrap(), 0);
        assert_eq!(store.increment().await.unwrap(), 1);
        assert_eq!(store.increment().await.unwrap(), 2);
        assert_eq!(store.decrement().await.unwrap(), 1);
        assert_eq!(store.get_count().await.unwrap(), 1);

        // Survives reopening
        let reopened = FileStore::open(dir.path()).unwrap();
        assert_eq!(reopened.get_count().await.unwrap(), 1);

        let content = fs::read_to_string(dir.path().join(COUNT_FILE)).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(parsed["id"], 1);
        assert_eq!(parsed["current_count"], 1);
    }

    #[tokio::test]
    async fn test_file_store_decrement_floors_at_zero() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        assert_eq!(store.decrement().await.unwrap(), 0);
        assert_eq!(store.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_store_reset() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.increment().await.unwrap();
        store.increment().await.unwrap();

        store.reset_to_zero().await.unwrap();
        assert_eq!(store.get_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_store_corrupt_counter_is_fatal() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(COUNT_FILE), "not json").unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let err = store.increment().await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_file_store_creates_nested_dir() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested").join("store");
        let store = FileStore::open(&nested).unwrap();
        store.increment().await.unwrap();
        assert!(nested.join(COUNT_FILE).exists());
    }

    #[tokio::test]
    async fn test_file_store_snapshots_and_purge() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();

        let fresh = now();
        store.log_snapshot(fresh - TimeDelta::days(6), 3).await.unwrap();
        store.log_snapshot(fresh - TimeDelta::days(2), 7).await.unwrap();
        store.log_snapshot(fresh, 4).await.unwrap();

        let content = fs::read_to_string(dir.path().join(SNAPSHOT_FILE)).unwrap();
        assert_eq!(content.lines().count(), 3);
        let first: serde_json::Value = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert_eq!(first["num_people"], 3);

        let removed = store.purge_snapshots_older_than(TimeDelta::days(5)).await.unwrap();
        assert_eq!(removed, 1);

        let remaining = store.read_snapshots().unwrap();
        assert_eq!(remaining.iter().map(|s| s.num_people).collect::<Vec<_>>(), vec![7, 4]);

        // Nothing else to purge
        assert_eq!(store.purge_snapshots_older_than(TimeDelta::days(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_file_store_skips_bad_snapshot_lines() {
        let dir = tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.log_snapshot(now(), 2).await.unwrap();

        let path = dir.path().join(SNAPSHOT_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{\"garbage\":true}}").unwrap();

        store.log_snapshot(now(), 5).await.unwrap();
        let snapshots = store.read_snapshots().unwrap();
        assert_eq!(snapshots.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_unavailable() {
        let store = MemoryStore::new();
        store.increment().await.unwrap();

        store.set_unavailable(true);
        let err = store.increment().await.unwrap_err();
        assert!(err.is_transient());
        assert!(store.get_count().await.is_err());

        store.set_unavailable(false);
        assert_eq!(store.get_count().await.unwrap(), 1);
        assert_eq!(store.decrement().await.unwrap(), 0);
        assert_eq!(store.decrement().await.unwrap(), 0);
    }
}
