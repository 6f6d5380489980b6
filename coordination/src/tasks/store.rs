//! File-system backed status and lock markers
//!
//! Two parallel directory trees are keyed by the same relative status key:
//!
//! ```text
//! <locks>/<key>    exists while some worker is actively running the task
//! <status>/<key>   empty = PENDING, "DONE" = completed (survives restarts)
//! ```
//!
//! Creating a marker with `create_new` is the only atomic primitive relied
//! upon, so the protocol works across threads, processes and machines that
//! share the file system.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::error::{StoreError, StoreResult};

/// Content of a status marker for a completed task
pub const DONE_STATUS: &str = "DONE";

/// Outcome of an attempt to claim a status key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquireResult {
    /// The task already completed; nothing was touched
    AlreadyDone,
    /// This caller now owns the key and must `release` it
    Acquired,
    /// Someone else owns the key, or the claim could not be made safely
    Busy,
}

/// Persisted state of a status key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Absent,
    Pending,
    Done,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Pending => write!(f, "pending"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// One status marker found on disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub key: String,
    pub status: TaskStatus,
    pub modified: DateTime<Utc>,
}

/// Marker store providing at-most-one-active-executor per status key
#[derive(Debug, Clone)]
pub struct StatusLockStore {
    locks_dir: PathBuf,
    status_dir: PathBuf,
    stale_after: Duration,
}

impl StatusLockStore {
    /// Create a store over the given lock and status trees.
    ///
    /// Markers older than `stale_after` are presumed to belong to a crashed
    /// worker and become eligible for eviction.
    pub fn new(
        locks_dir: impl Into<PathBuf>,
        status_dir: impl Into<PathBuf>,
        stale_after: Duration,
    ) -> Self {
        Self {
            locks_dir: locks_dir.into(),
            status_dir: status_dir.into(),
            stale_after,
        }
    }

    pub fn locks_dir(&self) -> &Path {
        &self.locks_dir
    }

    pub fn status_dir(&self) -> &Path {
        &self.status_dir
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Path of the lock marker for a key (spaces become underscores)
    pub fn lock_path(&self, key: &str) -> PathBuf {
        self.locks_dir.join(marker_name(key))
    }

    /// Path of the status marker for a key (spaces become underscores)
    pub fn status_path(&self, key: &str) -> PathBuf {
        self.status_dir.join(marker_name(key))
    }

    /// Read the persisted state of a key without side effects
    pub fn status(&self, key: &str) -> TaskStatus {
        let path = self.status_path(key);
        if !path.exists() {
            return TaskStatus::Absent;
        }
        if read_status(&path) == DONE_STATUS {
            TaskStatus::Done
        } else {
            TaskStatus::Pending
        }
    }

    /// True iff a DONE marker exists for the key
    pub fn is_done(&self, key: &str) -> bool {
        self.status(key) == TaskStatus::Done
    }

    /// True iff the marker at `path` exists and is older than the threshold
    pub fn is_stale(&self, path: &Path) -> bool {
        marker_age(path).is_some_and(|age| age > self.stale_after)
    }

    /// Create the parent directories both markers for `key` will live in
    pub fn prepare(&self, key: &str) -> StoreResult<()> {
        for path in [self.lock_path(key), self.status_path(key)] {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
            }
        }
        Ok(())
    }

    /// Try to claim `key` for this caller.
    ///
    /// A stale PENDING marker is deleted but the call still reports `Busy`;
    /// the claim is left to the next attempt.
    pub fn try_acquire(&self, key: &str) -> AcquireResult {
        let status_path = self.status_path(key);
        let lock_path = self.lock_path(key);

        match self.status(key) {
            TaskStatus::Done => {
                debug!(key, "Status is DONE");
                return AcquireResult::AlreadyDone;
            }
            TaskStatus::Pending => {
                if self.is_stale(&status_path) {
                    debug!(key, path = %status_path.display(), "PENDING status is stale, deleting it");
                    match fs::remove_file(&status_path) {
                        Ok(()) => debug!(key, "Stale PENDING status was deleted"),
                        Err(e) => warn!(key, error = %e, "Stale PENDING status could not be deleted"),
                    }
                } else {
                    debug!(key, "Status is PENDING");
                }
                return AcquireResult::Busy;
            }
            TaskStatus::Absent => debug!(key, "No status marker exists"),
        }

        if !self.clear_stale_lock(key, &lock_path) {
            return AcquireResult::Busy;
        }

        if let Err(e) = create_marker(&lock_path) {
            debug!(key, error = %e, "Lock marker could not be created, will retry later");
            return AcquireResult::Busy;
        }
        debug!(key, path = %lock_path.display(), "Lock marker created");

        if let Err(e) = create_marker(&status_path) {
            debug!(key, error = %e, "PENDING status could not be set");
            remove_marker(&lock_path);
            return AcquireResult::Busy;
        }
        debug!(key, "PENDING status set");

        AcquireResult::Acquired
    }

    /// Returns true when no fresh lock marker blocks the key
    fn clear_stale_lock(&self, key: &str, lock_path: &Path) -> bool {
        if !lock_path.exists() {
            return true;
        }
        if !self.is_stale(lock_path) {
            debug!(key, "Lock marker exists and is not stale");
            return false;
        }
        match fs::remove_file(lock_path) {
            Ok(()) => {
                debug!(key, "Stale lock marker was deleted");
                true
            }
            Err(e) => {
                warn!(key, error = %e, "Stale lock marker could not be deleted");
                false
            }
        }
    }

    /// Convert the PENDING status marker into a durable DONE marker
    pub fn mark_done(&self, key: &str) -> StoreResult<()> {
        let path = self.status_path(key);
        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| match e.kind() {
                ErrorKind::NotFound => StoreError::NotAcquired {
                    key: key.to_string(),
                },
                _ => StoreError::io(&path, e),
            })?;

        file.write_all(DONE_STATUS.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&path, e))?;

        debug!(key, "{} status set", DONE_STATUS);
        Ok(())
    }

    /// Drop the lock marker; on failure also clear the PENDING status so a
    /// later attempt starts clean
    pub fn release(&self, key: &str, success: bool) {
        remove_marker(&self.lock_path(key));
        if !success {
            remove_marker(&self.status_path(key));
        }
        debug!(key, success, "Released");
    }

    /// List every status marker under the status tree, sorted by key
    pub fn list(&self) -> StoreResult<Vec<StatusEntry>> {
        if !self.status_dir.exists() {
            return Ok(Vec::new());
        }

        let mut entries = Vec::new();
        let walker = WalkBuilder::new(&self.status_dir)
            .standard_filters(false)
            .build();

        for entry in walker {
            let entry = entry.map_err(|e| StoreError::Walk(e.to_string()))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&self.status_dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");

            let modified = fs::metadata(path)
                .and_then(|m| m.modified())
                .map_err(|e| StoreError::io(path, e))?;

            let status = if read_status(path) == DONE_STATUS {
                TaskStatus::Done
            } else {
                TaskStatus::Pending
            };

            entries.push(StatusEntry {
                key,
                status,
                modified: DateTime::<Utc>::from(modified),
            });
        }

        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }

    /// Delete both marker trees
    pub fn reset(&self) -> StoreResult<()> {
        for dir in [&self.locks_dir, &self.status_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => debug!(dir = %dir.display(), "Removed marker tree"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(dir, e)),
            }
        }
        Ok(())
    }
}

fn marker_name(key: &str) -> String {
    key.trim_start_matches('/').replace(' ', "_")
}

/// Atomically create an empty marker, creating parent directories first
fn create_marker(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map(|_| ())
}

fn remove_marker(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Marker could not be deleted"),
    }
}

/// Unreadable status markers read as PENDING
fn read_status(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(content) => content.trim().to_string(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "Error reading status marker");
            String::new()
        }
    }
}

fn marker_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}
