//! Locked tasks: a named unit of work guarded by the marker store
//!
//! Per status key the lifecycle is
//!
//! ```text
//! ABSENT ──acquire──▶ PENDING ──action ok──▶ DONE (terminal)
//!                        │
//!                        └──action false/err/panic──▶ ABSENT (retry)
//! ```
//!
//! plus the wall-clock driven `stale PENDING ──▶ ABSENT` eviction performed
//! by [`StatusLockStore::try_acquire`].

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::{StoreResult, TaskError, TaskResult};
use super::store::{AcquireResult, StatusLockStore};

/// User action wrapped by a [`LockedTask`].
///
/// Returns `Ok(true)` on success and `Ok(false)` when the work must be
/// retried later. The token is cancelled when the executor's watchdog
/// interrupts the attempt; long-running actions should poll it.
pub type TaskAction = dyn Fn(&CancellationToken) -> anyhow::Result<bool> + Send + Sync;

/// A unit of work that runs at most once per status key across all workers
#[derive(Clone)]
pub struct LockedTask {
    key: String,
    description: String,
    store: Arc<StatusLockStore>,
    action: Arc<TaskAction>,
}

impl LockedTask {
    /// Create a task with an explicit log description
    pub fn new<F>(
        store: Arc<StatusLockStore>,
        status_key: impl Into<String>,
        description: impl Into<String>,
        action: F,
    ) -> Self
    where
        F: Fn(&CancellationToken) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        Self {
            key: status_key.into(),
            description: description.into(),
            store,
            action: Arc::new(action),
        }
    }

    /// Create a task whose description is the last component of its key
    pub fn keyed<F>(store: Arc<StatusLockStore>, status_key: impl Into<String>, action: F) -> Self
    where
        F: Fn(&CancellationToken) -> anyhow::Result<bool> + Send + Sync + 'static,
    {
        let key = status_key.into();
        let description = Path::new(&key)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| key.clone());
        Self::new(store, key, description, action)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Whether this task's DONE marker exists
    pub fn is_done(&self) -> bool {
        self.store.is_done(&self.key)
    }

    /// Create the marker directories for this task
    pub fn prepare(&self) -> StoreResult<()> {
        self.store.prepare(&self.key)
    }

    /// Attempt the task once.
    ///
    /// `Ok(true)`: done (now or previously). `Ok(false)`: another worker owns
    /// it or the action asked for a retry. `Err`: the action failed; markers
    /// were cleared so a later pass can retry.
    pub fn execute(&self, cancel: &CancellationToken) -> TaskResult<bool> {
        if self.store.is_done(&self.key) {
            debug!(key = %self.key, "Already done");
            return Ok(true);
        }

        match self.store.try_acquire(&self.key) {
            AcquireResult::AlreadyDone => return Ok(true),
            AcquireResult::Busy => return Ok(false),
            AcquireResult::Acquired => {}
        }

        let mut claim = Claim {
            store: &self.store,
            key: &self.key,
            success: false,
        };

        info!("Attempt: {}", self.description);

        match (self.action)(cancel) {
            Ok(true) => {
                self.store
                    .mark_done(&self.key)
                    .map_err(|source| TaskError::MarkDone {
                        description: self.description.clone(),
                        source,
                    })?;
                claim.success = true;
                drop(claim);
                info!("Success: {}", self.description);
                Ok(true)
            }
            Ok(false) => {
                debug!("Retry required: {}", self.description);
                Ok(false)
            }
            Err(source) => {
                debug!(error = %source, "Exception occurred: {}", self.description);
                Err(TaskError::Action {
                    description: self.description.clone(),
                    source,
                })
            }
        }
    }
}

impl fmt::Debug for LockedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockedTask")
            .field("key", &self.key)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Releases an acquired key on every exit path, including unwinding
struct Claim<'a> {
    store: &'a StatusLockStore,
    key: &'a str,
    success: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.store.release(self.key, self.success);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::TaskStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn store(root: &Path) -> Arc<StatusLockStore> {
        Arc::new(StatusLockStore::new(
            root.join("Locks"),
            root.join("Status"),
            Duration::from_secs(3600),
        ))
    }

    type Fixture = (
        Arc<AtomicUsize>,
        LockedTask,
        Arc<StatusLockStore>,
        tempfile::TempDir,
    );

    fn counting(outcome: Result<bool, &'static str>) -> Fixture {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let task = LockedTask::new(store.clone(), "Stage/unit 1", "Run unit 1", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            outcome.map_err(anyhow::Error::msg)
        });
        (calls, task, store, dir)
    }

    #[test]
    fn test_execute_is_idempotent() {
        let (calls, task, store, _dir) = counting(Ok(true));
        let cancel = CancellationToken::new();

        assert!(task.execute(&cancel).unwrap());
        assert!(task.execute(&cancel).unwrap());

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(task.is_done());
        assert!(!store.lock_path(task.key()).exists());
    }

    #[test]
    fn test_false_result_clears_markers() {
        let (calls, task, store, _dir) = counting(Ok(false));
        let cancel = CancellationToken::new();

        assert!(!task.execute(&cancel).unwrap());
        assert_eq!(store.status(task.key()), TaskStatus::Absent);
        assert!(!store.lock_path(task.key()).exists());

        // A retry runs the action again
        assert!(!task.execute(&cancel).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_error_clears_markers_and_propagates() {
        let (_calls, task, store, _dir) = counting(Err("learner crashed"));
        let cancel = CancellationToken::new();

        let err = task.execute(&cancel).unwrap_err();
        assert!(matches!(err, TaskError::Action { .. }));
        assert!(err.to_string().contains("learner crashed"));
        assert_eq!(store.status(task.key()), TaskStatus::Absent);
    }

    #[test]
    fn test_busy_key_is_not_run() {
        let (calls, task, store, _dir) = counting(Ok(true));
        let cancel = CancellationToken::new();

        assert_eq!(store.try_acquire(task.key()), AcquireResult::Acquired);
        assert!(!task.execute(&cancel).unwrap());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_panic_releases_claim() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let task = LockedTask::keyed(store.clone(), "Stage/panics", |_| panic!("boom"));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            task.execute(&CancellationToken::new())
        }));

        assert!(result.is_err());
        assert_eq!(task.description(), "panics");
        assert_eq!(store.status("Stage/panics"), TaskStatus::Absent);
        assert!(!store.lock_path("Stage/panics").exists());
    }
}
