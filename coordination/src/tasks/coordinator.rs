//! Batch coordinator: run a set of locked tasks until every one is DONE.
//!
//! Each pass submits the whole batch to the [`TaskExecutor`]. Tasks already
//! DONE return immediately, tasks owned by another worker report `false`, and
//! failures are logged and retried on the next pass. Between passes the
//! coordinator sleeps for `pause`.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{CoordinatorError, ExecutorError, TaskError};
use super::executor::TaskExecutor;
use super::locked::LockedTask;

/// Summary of a completed batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub description: String,
    pub tasks: usize,
    /// Passes needed until every task reported DONE (at least one)
    pub passes: u32,
}

/// Drives batches of [`LockedTask`]s to completion
#[derive(Debug, Clone)]
pub struct TaskCoordinator {
    executor: TaskExecutor,
    pause: Duration,
    max_passes: Option<u32>,
}

impl TaskCoordinator {
    pub fn new(executor: TaskExecutor, pause: Duration) -> Self {
        Self {
            executor,
            pause,
            max_passes: None,
        }
    }

    /// Give up with [`CoordinatorError::PassesExhausted`] after `passes` passes.
    ///
    /// Unbounded by default.
    pub fn with_max_passes(mut self, passes: u32) -> Self {
        self.max_passes = Some(passes.max(1));
        self
    }

    pub fn executor(&self) -> &TaskExecutor {
        &self.executor
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Run `tasks` until all of them are DONE.
    ///
    /// Returns once every task reported success in a single pass.
    pub async fn run(
        &self,
        description: &str,
        tasks: &[Arc<LockedTask>],
    ) -> Result<BatchReport, CoordinatorError> {
        for task in tasks {
            // Acquisition creates missing directories again, so keep going
            if let Err(e) = task.prepare() {
                warn!(batch = description, task = task.description(), error = %e, "Could not prepare markers");
            }
        }

        let mut passes = 0u32;
        loop {
            passes += 1;

            let units: Vec<_> = tasks
                .iter()
                .map(|task| {
                    let task = task.clone();
                    move |cancel: &CancellationToken| task.execute(cancel)
                })
                .collect();

            let results = self.executor.submit_all(units).await;
            let complete = self.review_pass(description, passes, tasks, results);

            if complete {
                info!(batch = description, passes, tasks = tasks.len(), "Batch complete");
                return Ok(BatchReport {
                    description: description.to_string(),
                    tasks: tasks.len(),
                    passes,
                });
            }

            if self.max_passes.is_some_and(|max| passes >= max) {
                return Err(CoordinatorError::PassesExhausted {
                    description: description.to_string(),
                    passes,
                });
            }

            debug!(
                batch = description,
                pass = passes,
                pause_ms = self.pause.as_millis() as u64,
                "Batch incomplete, pausing before the next pass"
            );
            tokio::time::sleep(self.pause).await;
        }
    }

    /// Log failures of one pass; returns whether every task succeeded
    fn review_pass(
        &self,
        description: &str,
        pass: u32,
        tasks: &[Arc<LockedTask>],
        results: Vec<Result<bool, ExecutorError<TaskError>>>,
    ) -> bool {
        let mut complete = true;
        for (task, result) in tasks.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => complete = false,
                Err(e) => {
                    complete = false;
                    error!(
                        batch = description,
                        pass,
                        task = task.description(),
                        error = %e,
                        "Task failed, will retry"
                    );
                }
            }
        }
        complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::store::StatusLockStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn coordinator() -> TaskCoordinator {
        TaskCoordinator::new(
            TaskExecutor::new(2, Duration::from_secs(5)),
            Duration::from_millis(10),
        )
    }

    fn store(root: &std::path::Path) -> Arc<StatusLockStore> {
        Arc::new(StatusLockStore::new(
            root.join("Locks"),
            root.join("Status"),
            Duration::from_secs(3600),
        ))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retries_until_every_task_done() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let calls: Vec<Arc<AtomicUsize>> = (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();

        let tasks: Vec<Arc<LockedTask>> = calls
            .iter()
            .enumerate()
            .map(|(i, counter)| {
                let counter = counter.clone();
                Arc::new(LockedTask::keyed(store.clone(), format!("Batch/task{}", i + 1), move |_| {
                    let attempt = counter.fetch_add(1, Ordering::SeqCst);
                    // The second task asks for a retry on its first attempt
                    Ok(i != 1 || attempt > 0)
                }))
            })
            .collect();

        let report = coordinator().run("retry batch", &tasks).await.unwrap();

        assert_eq!(report.passes, 2);
        assert_eq!(report.tasks, 3);
        let counts: Vec<usize> = calls.iter().map(|c| c.load(Ordering::SeqCst)).collect();
        assert_eq!(counts, vec![1, 2, 1]);
        assert!(tasks.iter().all(|t| t.is_done()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_errors_are_retried() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let task = Arc::new(LockedTask::keyed(store, "Batch/flaky", move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                anyhow::bail!("transient failure");
            }
            Ok(true)
        }));

        let report = coordinator().run("flaky batch", &[task]).await.unwrap();
        assert_eq!(report.passes, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pass_budget_exhausted() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let task = Arc::new(LockedTask::keyed(store, "Batch/never", |_| Ok(false)));

        let err = coordinator()
            .with_max_passes(3)
            .run("hopeless batch", &[task])
            .await
            .unwrap_err();

        assert!(matches!(err, CoordinatorError::PassesExhausted { passes: 3, .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unpreparable_markers_do_not_abort_batch() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        // A plain file where the lock tree should be
        let blocker = dir.path().join("Locks");
        std::fs::write(&blocker, "not a directory").unwrap();

        let task = Arc::new(LockedTask::keyed(store.clone(), "Batch/blocked", |_| Ok(true)));
        let cleanup = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            std::fs::remove_file(&blocker).unwrap();
        });

        let report = coordinator().run("blocked batch", &[task]).await.unwrap();
        cleanup.await.unwrap();

        assert!(report.passes >= 2);
        assert!(store.is_done("Batch/blocked"));
    }

    #[tokio::test]
    async fn test_empty_batch_completes_in_one_pass() {
        let report = coordinator().run("nothing", &[]).await.unwrap();
        assert_eq!(report.passes, 1);
        assert_eq!(report.tasks, 0);
    }
}
