//! Task coordination error types

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for marker store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the status/lock marker store.
///
/// Acquisition never surfaces these: any I/O problem while claiming a key is
/// reported as [`AcquireResult::Busy`](super::AcquireResult::Busy).
#[derive(Error, Debug)]
pub enum StoreError {
    /// A marker could not be written, read or removed
    #[error("Marker I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// `mark_done` was called for a key this worker never acquired
    #[error("No PENDING status marker for {key}; the key was not acquired")]
    NotAcquired { key: String },

    /// Walking the status tree failed
    #[error("Status tree walk failed: {0}")]
    Walk(String),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type alias for a single locked task attempt
pub type TaskResult<T> = Result<T, TaskError>;

/// Fatal outcome of one locked task attempt.
///
/// Contention and "retry needed" are not errors; they surface as `Ok(false)`.
#[derive(Error, Debug)]
pub enum TaskError {
    /// The wrapped action returned an error
    #[error("Task '{description}' failed: {source:#}")]
    Action {
        description: String,
        #[source]
        source: anyhow::Error,
    },

    /// The DONE marker could not be written after a successful action
    #[error("Task '{description}' succeeded but could not be marked done: {source}")]
    MarkDone {
        description: String,
        #[source]
        source: StoreError,
    },
}

/// Errors surfaced by the bounded task executor for a single unit
#[derive(Error, Debug)]
pub enum ExecutorError<E> {
    /// The unit ran and returned an error
    #[error(transparent)]
    Failed(E),

    /// The unit panicked while running
    #[error("Worker panicked: {0}")]
    Panicked(String),

    /// The unit never ran because the executor shut down first
    #[error("Executor shut down before the unit could run")]
    Shutdown,
}

/// Errors raised by the batch coordinator
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A pass budget was configured and every pass left work unfinished
    #[error("Batch '{description}' still incomplete after {passes} passes")]
    PassesExhausted { description: String, passes: u32 },
}
