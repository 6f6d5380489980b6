//! Restart-safe task coordination over a shared filesystem
//!
//! Several worker processes, possibly on different machines, share one
//! internals directory. Every unit of work is identified by a status key and
//! guarded by two marker files:
//!
//! ```text
//! <internals>/Locks/<key>    exists while a worker is claiming the key
//! <internals>/Status/<key>   empty = PENDING, "DONE" = complete
//! ```
//!
//! # Components
//!
//! - **StatusLockStore**: atomic marker creation, staleness, listing
//! - **LockedTask**: run an action at most once per key
//! - **TaskExecutor**: bounded parallel execution with a per-unit watchdog
//! - **TaskCoordinator**: repeat a batch until every task is DONE
//!
//! A worker that crashes mid-task leaves a PENDING marker behind. Once that
//! marker is older than the store's staleness threshold, the next contender
//! evicts it and a later one reclaims the key.

mod coordinator;
mod error;
mod executor;
mod locked;
mod store;

pub use coordinator::{BatchReport, TaskCoordinator};
pub use error::{
    CoordinatorError, ExecutorError, StoreError, StoreResult, TaskError, TaskResult,
};
pub use executor::TaskExecutor;
pub use locked::{LockedTask, TaskAction};
pub use store::{AcquireResult, StatusEntry, StatusLockStore, TaskStatus, DONE_STATUS};
