//! Experiment directory layout and the run-level locked tasks
//!
//! ```text
//! <internals>/Locks/<experiment>/Iteration<i>/...
//! <internals>/Status/<experiment>/Iteration<i>/...
//! <internals>/EnsemblePredictions/<experiment>/Iteration<i>/OuterFold<k>/
//! <output>/<experiment>/Settings/Iteration<i>/Random_Seed.txt
//! ```
//!
//! Workers in a cluster agree on one run seed through the "Set random seed"
//! task: whichever worker claims it writes the seed file, and everyone reads
//! the persisted value afterwards.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::{debug, info};

use crate::context::RunSettings;
use crate::tasks::{LockedTask, StatusLockStore, StoreError, StoreResult, TaskCoordinator};

/// Status key of the seed agreement task
pub const SEED_TASK: &str = "Set random seed";

/// Status key of the final per-iteration task
pub const ITERATION_COMPLETE_TASK: &str = "Indicate iteration complete";

const SEED_FILE_NAME: &str = "Random_Seed.txt";

const SEED_FILE_COMMENT: &str = "# This value is the random seed used whenever random values were needed \
(tie-breaking, shuffling, fold assignment).";

/// Resolved directories for one experiment iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExperimentLayout {
    internals_dir: PathBuf,
    output_dir: PathBuf,
    experiment: String,
    iteration: u32,
}

impl ExperimentLayout {
    pub fn new(settings: &RunSettings) -> Self {
        Self {
            internals_dir: settings.internals_dir.clone(),
            output_dir: settings.output_dir.clone(),
            experiment: settings.experiment.clone(),
            iteration: settings.iteration,
        }
    }

    pub fn experiment(&self) -> &str {
        &self.experiment
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    fn iteration_dir(&self) -> String {
        format!("Iteration{}", self.iteration)
    }

    /// Lock markers for this experiment across all iterations
    pub fn locks_root(&self) -> PathBuf {
        self.internals_dir.join("Locks").join(&self.experiment)
    }

    /// Status markers for this experiment across all iterations
    pub fn status_root(&self) -> PathBuf {
        self.internals_dir.join("Status").join(&self.experiment)
    }

    /// Ensemble outputs for this experiment across all iterations
    pub fn ensemble_root(&self) -> PathBuf {
        self.internals_dir.join("EnsemblePredictions").join(&self.experiment)
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.locks_root().join(self.iteration_dir())
    }

    pub fn status_dir(&self) -> PathBuf {
        self.status_root().join(self.iteration_dir())
    }

    pub fn ensemble_dir(&self) -> PathBuf {
        self.ensemble_root().join(self.iteration_dir())
    }

    pub fn ensemble_fold_dir(&self, outer_fold: u32) -> PathBuf {
        self.ensemble_dir().join(format!("OuterFold{outer_fold}"))
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.output_dir
            .join(&self.experiment)
            .join("Settings")
            .join(self.iteration_dir())
    }

    pub fn seed_file(&self) -> PathBuf {
        self.settings_dir().join(SEED_FILE_NAME)
    }

    /// Marker store for this iteration
    pub fn status_store(&self, stale_after: Duration) -> StatusLockStore {
        StatusLockStore::new(self.locks_dir(), self.status_dir(), stale_after)
    }

    /// Delete lock, status and ensemble trees for every iteration
    pub fn reset(&self) -> StoreResult<()> {
        for root in [self.locks_root(), self.status_root(), self.ensemble_root()] {
            match fs::remove_dir_all(&root) {
                Ok(()) => info!(path = %root.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(root, e)),
            }
        }
        Ok(())
    }
}

/// Seed that the "Set random seed" task writes.
///
/// An explicit non-zero seed is used as is, `0` draws a fresh one and no
/// seed at all falls back to the iteration number.
pub fn initial_seed(configured: Option<u64>, iteration: u32) -> u64 {
    match configured {
        Some(0) => fastrand::u64(1..),
        Some(seed) => seed,
        None => u64::from(iteration),
    }
}

/// Read the first non-comment line of a seed file
pub fn read_seed(path: &Path) -> anyhow::Result<u64> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read seed file {}", path.display()))?;
    let value = text
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with('#'))
        .with_context(|| format!("Seed file {} holds no value", path.display()))?;
    value
        .parse()
        .with_context(|| format!("Seed file {} holds '{value}', not an integer", path.display()))
}

/// Task that persists the run seed and verifies it by reading it back
pub fn seed_task(store: Arc<StatusLockStore>, seed_file: PathBuf, seed: u64) -> LockedTask {
    LockedTask::keyed(store, SEED_TASK, move |_| {
        if let Some(parent) = seed_file.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&seed_file, format!("{SEED_FILE_COMMENT}\n{seed}"))
            .with_context(|| format!("Failed to write {}", seed_file.display()))?;
        Ok(read_seed(&seed_file)? == seed)
    })
}

/// Final task of an iteration; a DONE marker means the iteration is finished
pub fn iteration_complete_task(store: Arc<StatusLockStore>) -> LockedTask {
    LockedTask::keyed(store, ITERATION_COMPLETE_TASK, |_| Ok(true))
}

/// Whether an earlier run already finished this iteration
pub fn iteration_is_complete(store: &StatusLockStore) -> bool {
    store.is_done(ITERATION_COMPLETE_TASK)
}

/// Run seed agreement and return the seed every worker must use
pub async fn agree_on_seed(
    coordinator: &TaskCoordinator,
    store: Arc<StatusLockStore>,
    layout: &ExperimentLayout,
    configured: Option<u64>,
) -> anyhow::Result<u64> {
    let seed_file = layout.seed_file();
    let task = Arc::new(seed_task(
        store,
        seed_file.clone(),
        initial_seed(configured, layout.iteration()),
    ));
    coordinator.run(SEED_TASK, &[task]).await?;

    let seed = read_seed(&seed_file)?;
    debug!(seed, path = %seed_file.display(), "Run seed agreed");
    Ok(seed)
}

/// Mark the iteration as complete
pub async fn complete_iteration(
    coordinator: &TaskCoordinator,
    store: Arc<StatusLockStore>,
) -> anyhow::Result<()> {
    let task = Arc::new(iteration_complete_task(store));
    coordinator.run(ITERATION_COMPLETE_TASK, &[task]).await?;
    Ok(())
}
