//! Restart-safe experiment coordination and ensemble combination
//!
//! This library provides:
//! - A file-system lock/status protocol that lets many worker processes share
//!   one directory and run every unit of work exactly once, surviving crashes
//! - A bounded parallel executor with a per-unit watchdog
//! - A batch coordinator that retries a set of locked tasks until all are done
//! - The prediction data model, its tab-separated file format and metrics
//! - Ensemble combiners that merge base-learner predictions per instance
//!
//! # Features
//!
//! ## Task coordination
//! - `StatusLockStore`: lock and status markers keyed by a status key
//! - `LockedTask`: idempotent unit of work (`ABSENT → PENDING → DONE`)
//! - `TaskExecutor`: semaphore-bounded `spawn_blocking` fan-out
//! - `TaskCoordinator`: pass loop with a pause between passes
//!
//! ## Ensembles
//! - `MajorityVote`, `WeightedVote`: (weighted) votes per label
//! - `SelectBest`, `MaxProbability`: pass one base prediction through
//! - `MeanProbability`, `WeightedMeanProbability`: averaged probabilities
//! - `StackedEnsemble`: second-level learner over base outputs
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use mlflex_coordination::{EnsembleRunner, RunContext, RunSettings, TaskCoordinator, TaskExecutor};
//!
//! let settings = RunSettings::from_file("run.toml".as_ref())?;
//! let layout = mlflex_coordination::ExperimentLayout::new(&settings);
//! let store = Arc::new(layout.status_store(settings.thread_timeout()));
//! let coordinator = TaskCoordinator::new(
//!     TaskExecutor::new(settings.num_threads, settings.thread_timeout()),
//!     settings.pause(),
//! );
//!
//! let seed = mlflex_coordination::agree_on_seed(&coordinator, store.clone(), &layout, settings.random_seed).await?;
//! let ctx = RunContext::new(settings, seed)?;
//! let runner = Arc::new(EnsembleRunner::new(ctx));
//! let task = Arc::new(runner.fold_task(store, 1, load_fold));
//! coordinator.run("Make ensemble predictions", &[task]).await?;
//! ```

pub mod context;
pub mod ensemble;
pub mod experiment;
pub mod learner;
pub mod predictions;
pub mod tasks;

// Re-export run configuration types
pub use context::{ConfigError, ConfigResult, LabelVocabulary, RunContext, RunSettings};

// Re-export experiment layout helpers
pub use experiment::{
    agree_on_seed, complete_iteration, iteration_complete_task, iteration_is_complete, read_seed,
    seed_task, ExperimentLayout,
};

// Re-export task coordination types
pub use tasks::{
    AcquireResult, BatchReport, CoordinatorError, ExecutorError, LockedTask, StatusEntry,
    StatusLockStore, StoreError, TaskCoordinator, TaskError, TaskExecutor, TaskStatus,
};

// Re-export prediction types
pub use predictions::{
    read_predictions, write_predictions, Prediction, PredictionError, PredictionFileError,
    PredictionResults, PredictionSet,
};

// Re-export learner contract
pub use learner::{DataInstance, Dataset, LearnerError, LearnerResult, MachineLearner};

// Re-export ensemble types
pub use ensemble::{
    assemble_infos, ensemble_task_key, standard_combiners, Combiner, CombinerKind,
    EnsembleError, EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult,
    EnsembleRunner, MajorityVote, MaxProbability, MeanProbability, SelectBest,
    SelectorPredictions, StackedEnsemble, StackingFeatures, WeightedMeanProbability,
    WeightedVote,
};
