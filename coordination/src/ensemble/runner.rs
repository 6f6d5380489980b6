//! Per-fold ensemble execution with verification after write

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{standard_combiners, Combiner, CombinerKind, EnsembleError, EnsemblePredictionInfos};
use crate::context::RunContext;
use crate::predictions::{read_predictions, write_predictions, PredictionFileError, PredictionSet};
use crate::tasks::{LockedTask, StatusLockStore};

/// Status key of the ensemble task for one outer fold
pub fn ensemble_task_key(outer_fold: u32) -> String {
    format!("EnsemblePredictions_OuterFold{outer_fold}")
}

/// Runs a list of combiners over outer folds and persists their output
#[derive(Clone)]
pub struct EnsembleRunner {
    ctx: RunContext,
    combiners: Vec<Arc<dyn Combiner>>,
}

impl EnsembleRunner {
    /// A runner with the six learner-free strategies
    pub fn new(ctx: RunContext) -> Self {
        let combiners = standard_combiners(&ctx);
        Self { ctx, combiners }
    }

    /// A runner with exactly the given combiners
    pub fn with_combiners(ctx: RunContext, combiners: Vec<Arc<dyn Combiner>>) -> Self {
        Self { ctx, combiners }
    }

    /// Add another combiner, e.g. a stacked ensemble
    pub fn with_combiner(mut self, combiner: Arc<dyn Combiner>) -> Self {
        self.combiners.push(combiner);
        self
    }

    pub fn kinds(&self) -> Vec<CombinerKind> {
        self.combiners.iter().map(|c| c.kind()).collect()
    }

    pub fn output_path(&self, outer_fold: u32, kind: CombinerKind) -> PathBuf {
        self.ctx
            .layout()
            .ensemble_fold_dir(outer_fold)
            .join(kind.file_name())
    }

    /// Previously written output of one combiner for one fold
    pub fn read_fold(&self, outer_fold: u32, kind: CombinerKind) -> Result<PredictionSet, PredictionFileError> {
        read_predictions(&self.output_path(outer_fold, kind))
    }

    /// Combine, write and re-read every combiner's output for one fold.
    ///
    /// Returns `Ok(false)` when a written file does not read back identically
    /// or when cancelled; both mean the fold must be retried.
    pub fn run_fold(
        &self,
        outer_fold: u32,
        infos: &BTreeMap<String, EnsemblePredictionInfos>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<bool> {
        for combiner in &self.combiners {
            if cancel.is_cancelled() {
                warn!(outer_fold, "Ensemble fold interrupted");
                return Ok(false);
            }

            let kind = combiner.kind();
            let combined = match combiner.combine_all(infos, cancel) {
                Ok(combined) => combined,
                Err(EnsembleError::Interrupted) => {
                    warn!(outer_fold, combiner = %kind, "Ensemble fold interrupted");
                    return Ok(false);
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("{kind} failed for outer fold {outer_fold}"));
                }
            };

            let path = self.output_path(outer_fold, kind);
            write_predictions(&combined, self.ctx.labels(), &path)?;

            if read_predictions(&path)? != combined {
                warn!(outer_fold, combiner = %kind, path = %path.display(), "Saved predictions did not read back identically");
                return Ok(false);
            }
            debug!(outer_fold, combiner = %kind, instances = combined.len(), "Ensemble predictions saved");
        }

        info!(outer_fold, combiners = self.combiners.len(), "Ensemble predictions complete");
        Ok(true)
    }

    /// Locked task computing one fold; `load` builds the fold's infos
    pub fn fold_task<L>(self: &Arc<Self>, store: Arc<StatusLockStore>, outer_fold: u32, load: L) -> LockedTask
    where
        L: Fn(u32) -> anyhow::Result<BTreeMap<String, EnsemblePredictionInfos>> + Send + Sync + 'static,
    {
        let runner = Arc::clone(self);
        LockedTask::new(
            store,
            ensemble_task_key(outer_fold),
            format!("Make ensemble predictions for outer fold {outer_fold}"),
            move |cancel| {
                let infos = load(outer_fold)?;
                runner.run_fold(outer_fold, &infos, cancel)
            },
        )
    }
}
