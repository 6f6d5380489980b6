//! Operator actions: reset, status and ensemble

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use mlflex_coordination::{
    agree_on_seed, assemble_infos, complete_iteration, iteration_is_complete, read_predictions,
    BatchReport, EnsemblePredictionInfos, EnsembleRunner, ExperimentLayout, LabelVocabulary,
    RunContext, RunSettings, SelectorPredictions, StackedEnsemble, StatusEntry, StatusLockStore,
    TaskCoordinator, TaskExecutor,
};
use tracing::info;

use crate::command_learner::CommandLearner;
use crate::config::RunnerConfig;

pub const OUTER_PREDICTIONS_FILE: &str = "Outer_Predictions.txt";
pub const INNER_PREDICTIONS_FILE: &str = "Inner_Predictions.txt";

/// Outcome of `mlflex ensemble`
#[derive(Debug, Clone)]
pub enum EnsembleOutcome {
    /// An earlier run already finished this iteration
    AlreadyComplete,
    Completed { seed: u64, report: BatchReport },
}

fn coordinator(settings: &RunSettings) -> TaskCoordinator {
    let coordinator = TaskCoordinator::new(
        TaskExecutor::new(settings.num_threads, settings.thread_timeout()),
        settings.pause(),
    );
    match settings.max_passes {
        Some(passes) => coordinator.with_max_passes(passes),
        None => coordinator,
    }
}

fn store(layout: &ExperimentLayout, settings: &RunSettings) -> Arc<StatusLockStore> {
    Arc::new(layout.status_store(settings.thread_timeout()))
}

/// Delete marker trees and ensemble outputs for every iteration
pub fn reset(settings: &RunSettings) -> Result<()> {
    let layout = ExperimentLayout::new(settings);
    layout
        .reset()
        .with_context(|| format!("Failed to reset experiment {}", layout.experiment()))?;
    info!(experiment = %layout.experiment(), "Experiment reset");
    Ok(())
}

/// Status markers of the configured iteration
pub fn status(settings: &RunSettings) -> Result<Vec<StatusEntry>> {
    let layout = ExperimentLayout::new(settings);
    store(&layout, settings)
        .list()
        .context("Failed to list status markers")
}

/// Plain-text status table, one marker per line
pub fn render_status(entries: &[StatusEntry], now: DateTime<Utc>) -> String {
    let width = entries.iter().map(|e| e.key.len()).max().unwrap_or(0).max(3);
    let mut out = format!("{:<width$}  {:<7}  AGE\n", "KEY", "STATUS");
    for entry in entries {
        out.push_str(&format!(
            "{:<width$}  {:<7}  {}\n",
            entry.key,
            entry.status.to_string(),
            format_age(now - entry.modified)
        ));
    }
    out
}

fn format_age(age: chrono::Duration) -> String {
    let secs = age.num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m{}s", s / 60, s % 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}

/// Selector predictions for one outer fold.
///
/// Each subdirectory of `<predictions>/OuterFold<k>/` is one model selector,
/// read in name order.
pub fn load_selectors(predictions: &Path, outer_fold: u32) -> Result<Vec<SelectorPredictions>> {
    let fold_dir = predictions.join(format!("OuterFold{outer_fold}"));
    let mut dirs: Vec<PathBuf> = fs::read_dir(&fold_dir)
        .with_context(|| format!("Failed to read {}", fold_dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .map(|dir| -> Result<SelectorPredictions> {
            let source = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let outer = read_predictions(&dir.join(OUTER_PREDICTIONS_FILE))?;
            let inner_path = dir.join(INNER_PREDICTIONS_FILE);
            let inner = if inner_path.exists() {
                Some(read_predictions(&inner_path)?)
            } else {
                None
            };
            Ok(SelectorPredictions { source, outer, inner })
        })
        .collect()
}

/// Per-instance combiner input for one outer fold
pub fn load_fold(
    labels: &LabelVocabulary,
    predictions: &Path,
    outer_fold: u32,
    evaluate_inner: bool,
) -> Result<BTreeMap<String, EnsemblePredictionInfos>> {
    let selectors = load_selectors(predictions, outer_fold)?;
    let infos = assemble_infos(labels, &selectors, evaluate_inner)
        .with_context(|| format!("Invalid base predictions for outer fold {outer_fold}"))?;
    Ok(infos)
}

/// Combine base-learner predictions for every outer fold.
///
/// Agrees on the run seed, runs one locked ensemble task per fold and marks
/// the iteration complete. Safe to run concurrently from many processes.
pub async fn ensemble(config: &RunnerConfig, predictions: &Path, folds: u32) -> Result<EnsembleOutcome> {
    let settings = &config.run;
    settings.validate()?;

    let layout = ExperimentLayout::new(settings);
    let store = store(&layout, settings);
    let coordinator = coordinator(settings);

    if iteration_is_complete(&store) {
        info!(experiment = %layout.experiment(), iteration = layout.iteration(), "Iteration already complete");
        return Ok(EnsembleOutcome::AlreadyComplete);
    }

    let seed = agree_on_seed(&coordinator, store.clone(), &layout, settings.random_seed).await?;
    let ctx = RunContext::new(settings.clone(), seed)?;

    let mut runner = EnsembleRunner::new(ctx.clone());
    if let Some(stacking) = &config.stacking {
        let learner = CommandLearner::new(&stacking.command, layout.ensemble_dir().join("Stacking"));
        runner = runner.with_combiner(Arc::new(StackedEnsemble::new(
            ctx.clone(),
            stacking.features.into(),
            Arc::new(learner),
        )));
    }
    let runner = Arc::new(runner);
    info!(folds, combiners = ?runner.kinds(), seed, "Making ensemble predictions");

    let tasks: Vec<_> = (1..=folds)
        .map(|fold| {
            let labels = ctx.labels().clone();
            let predictions = predictions.to_path_buf();
            let evaluate_inner = config.evaluate_inner;
            Arc::new(runner.fold_task(store.clone(), fold, move |k| {
                load_fold(&labels, &predictions, k, evaluate_inner)
            }))
        })
        .collect();

    let report = coordinator.run("Make ensemble predictions", &tasks).await?;
    complete_iteration(&coordinator, store).await?;

    Ok(EnsembleOutcome::Completed { seed, report })
}
