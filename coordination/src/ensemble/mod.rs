//! Ensemble combination of base-learner predictions
//!
//! Every base learner (one model selector: data source, feature selection,
//! classifier, feature count) predicts each outer-fold test instance. A
//! combiner folds those predictions into one per instance.
//!
//! # Architecture
//!
//! ```text
//!  selector outer/inner prediction files
//!                 │
//!                 ▼
//!        assemble_infos()  ──▶  instance ID → EnsemblePredictionInfos
//!                                         │
//!          ┌──────────────┬───────────────┼───────────────┬──────────────┐
//!          ▼              ▼               ▼               ▼              ▼
//!     MajorityVote   WeightedVote    SelectBest   MaxProbability   Mean / WeightedMean
//!                                                                  Stacked (meta-learner)
//!                                         │
//!                                         ▼
//!                 EnsembleRunner: write, re-read, compare (one locked task per fold)
//! ```
//!
//! # Determinism
//!
//! Whenever several labels tie for the best score, the winner is drawn from a
//! random stream seeded by the run seed and the instance ID, so repeated runs
//! with one seed make identical decisions.

mod assembly;
mod probability;
mod runner;
mod selection;
mod stacking;
mod voting;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::context::{LabelVocabulary, RunContext};
use crate::learner::LearnerError;
use crate::predictions::{Prediction, PredictionError, PredictionResults, PredictionSet};

pub use assembly::{assemble_infos, SelectorPredictions};
pub use probability::{MeanProbability, WeightedMeanProbability};
pub use runner::{ensemble_task_key, EnsembleRunner};
pub use selection::{MaxProbability, SelectBest};
pub use stacking::{StackedEnsemble, StackingFeatures};
pub use voting::{MajorityVote, WeightedVote};

/// Error type for combination
#[derive(Debug, Error)]
pub enum EnsembleError {
    #[error("No predictions available for instance {instance_id}; a majority vote cannot be computed")]
    NoPredictions { instance_id: String },

    #[error("Prediction for {found} added to the infos of {expected}")]
    MixedInstances { expected: String, found: String },

    #[error(transparent)]
    InvalidPrediction(#[from] PredictionError),

    #[error("No inner-fold predictions to train the stacking model on")]
    NoTrainingData,

    #[error("Stacking model returned no prediction for instance {instance_id}")]
    MissingStackedPrediction { instance_id: String },

    #[error("Stacking model failed: {0}")]
    Learner(#[from] LearnerError),

    #[error("Combination was interrupted")]
    Interrupted,
}

/// Result type for combination
pub type EnsembleResult<T> = Result<T, EnsembleError>;

/// Every combination strategy, named as in output file names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CombinerKind {
    MajorityVote,
    WeightedVote,
    SelectBest,
    MaxProbability,
    MeanProbability,
    WeightedMeanProbability,
    StackedProbabilities,
    StackedPredictions,
}

impl CombinerKind {
    /// Strategies that need no external learner
    pub const STANDARD: [CombinerKind; 6] = [
        CombinerKind::MajorityVote,
        CombinerKind::WeightedVote,
        CombinerKind::SelectBest,
        CombinerKind::MaxProbability,
        CombinerKind::MeanProbability,
        CombinerKind::WeightedMeanProbability,
    ];

    pub fn description(&self) -> &'static str {
        match self {
            Self::MajorityVote => "MajorityVote",
            Self::WeightedVote => "WeightedVote",
            Self::SelectBest => "SelectBest",
            Self::MaxProbability => "MaxProbability",
            Self::MeanProbability => "MeanProbability",
            Self::WeightedMeanProbability => "WeightedMeanProbability",
            Self::StackedProbabilities => "StackedProbabilities",
            Self::StackedPredictions => "StackedPredictions",
        }
    }

    /// Name of the per-fold output file
    pub fn file_name(&self) -> String {
        format!("{}_Predictions.txt", self.description())
    }
}

impl fmt::Display for CombinerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// A strategy that merges base predictions for one instance
pub trait Combiner: Send + Sync {
    fn kind(&self) -> CombinerKind;

    /// Combine the base predictions for one instance
    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction>;

    /// Combine every instance of an outer fold, stopping once `cancel` fires
    fn combine_all(
        &self,
        infos: &BTreeMap<String, EnsemblePredictionInfos>,
        cancel: &CancellationToken,
    ) -> EnsembleResult<PredictionSet> {
        infos
            .iter()
            .map(|(instance_id, infos)| {
                if cancel.is_cancelled() {
                    return Err(EnsembleError::Interrupted);
                }
                self.combine(instance_id, infos)
            })
            .collect()
    }
}

/// The six learner-free strategies
pub fn standard_combiners(ctx: &RunContext) -> Vec<Arc<dyn Combiner>> {
    vec![
        Arc::new(MajorityVote::new(ctx.clone())),
        Arc::new(WeightedVote::new(ctx.clone())),
        Arc::new(SelectBest::new(ctx.clone())),
        Arc::new(MaxProbability::new(ctx.clone())),
        Arc::new(MeanProbability::new(ctx.clone())),
        Arc::new(WeightedMeanProbability::new(ctx.clone())),
    ]
}

/// One base learner's outer prediction for an instance, with the inner-fold
/// results that estimate how far to trust it
#[derive(Debug, Clone)]
pub struct EnsemblePredictionInfo {
    outer: Prediction,
    inner: Arc<PredictionSet>,
    source: String,
    weight: OnceLock<f64>,
}

impl EnsemblePredictionInfo {
    pub fn new(outer: Prediction, inner: Arc<PredictionSet>, source: impl Into<String>) -> Self {
        Self {
            outer,
            inner,
            source: source.into(),
            weight: OnceLock::new(),
        }
    }

    /// Use a fixed weight instead of one derived from the inner results
    pub fn with_weight(self, weight: f64) -> Self {
        Self {
            weight: OnceLock::from(weight),
            ..self
        }
    }

    pub fn outer(&self) -> &Prediction {
        &self.outer
    }

    pub fn inner(&self) -> &PredictionSet {
        &self.inner
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Weighted ROC area of the inner-fold results, computed on first use
    pub fn weight(&self, labels: &LabelVocabulary) -> f64 {
        *self
            .weight
            .get_or_init(|| PredictionResults::new(&self.inner).weighted_auc(labels))
    }
}

/// All base predictions for one instance, in a stable order
#[derive(Debug, Clone)]
pub struct EnsemblePredictionInfos {
    instance_id: String,
    infos: Vec<EnsemblePredictionInfo>,
}

impl EnsemblePredictionInfos {
    pub fn new(instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            infos: Vec::new(),
        }
    }

    /// Append one base prediction; it must concern this instance
    pub fn push(&mut self, info: EnsemblePredictionInfo) -> EnsembleResult<()> {
        if info.outer.instance_id() != self.instance_id {
            return Err(EnsembleError::MixedInstances {
                expected: self.instance_id.clone(),
                found: info.outer.instance_id().to_string(),
            });
        }
        self.infos.push(info);
        Ok(())
    }

    /// Builder form of [`push`](Self::push)
    pub fn with(mut self, info: EnsemblePredictionInfo) -> EnsembleResult<Self> {
        self.push(info)?;
        Ok(self)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn len(&self) -> usize {
        self.infos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EnsemblePredictionInfo> {
        self.infos.iter()
    }

    pub fn outer_predictions(&self) -> impl Iterator<Item = &Prediction> {
        self.infos.iter().map(|info| &info.outer)
    }

    /// True label as reported by the first base prediction
    pub fn true_label(&self) -> Option<&str> {
        self.infos.first().map(|info| info.outer.true_label())
    }

    /// Infos ordered by source description
    pub fn canonical(&self) -> Vec<&EnsemblePredictionInfo> {
        let mut ordered: Vec<&EnsemblePredictionInfo> = self.infos.iter().collect();
        ordered.sort_by(|a, b| a.source.cmp(&b.source));
        ordered
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::context::RunSettings;

    pub fn context(seed: u64) -> RunContext {
        let settings = RunSettings {
            labels: vec!["A".into(), "B".into()],
            ..RunSettings::default()
        };
        RunContext::new(settings, seed).unwrap()
    }

    pub fn info(source: &str, instance_id: &str, predicted: &str, probs: [f64; 2]) -> EnsemblePredictionInfo {
        EnsemblePredictionInfo::new(
            Prediction::new(instance_id, "A", predicted, probs.to_vec()),
            Arc::new(PredictionSet::new()),
            source,
        )
    }

    pub fn infos(instance_id: &str, items: Vec<EnsemblePredictionInfo>) -> EnsemblePredictionInfos {
        let mut infos = EnsemblePredictionInfos::new(instance_id);
        for item in items {
            infos.push(item).unwrap();
        }
        infos
    }

    /// Three base predictions for P1 over labels A and B
    pub fn p1(weights: [f64; 3]) -> EnsemblePredictionInfos {
        infos(
            "P1",
            vec![
                info("m1", "P1", "A", [0.9, 0.1]).with_weight(weights[0]),
                info("m2", "P1", "A", [0.6, 0.4]).with_weight(weights[1]),
                info("m3", "P1", "B", [0.3, 0.7]).with_weight(weights[2]),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_infos_reject_other_instances() {
        let mut infos = EnsemblePredictionInfos::new("P1");
        let err = infos.push(info("m1", "P2", "A", [1.0, 0.0])).unwrap_err();
        assert!(matches!(err, EnsembleError::MixedInstances { .. }));
        assert!(infos.is_empty());
    }

    #[test]
    fn test_infos_keep_same_source_duplicates() {
        let infos = infos(
            "P1",
            vec![
                info("m1", "P1", "A", [1.0, 0.0]),
                info("m1", "P1", "B", [0.0, 1.0]),
            ],
        );
        assert_eq!(infos.len(), 2);
    }

    #[test]
    fn test_weight_is_lazy_inner_auc() {
        let ctx = context(1);
        let inner: PredictionSet = [
            Prediction::new("I1", "A", "A", vec![0.8, 0.2]),
            Prediction::new("I2", "B", "B", vec![0.1, 0.9]),
        ]
        .into_iter()
        .collect();
        let info = EnsemblePredictionInfo::new(
            Prediction::new("P1", "A", "A", vec![0.7, 0.3]),
            Arc::new(inner),
            "m1",
        );

        assert!((info.weight(ctx.labels()) - 1.0).abs() < 1e-12);
        assert_eq!(info.clone().with_weight(0.25).weight(ctx.labels()), 0.25);
    }

    #[test]
    fn test_canonical_order_by_source() {
        let infos = infos(
            "P1",
            vec![
                info("rna", "P1", "A", [1.0, 0.0]),
                info("clinical", "P1", "B", [0.0, 1.0]),
            ],
        );
        let sources: Vec<&str> = infos.canonical().iter().map(|i| i.source()).collect();
        assert_eq!(sources, vec!["clinical", "rna"]);
    }

    #[test]
    fn test_misshapen_probabilities_rejected_by_every_combiner() {
        let ctx = context(1);
        let base = |source: &str, probs: Vec<f64>| {
            EnsemblePredictionInfo::new(
                Prediction::new("P1", "A", "A", probs),
                Arc::new(PredictionSet::new()),
                source,
            )
            .with_weight(1.0)
        };
        let cases = [
            // Sole prediction, passed through unless checked
            infos("P1", vec![base("m1", vec![1.0])]),
            // Unanimous, so the first one would stand as is
            infos("P1", vec![base("m1", vec![1.0]), base("m2", vec![0.2, 0.3, 0.99])]),
            infos("P1", vec![base("m1", vec![0.6, 0.4]), base("m2", vec![0.2, 0.3, 0.99])]),
        ];

        for combiner in standard_combiners(&ctx) {
            for case in &cases {
                let err = combiner.combine("P1", case).unwrap_err();
                assert!(
                    matches!(err, EnsembleError::InvalidPrediction(PredictionError::ProbabilityLength { .. })),
                    "{}: {err}",
                    combiner.kind()
                );
            }
        }
    }

    #[test]
    fn test_kind_file_names() {
        assert_eq!(CombinerKind::WeightedMeanProbability.file_name(), "WeightedMeanProbability_Predictions.txt");
        assert_eq!(CombinerKind::STANDARD.len(), 6);
        assert_eq!(CombinerKind::StackedPredictions.to_string(), "StackedPredictions");
    }
}
