//! Stacked generalization: a second-level learner trained on base outputs
//!
//! Training rows are the inner-fold instances of every base learner, with
//! that learner's class probabilities (or predicted label) as features and
//! the true label as class. Test rows are the outer-fold instances described
//! the same way by the outer predictions.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{Combiner, CombinerKind, EnsembleError, EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult};
use crate::context::RunContext;
use crate::learner::{Dataset, LearnerError, MachineLearner};
use crate::predictions::{Prediction, PredictionSet};

/// What a base learner contributes as features
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackingFeatures {
    /// One numeric feature per label: `<source>_<label>`
    Probabilities,
    /// One nominal feature: `<source>`
    PredictedLabels,
}

/// Stacked ensemble over an external meta-learner
#[derive(Clone)]
pub struct StackedEnsemble {
    ctx: RunContext,
    features: StackingFeatures,
    learner: Arc<dyn MachineLearner>,
}

impl StackedEnsemble {
    pub fn new(ctx: RunContext, features: StackingFeatures, learner: Arc<dyn MachineLearner>) -> Self {
        Self {
            ctx,
            features,
            learner,
        }
    }

    fn add_features(&self, data: &mut Dataset, instance_id: &str, source: &str, prediction: &Prediction) {
        match self.features {
            StackingFeatures::Probabilities => {
                for (label, p) in self.ctx.labels().iter().zip(prediction.class_probabilities()) {
                    data.set_value(instance_id, feature_name(&format!("{source}_{label}")), p.to_string());
                }
            }
            StackingFeatures::PredictedLabels => {
                data.set_value(
                    instance_id,
                    feature_name(source),
                    feature_name(prediction.predicted_label()),
                );
            }
        }
    }

    fn training_data(&self, infos: &BTreeMap<String, EnsemblePredictionInfos>) -> Dataset {
        // Every instance carries the same inner results per source; use each once
        let mut by_source: BTreeMap<&str, &EnsemblePredictionInfo> = BTreeMap::new();
        for info in infos.values().flat_map(EnsemblePredictionInfos::iter) {
            by_source.entry(info.source()).or_insert(info);
        }

        let mut training = Dataset::new();
        for (source, info) in by_source {
            for prediction in info.inner() {
                self.add_features(&mut training, prediction.instance_id(), source, prediction);
                training.set_label(prediction.instance_id(), prediction.true_label());
            }
        }
        training
    }

    fn test_data(&self, infos: &BTreeMap<String, EnsemblePredictionInfos>) -> Dataset {
        let mut test = Dataset::new();
        for (instance_id, instance_infos) in infos {
            for info in instance_infos.iter() {
                self.add_features(&mut test, instance_id, info.source(), info.outer());
            }
            if let Some(label) = instance_infos.true_label() {
                test.set_label(instance_id.as_str(), label);
            }
        }
        test
    }
}

impl Combiner for StackedEnsemble {
    fn kind(&self) -> CombinerKind {
        match self.features {
            StackingFeatures::Probabilities => CombinerKind::StackedProbabilities,
            StackingFeatures::PredictedLabels => CombinerKind::StackedPredictions,
        }
    }

    /// Trains a model for this instance alone; prefer `combine_all`
    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if infos.is_empty() {
            return Err(EnsembleError::NoPredictions {
                instance_id: instance_id.to_string(),
            });
        }
        let single = BTreeMap::from([(instance_id.to_string(), infos.clone())]);
        self.combine_all(&single, &CancellationToken::new())?
            .into_iter()
            .find(|p| p.instance_id() == instance_id)
            .ok_or_else(|| EnsembleError::MissingStackedPrediction {
                instance_id: instance_id.to_string(),
            })
    }

    fn combine_all(
        &self,
        infos: &BTreeMap<String, EnsemblePredictionInfos>,
        cancel: &CancellationToken,
    ) -> EnsembleResult<PredictionSet> {
        if let Some((instance_id, _)) = infos.iter().find(|(_, i)| i.is_empty()) {
            return Err(EnsembleError::NoPredictions {
                instance_id: instance_id.clone(),
            });
        }
        if infos.is_empty() {
            return Ok(PredictionSet::new());
        }

        let training = self.training_data(infos);
        if training.is_empty() {
            return Err(EnsembleError::NoTrainingData);
        }
        let test = self.test_data(infos);

        debug!(
            learner = %self.learner.description(),
            train = training.len(),
            test = test.len(),
            features = training.feature_names().len(),
            "Training stacking model"
        );
        let predicted = match self.learner.train_test(&training, &test, cancel) {
            Ok(predicted) => predicted,
            Err(LearnerError::Interrupted { .. }) => return Err(EnsembleError::Interrupted),
            Err(e) => return Err(e.into()),
        };

        let mut combined = PredictionSet::new();
        for instance_id in infos.keys() {
            let prediction = predicted.get(instance_id).cloned().ok_or_else(|| {
                EnsembleError::MissingStackedPrediction {
                    instance_id: instance_id.clone(),
                }
            })?;
            prediction.validate(self.ctx.labels())?;
            combined.insert(prediction);
        }
        Ok(combined)
    }
}

/// Feature names must not contain `-` or `.`
fn feature_name(raw: &str) -> String {
    raw.replace(['-', '.'], "_")
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::learner::LearnerResult;
    use mockall::mock;
    use mockall::predicate::always;

    mock! {
        pub Learner {}

        impl MachineLearner for Learner {
            fn description(&self) -> String;
            fn select_features(&self, training: &Dataset) -> LearnerResult<Vec<String>>;
            fn train_test(
                &self,
                training: &Dataset,
                test: &Dataset,
                cancel: &CancellationToken,
            ) -> LearnerResult<PredictionSet>;
        }
    }

    fn with_inner(source: &str, instance_id: &str, predicted: &str, probs: [f64; 2]) -> EnsemblePredictionInfo {
        let inner: PredictionSet = [
            Prediction::new("I1", "A", "A", vec![0.8, 0.2]),
            Prediction::new("I2", "B", "B", vec![0.3, 0.7]),
        ]
        .into_iter()
        .collect();
        EnsemblePredictionInfo::new(
            Prediction::new(instance_id, "A", predicted, probs.to_vec()),
            Arc::new(inner),
            source,
        )
    }

    fn fold() -> BTreeMap<String, EnsemblePredictionInfos> {
        BTreeMap::from([
            (
                "P1".to_string(),
                infos(
                    "P1",
                    vec![
                        with_inner("rna-seq.v2", "P1", "A", [0.9, 0.1]),
                        with_inner("clinical", "P1", "B", [0.4, 0.6]),
                    ],
                ),
            ),
            (
                "P2".to_string(),
                infos(
                    "P2",
                    vec![
                        with_inner("rna-seq.v2", "P2", "B", [0.2, 0.8]),
                        with_inner("clinical", "P2", "B", [0.1, 0.9]),
                    ],
                ),
            ),
        ])
    }

    #[test]
    fn test_probability_features_and_single_training_call() {
        let mut learner = MockLearner::new();
        learner.expect_description().return_const("meta".to_string());
        learner
            .expect_train_test()
            .with(always(), always(), always())
            .times(1)
            .returning(|training: &Dataset, test: &Dataset, _: &CancellationToken| {
                assert_eq!(training.len(), 2);
                let names: Vec<&str> = training.feature_names().into_iter().collect();
                assert_eq!(
                    names,
                    vec!["clinical_A", "clinical_B", "rna_seq_v2_A", "rna_seq_v2_B"]
                );
                assert_eq!(training.get("I2").unwrap().label.as_deref(), Some("B"));
                assert_eq!(
                    test.get("P1").unwrap().values.get("rna_seq_v2_A").map(String::as_str),
                    Some("0.9")
                );
                Ok(test
                    .iter()
                    .map(|(id, _)| Prediction::new(id, "A", "B", vec![0.25, 0.75]))
                    .collect())
            });

        let stacked = StackedEnsemble::new(context(1), StackingFeatures::Probabilities, Arc::new(learner));
        assert_eq!(stacked.kind(), CombinerKind::StackedProbabilities);

        let combined = stacked.combine_all(&fold(), &CancellationToken::new()).unwrap();
        assert_eq!(combined.len(), 2);
        assert_eq!(combined.get("P2").unwrap().predicted_label(), "B");
    }

    #[test]
    fn test_label_features() {
        let mut learner = MockLearner::new();
        learner.expect_description().return_const("meta".to_string());
        learner.expect_train_test().times(1).returning(|training: &Dataset, test: &Dataset, _: &CancellationToken| {
            let names: Vec<&str> = training.feature_names().into_iter().collect();
            assert_eq!(names, vec!["clinical", "rna_seq_v2"]);
            assert_eq!(
                test.get("P1").unwrap().values.get("clinical").map(String::as_str),
                Some("B")
            );
            Ok(test
                .iter()
                .map(|(id, _)| Prediction::new(id, "A", "A", vec![1.0, 0.0]))
                .collect())
        });

        let stacked = StackedEnsemble::new(context(1), StackingFeatures::PredictedLabels, Arc::new(learner));
        let single = stacked.combine("P1", &fold()["P1"]).unwrap();
        assert_eq!(single.predicted_label(), "A");
        assert_eq!(stacked.kind(), CombinerKind::StackedPredictions);
    }

    #[test]
    fn test_learner_failure_and_missing_rows() {
        let mut failing = MockLearner::new();
        failing.expect_description().return_const("meta".to_string());
        failing.expect_train_test().returning(|_: &Dataset, _: &Dataset, _: &CancellationToken| {
            Err(LearnerError::Failed {
                learner: "meta".into(),
                message: "exit status 1".into(),
            })
        });
        let err = StackedEnsemble::new(context(1), StackingFeatures::Probabilities, Arc::new(failing))
            .combine_all(&fold(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Learner(LearnerError::Failed { .. })));

        let mut partial = MockLearner::new();
        partial.expect_description().return_const("meta".to_string());
        partial
            .expect_train_test()
            .returning(|_: &Dataset, _: &Dataset, _: &CancellationToken| Ok(PredictionSet::new()));
        let err = StackedEnsemble::new(context(1), StackingFeatures::Probabilities, Arc::new(partial))
            .combine_all(&fold(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::MissingStackedPrediction { .. }));
    }

    #[test]
    fn test_interrupted_learner_interrupts_combination() {
        let mut learner = MockLearner::new();
        learner.expect_description().return_const("meta".to_string());
        learner
            .expect_train_test()
            .times(1)
            .returning(|_: &Dataset, _: &Dataset, cancel: &CancellationToken| {
                // The watchdog fires while the model trains
                cancel.cancel();
                Err(LearnerError::Interrupted {
                    learner: "meta".into(),
                })
            });

        let cancel = CancellationToken::new();
        let err = StackedEnsemble::new(context(1), StackingFeatures::Probabilities, Arc::new(learner))
            .combine_all(&fold(), &cancel)
            .unwrap_err();
        assert!(matches!(err, EnsembleError::Interrupted));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn test_no_inner_predictions_is_an_error() {
        let mut learner = MockLearner::new();
        learner.expect_train_test().never();
        let map = BTreeMap::from([(
            "P1".to_string(),
            infos("P1", vec![info("m1", "P1", "A", [1.0, 0.0])]),
        )]);
        let err = StackedEnsemble::new(context(1), StackingFeatures::Probabilities, Arc::new(learner))
            .combine_all(&map, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::NoTrainingData));
    }

    #[test]
    fn test_feature_name_sanitised() {
        assert_eq!(feature_name("rna-seq.v2_A"), "rna_seq_v2_A");
    }
}
