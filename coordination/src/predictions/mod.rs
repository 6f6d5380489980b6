//! Prediction data model
//!
//! A [`Prediction`] is one model's verdict for one instance; a
//! [`PredictionSet`] maps instance IDs to predictions and iterates in sorted
//! instance order so that everything derived from it is reproducible.

mod file;
mod metrics;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::LabelVocabulary;

pub use file::{read_predictions, write_predictions, PredictionFileError, INSTANCE_ID_COLUMN};
pub use metrics::PredictionResults;

/// Result type alias for prediction validation
pub type PredictionResult<T> = Result<T, PredictionError>;

/// A prediction that does not fit the run's label vocabulary
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictionError {
    #[error("Instance {instance_id}: label '{label}' is not in the vocabulary")]
    UnknownLabel { instance_id: String, label: String },

    #[error("Instance {instance_id}: {got} class probabilities for {expected} labels")]
    ProbabilityLength {
        instance_id: String,
        expected: usize,
        got: usize,
    },
}

/// One model's prediction for one instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    instance_id: String,
    true_label: String,
    predicted_label: String,
    class_probabilities: Vec<f64>,
}

impl Prediction {
    pub fn new(
        instance_id: impl Into<String>,
        true_label: impl Into<String>,
        predicted_label: impl Into<String>,
        class_probabilities: Vec<f64>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            true_label: true_label.into(),
            predicted_label: predicted_label.into(),
            class_probabilities,
        }
    }

    /// A prediction that puts all probability mass on `predicted_label`
    pub fn one_hot(
        labels: &LabelVocabulary,
        instance_id: impl Into<String>,
        true_label: impl Into<String>,
        predicted_label: impl Into<String>,
    ) -> Self {
        let predicted_label = predicted_label.into();
        let class_probabilities = labels
            .iter()
            .map(|l| if l == predicted_label { 1.0 } else { 0.0 })
            .collect();
        Self::new(instance_id, true_label, predicted_label, class_probabilities)
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn true_label(&self) -> &str {
        &self.true_label
    }

    pub fn predicted_label(&self) -> &str {
        &self.predicted_label
    }

    pub fn class_probabilities(&self) -> &[f64] {
        &self.class_probabilities
    }

    /// Probability assigned to `label`, if it is in the vocabulary
    pub fn probability_of(&self, labels: &LabelVocabulary, label: &str) -> Option<f64> {
        labels
            .index_of(label)
            .and_then(|i| self.class_probabilities.get(i).copied())
    }

    pub fn was_correct(&self) -> bool {
        self.true_label == self.predicted_label
    }

    /// Check the prediction against the label vocabulary
    pub fn validate(&self, labels: &LabelVocabulary) -> PredictionResult<()> {
        if self.class_probabilities.len() != labels.len() {
            return Err(PredictionError::ProbabilityLength {
                instance_id: self.instance_id.clone(),
                expected: labels.len(),
                got: self.class_probabilities.len(),
            });
        }
        if labels.index_of(&self.predicted_label).is_none() {
            return Err(PredictionError::UnknownLabel {
                instance_id: self.instance_id.clone(),
                label: self.predicted_label.clone(),
            });
        }
        Ok(())
    }
}

/// Predictions keyed by unique instance ID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionSet {
    predictions: BTreeMap<String, Prediction>,
}

impl PredictionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a prediction, returning the one it replaced
    pub fn insert(&mut self, prediction: Prediction) -> Option<Prediction> {
        self.predictions
            .insert(prediction.instance_id.clone(), prediction)
    }

    pub fn get(&self, instance_id: &str) -> Option<&Prediction> {
        self.predictions.get(instance_id)
    }

    pub fn contains(&self, instance_id: &str) -> bool {
        self.predictions.contains_key(instance_id)
    }

    pub fn len(&self) -> usize {
        self.predictions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.predictions.is_empty()
    }

    /// Predictions in instance-ID order
    pub fn iter(&self) -> impl Iterator<Item = &Prediction> {
        self.predictions.values()
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &str> {
        self.predictions.keys().map(String::as_str)
    }

    /// Both sets combined; `other` wins where instance IDs collide
    pub fn union(&self, other: &PredictionSet) -> PredictionSet {
        let mut merged = self.clone();
        merged.extend(other.iter().cloned());
        merged
    }

    /// Number of predictions whose predicted label is `label`
    pub fn count_predicted(&self, label: &str) -> usize {
        self.iter().filter(|p| p.predicted_label == label).count()
    }

    /// Distinct predicted labels
    pub fn predicted_labels(&self) -> BTreeSet<&str> {
        self.iter().map(|p| p.predicted_label.as_str()).collect()
    }

    /// Distinct true labels
    pub fn true_labels(&self) -> BTreeSet<&str> {
        self.iter().map(|p| p.true_label.as_str()).collect()
    }

    /// Validate every prediction against the vocabulary
    pub fn validate(&self, labels: &LabelVocabulary) -> PredictionResult<()> {
        self.iter().try_for_each(|p| p.validate(labels))
    }

    /// Every instance predicted correctly with full confidence.
    ///
    /// Stands in for inner-fold results when inner folds are not evaluated.
    pub fn all_correct<'a, I>(labels: &LabelVocabulary, instances: I) -> PredictionSet
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        instances
            .into_iter()
            .map(|(id, true_label)| Prediction::one_hot(labels, id, true_label, true_label))
            .collect()
    }
}

impl Extend<Prediction> for PredictionSet {
    fn extend<T: IntoIterator<Item = Prediction>>(&mut self, iter: T) {
        for prediction in iter {
            self.insert(prediction);
        }
    }
}

impl FromIterator<Prediction> for PredictionSet {
    fn from_iter<T: IntoIterator<Item = Prediction>>(iter: T) -> Self {
        let mut set = PredictionSet::new();
        set.extend(iter);
        set
    }
}

impl IntoIterator for PredictionSet {
    type Item = Prediction;
    type IntoIter = std::collections::btree_map::IntoValues<String, Prediction>;

    fn into_iter(self) -> Self::IntoIter {
        self.predictions.into_values()
    }
}

impl<'a> IntoIterator for &'a PredictionSet {
    type Item = &'a Prediction;
    type IntoIter = std::collections::btree_map::Values<'a, String, Prediction>;

    fn into_iter(self) -> Self::IntoIter {
        self.predictions.values()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels() -> LabelVocabulary {
        LabelVocabulary::new(["A", "B"]).unwrap()
    }

    #[test]
    fn test_one_hot_and_correctness() {
        let p = Prediction::one_hot(&labels(), "P1", "A", "B");
        assert_eq!(p.class_probabilities(), &[0.0, 1.0]);
        assert!(!p.was_correct());
        assert_eq!(p.probability_of(&labels(), "B"), Some(1.0));
        assert_eq!(p.probability_of(&labels(), "C"), None);
    }

    #[test]
    fn test_validation() {
        let labels = labels();
        assert!(Prediction::new("P1", "A", "A", vec![0.5, 0.5]).validate(&labels).is_ok());
        assert!(matches!(
            Prediction::new("P1", "A", "A", vec![1.0]).validate(&labels),
            Err(PredictionError::ProbabilityLength { expected: 2, got: 1, .. })
        ));
        assert!(matches!(
            Prediction::new("P1", "A", "C", vec![0.5, 0.5]).validate(&labels),
            Err(PredictionError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn test_set_aggregates_and_order() {
        let labels = labels();
        let set: PredictionSet = [
            Prediction::one_hot(&labels, "P3", "A", "B"),
            Prediction::one_hot(&labels, "P1", "A", "A"),
            Prediction::one_hot(&labels, "P2", "B", "B"),
        ]
        .into_iter()
        .collect();

        let ids: Vec<&str> = set.instance_ids().collect();
        assert_eq!(ids, vec!["P1", "P2", "P3"]);
        assert_eq!(set.count_predicted("B"), 2);
        assert_eq!(set.predicted_labels().into_iter().collect::<Vec<_>>(), vec!["A", "B"]);
    }

    #[test]
    fn test_union_prefers_other() {
        let labels = labels();
        let left: PredictionSet = [
            Prediction::one_hot(&labels, "P1", "A", "A"),
            Prediction::one_hot(&labels, "P2", "B", "A"),
        ]
        .into_iter()
        .collect();
        let right: PredictionSet = [Prediction::one_hot(&labels, "P2", "B", "B")]
            .into_iter()
            .collect();

        let merged = left.union(&right);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged.get("P2").unwrap().predicted_label(), "B");
        // Inputs untouched
        assert_eq!(left.get("P2").unwrap().predicted_label(), "A");
    }

    #[test]
    fn test_all_correct_defaults() {
        let set = PredictionSet::all_correct(&labels(), [("P1", "A"), ("P2", "B")]);
        assert!(set.iter().all(Prediction::was_correct));
        assert_eq!(set.get("P2").unwrap().class_probabilities(), &[0.0, 1.0]);
    }
}
