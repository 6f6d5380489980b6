//! Evaluation metrics over a prediction set

use std::collections::BTreeMap;

use super::PredictionSet;
use crate::context::LabelVocabulary;

/// Summary statistics for a set of predictions with known true labels
#[derive(Debug, Clone, Copy)]
pub struct PredictionResults<'a> {
    predictions: &'a PredictionSet,
}

impl<'a> PredictionResults<'a> {
    pub fn new(predictions: &'a PredictionSet) -> Self {
        Self { predictions }
    }

    pub fn predictions(&self) -> &'a PredictionSet {
        self.predictions
    }

    /// Fraction of predictions that were correct; 0 for an empty set
    pub fn accuracy(&self) -> f64 {
        let correct = self.predictions.iter().filter(|p| p.was_correct()).count();
        ratio(correct, self.predictions.len())
    }

    pub fn error_rate(&self) -> f64 {
        if self.predictions.is_empty() {
            return 0.0;
        }
        1.0 - self.accuracy()
    }

    /// Accuracy of always predicting the most frequent true label
    pub fn baseline_accuracy(&self) -> f64 {
        let most_frequent = self.true_label_counts().into_values().max().unwrap_or(0);
        ratio(most_frequent, self.predictions.len())
    }

    /// Accuracy gained over the baseline
    pub fn baseline_improvement(&self) -> f64 {
        self.accuracy() - self.baseline_accuracy()
    }

    /// One-vs-rest ROC area per label, weighted by how often the label is the
    /// true label.
    ///
    /// Labels that never occur, or that are the only label occurring, have no
    /// defined ROC area and are left out of the average. When no label
    /// qualifies the accuracy is returned instead.
    pub fn weighted_auc(&self, labels: &LabelVocabulary) -> f64 {
        let mut total = 0.0;
        let mut weight = 0usize;

        for (index, label) in labels.iter().enumerate() {
            let scored: Vec<(f64, bool)> = self
                .predictions
                .iter()
                .map(|p| {
                    let score = p.class_probabilities().get(index).copied().unwrap_or(0.0);
                    (score, p.true_label() == label)
                })
                .collect();

            let positives = scored.iter().filter(|(_, pos)| *pos).count();
            if let Some(auc) = rank_auc(scored) {
                total += auc * positives as f64;
                weight += positives;
            }
        }

        if weight == 0 {
            return self.accuracy();
        }
        total / weight as f64
    }

    fn true_label_counts(&self) -> BTreeMap<&'a str, usize> {
        let mut counts = BTreeMap::new();
        for p in self.predictions {
            *counts.entry(p.true_label()).or_insert(0) += 1;
        }
        counts
    }
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Mann-Whitney estimate of the ROC area; ties count half
fn rank_auc(mut scored: Vec<(f64, bool)>) -> Option<f64> {
    let positives = scored.iter().filter(|(_, pos)| *pos).count();
    let negatives = scored.len() - positives;
    if positives == 0 || negatives == 0 {
        return None;
    }

    scored.sort_by(|a, b| a.0.total_cmp(&b.0));

    // Sum of (1-based, tie-averaged) ranks held by positives
    let mut positive_rank_sum = 0.0;
    let mut start = 0;
    while start < scored.len() {
        let mut end = start;
        while end + 1 < scored.len() && scored[end + 1].0 == scored[start].0 {
            end += 1;
        }
        let average_rank = (start + end) as f64 / 2.0 + 1.0;
        let tied_positives = scored[start..=end].iter().filter(|(_, pos)| *pos).count();
        positive_rank_sum += average_rank * tied_positives as f64;
        start = end + 1;
    }

    let p = positives as f64;
    let n = negatives as f64;
    Some((positive_rank_sum - p * (p + 1.0) / 2.0) / (p * n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictions::Prediction;

    fn labels() -> LabelVocabulary {
        LabelVocabulary::new(["A", "B"]).unwrap()
    }

    fn set(rows: &[(&str, &str, &str, f64)]) -> PredictionSet {
        rows.iter()
            .map(|(id, truth, predicted, prob_a)| {
                Prediction::new(*id, *truth, *predicted, vec![*prob_a, 1.0 - prob_a])
            })
            .collect()
    }

    #[test]
    fn test_accuracy_and_baseline() {
        let predictions = set(&[
            ("P1", "A", "A", 0.9),
            ("P2", "A", "B", 0.4),
            ("P3", "A", "A", 0.8),
            ("P4", "B", "B", 0.2),
        ]);
        let results = PredictionResults::new(&predictions);

        assert!((results.accuracy() - 0.75).abs() < 1e-12);
        assert!((results.error_rate() - 0.25).abs() < 1e-12);
        assert!((results.baseline_accuracy() - 0.75).abs() < 1e-12);
        assert!(results.baseline_improvement().abs() < 1e-12);
    }

    #[test]
    fn test_empty_set_scores_zero() {
        let empty = PredictionSet::new();
        let results = PredictionResults::new(&empty);
        assert_eq!(results.accuracy(), 0.0);
        assert_eq!(results.error_rate(), 0.0);
        assert_eq!(results.weighted_auc(&labels()), 0.0);
    }

    #[test]
    fn test_perfect_ranking_has_unit_auc() {
        let predictions = set(&[
            ("P1", "A", "A", 0.9),
            ("P2", "A", "A", 0.7),
            ("P3", "B", "B", 0.3),
            ("P4", "B", "B", 0.1),
        ]);
        let auc = PredictionResults::new(&predictions).weighted_auc(&labels());
        assert!((auc - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_auc_counts_ties_as_half() {
        // One positive and one negative share a score
        let predictions = set(&[
            ("P1", "A", "A", 0.5),
            ("P2", "B", "A", 0.5),
        ]);
        let auc = PredictionResults::new(&predictions).weighted_auc(&labels());
        assert!((auc - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_falls_back_to_accuracy() {
        let predictions = set(&[("P1", "A", "A", 0.9), ("P2", "A", "B", 0.2)]);
        let auc = PredictionResults::new(&predictions).weighted_auc(&labels());
        assert!((auc - 0.5).abs() < 1e-12);
    }
}
