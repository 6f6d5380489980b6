//! Probability-averaging combiners

use super::voting::{choose_label, normalize, trivial_outcome};
use super::{Combiner, CombinerKind, EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult};
use crate::context::RunContext;
use crate::predictions::Prediction;

/// Sum weighted class probabilities; the winner is chosen on the raw sums
fn summed_probabilities<W>(
    ctx: &RunContext,
    instance_id: &str,
    infos: &EnsemblePredictionInfos,
    weigh: W,
) -> EnsembleResult<Prediction>
where
    W: Fn(&EnsemblePredictionInfo) -> f64,
{
    let labels = ctx.labels();
    let mut sums = vec![0.0; labels.len()];
    for info in infos.iter() {
        info.outer().validate(labels)?;
        let weight = weigh(info);
        for (sum, p) in sums.iter_mut().zip(info.outer().class_probabilities()) {
            *sum += weight * p;
        }
    }

    let predicted = choose_label(ctx, instance_id, &sums)?;
    Ok(Prediction::new(
        instance_id,
        infos.true_label().unwrap_or_default(),
        predicted,
        normalize(&sums),
    ))
}

/// Average of the base class probabilities
#[derive(Debug, Clone)]
pub struct MeanProbability {
    ctx: RunContext,
}

impl MeanProbability {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for MeanProbability {
    fn kind(&self) -> CombinerKind {
        CombinerKind::MeanProbability
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }
        summed_probabilities(&self.ctx, instance_id, infos, |_| 1.0)
    }
}

/// Average of the base class probabilities, weighted by inner-fold weight
#[derive(Debug, Clone)]
pub struct WeightedMeanProbability {
    ctx: RunContext,
}

impl WeightedMeanProbability {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for WeightedMeanProbability {
    fn kind(&self) -> CombinerKind {
        CombinerKind::WeightedMeanProbability
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }
        let labels = self.ctx.labels();
        summed_probabilities(&self.ctx, instance_id, infos, |info| info.weight(labels))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::EnsembleError;
    use super::*;
    use crate::predictions::PredictionError;

    fn assert_sums_to_one(probs: &[f64]) {
        assert!((probs.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_mean_probability() {
        let combined = MeanProbability::new(context(1)).combine("P1", &p1([1.0; 3])).unwrap();
        assert_eq!(combined.predicted_label(), "A");
        let probs = combined.class_probabilities();
        assert!((probs[0] - 0.6).abs() < 1e-9);
        assert!((probs[1] - 0.4).abs() < 1e-9);
        assert_sums_to_one(probs);
    }

    #[test]
    fn test_weighted_mean_follows_heavy_model() {
        let combined = WeightedMeanProbability::new(context(1))
            .combine("P1", &p1([0.1, 0.1, 5.0]))
            .unwrap();
        assert_eq!(combined.predicted_label(), "B");
        assert_sums_to_one(combined.class_probabilities());
    }

    #[test]
    fn test_normalizes_unnormalized_inputs() {
        let infos = infos(
            "P2",
            vec![
                info("m1", "P2", "A", [3.0, 1.0]),
                info("m2", "P2", "B", [0.5, 2.5]).with_weight(2.0),
            ],
        );
        for combined in [
            MeanProbability::new(context(1)).combine("P2", &infos).unwrap(),
            WeightedMeanProbability::new(context(1)).combine("P2", &infos).unwrap(),
        ] {
            assert_sums_to_one(combined.class_probabilities());
        }
    }

    #[test]
    fn test_short_probability_vector_is_rejected() {
        let infos = infos(
            "P1",
            vec![
                info("m1", "P1", "A", [0.9, 0.1]),
                crate::ensemble::EnsemblePredictionInfo::new(
                    Prediction::new("P1", "A", "A", vec![1.0]),
                    std::sync::Arc::new(Default::default()),
                    "m2",
                ),
            ],
        );
        let err = MeanProbability::new(context(1)).combine("P1", &infos).unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::InvalidPrediction(PredictionError::ProbabilityLength { .. })
        ));
    }
}
