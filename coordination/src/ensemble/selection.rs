//! Combiners that pick one base prediction and pass it through unchanged

use super::voting::trivial_outcome;
use super::{Combiner, CombinerKind, EnsembleError, EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult};
use crate::context::RunContext;
use crate::predictions::Prediction;

/// The base prediction with the highest inner-fold weight.
///
/// Ties go to the first source in source-description order.
#[derive(Debug, Clone)]
pub struct SelectBest {
    ctx: RunContext,
}

impl SelectBest {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for SelectBest {
    fn kind(&self) -> CombinerKind {
        CombinerKind::SelectBest
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }

        let labels = self.ctx.labels();
        let mut best: Option<(&EnsemblePredictionInfo, f64)> = None;
        for info in infos.canonical() {
            let weight = info.weight(labels);
            let better = match best {
                None => true,
                Some((_, top)) => weight > top || (top.is_nan() && !weight.is_nan()),
            };
            if better {
                best = Some((info, weight));
            }
        }

        best.map(|(info, _)| info.outer().clone())
            .ok_or_else(|| EnsembleError::NoPredictions {
                instance_id: instance_id.to_string(),
            })
    }
}

/// The base prediction holding the single highest class probability.
///
/// When several predictions share that value one is drawn with the
/// instance's seeded random stream.
#[derive(Debug, Clone)]
pub struct MaxProbability {
    ctx: RunContext,
}

impl MaxProbability {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for MaxProbability {
    fn kind(&self) -> CombinerKind {
        CombinerKind::MaxProbability
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }

        let max = infos
            .outer_predictions()
            .flat_map(|p| p.class_probabilities().iter().copied())
            .fold(f64::NEG_INFINITY, f64::max);

        let holders: Vec<&Prediction> = infos
            .outer_predictions()
            .filter(|p| p.class_probabilities().contains(&max))
            .collect();

        match holders.as_slice() {
            [] => Err(EnsembleError::NoPredictions {
                instance_id: instance_id.to_string(),
            }),
            [only] => Ok((*only).clone()),
            tied => {
                let pick = self.ctx.instance_rng(instance_id).usize(..tied.len());
                Ok(tied[pick].clone())
            }
        }
    }
}
