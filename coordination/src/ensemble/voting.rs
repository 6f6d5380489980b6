//! Vote-based combiners and the helpers shared by every strategy
//!
//! Majority and weighted voting differ only in how much one base prediction
//! adds to its label's bucket, so both go through [`weighted_vote`].

use tracing::trace;

use super::{Combiner, CombinerKind, EnsembleError, EnsemblePredictionInfo, EnsemblePredictionInfos, EnsembleResult};
use crate::context::RunContext;
use crate::predictions::{Prediction, PredictionError};

/// Check every base prediction against the vocabulary, fail on empty input,
/// otherwise the sole prediction when there is only one
pub(crate) fn trivial_outcome(
    ctx: &RunContext,
    instance_id: &str,
    infos: &EnsemblePredictionInfos,
) -> EnsembleResult<Option<Prediction>> {
    for prediction in infos.outer_predictions() {
        prediction.validate(ctx.labels())?;
    }
    match infos.len() {
        0 => Err(EnsembleError::NoPredictions {
            instance_id: instance_id.to_string(),
        }),
        1 => Ok(infos.outer_predictions().next().cloned()),
        _ => Ok(None),
    }
}

/// Index of a predicted label in the run vocabulary
pub(crate) fn label_index(ctx: &RunContext, prediction: &Prediction) -> EnsembleResult<usize> {
    ctx.labels()
        .index_of(prediction.predicted_label())
        .ok_or_else(|| {
            PredictionError::UnknownLabel {
                instance_id: prediction.instance_id().to_string(),
                label: prediction.predicted_label().to_string(),
            }
            .into()
        })
}

/// Label with the highest score; ties go to a seeded draw per instance
pub(crate) fn choose_label(ctx: &RunContext, instance_id: &str, scores: &[f64]) -> EnsembleResult<String> {
    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let leaders: Vec<usize> = scores
        .iter()
        .enumerate()
        .filter(|(_, score)| **score == max)
        .map(|(i, _)| i)
        .collect();

    let winner = match leaders.as_slice() {
        [] => {
            return Err(EnsembleError::NoPredictions {
                instance_id: instance_id.to_string(),
            })
        }
        [only] => *only,
        tied => {
            let pick = tied[ctx.instance_rng(instance_id).usize(..tied.len())];
            trace!(instance_id, tied = tied.len(), pick, "Tie broken by seeded draw");
            pick
        }
    };

    ctx.labels()
        .get(winner)
        .map(str::to_string)
        .ok_or_else(|| EnsembleError::NoPredictions {
            instance_id: instance_id.to_string(),
        })
}

/// Scale values to sum to one; spread evenly when there is nothing to scale
pub(crate) fn normalize(values: &[f64]) -> Vec<f64> {
    let total: f64 = values.iter().sum();
    if total > 0.0 && total.is_finite() {
        values.iter().map(|v| v / total).collect()
    } else {
        vec![1.0 / values.len() as f64; values.len()]
    }
}

/// Sum `weigh(info)` into each predicted label's bucket and pick the winner
fn weighted_vote<W>(
    ctx: &RunContext,
    instance_id: &str,
    infos: &EnsemblePredictionInfos,
    weigh: W,
) -> EnsembleResult<Prediction>
where
    W: Fn(&EnsemblePredictionInfo) -> f64,
{
    let mut totals = vec![0.0; ctx.labels().len()];
    let mut voted = vec![false; totals.len()];
    for info in infos.iter() {
        let index = label_index(ctx, info.outer())?;
        totals[index] += weigh(info);
        voted[index] = true;
    }

    // Labels nobody predicted never join a tie, even when every weight is zero
    let candidates: Vec<f64> = totals
        .iter()
        .zip(&voted)
        .map(|(total, voted)| if *voted { *total } else { f64::NEG_INFINITY })
        .collect();
    let predicted = choose_label(ctx, instance_id, &candidates)?;
    Ok(Prediction::new(
        instance_id,
        infos.true_label().unwrap_or_default(),
        predicted,
        normalize(&totals),
    ))
}

/// One vote per base prediction
#[derive(Debug, Clone)]
pub struct MajorityVote {
    ctx: RunContext,
}

impl MajorityVote {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for MajorityVote {
    fn kind(&self) -> CombinerKind {
        CombinerKind::MajorityVote
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }

        // Unanimous: the first prediction stands as is
        let mut outer = infos.outer_predictions();
        if let Some(first) = outer.next() {
            if outer.all(|p| p.predicted_label() == first.predicted_label()) {
                return Ok(first.clone());
            }
        }

        weighted_vote(&self.ctx, instance_id, infos, |_| 1.0)
    }
}

/// Each base prediction votes with its inner-fold weight
#[derive(Debug, Clone)]
pub struct WeightedVote {
    ctx: RunContext,
}

impl WeightedVote {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }
}

impl Combiner for WeightedVote {
    fn kind(&self) -> CombinerKind {
        CombinerKind::WeightedVote
    }

    fn combine(&self, instance_id: &str, infos: &EnsemblePredictionInfos) -> EnsembleResult<Prediction> {
        if let Some(only) = trivial_outcome(&self.ctx, instance_id, infos)? {
            return Ok(only);
        }
        let labels = self.ctx.labels();
        weighted_vote(&self.ctx, instance_id, infos, |info| info.weight(labels))
    }
}
